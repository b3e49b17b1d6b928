//! Exponential backoff for transport-level transfers.
//!
//! Base delay 1 s, doubling per attempt, capped by configuration, with
//! optional jitter. Only errors the transport classifies as retryable are
//! retried; authentication and integrity failures propagate immediately.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::observability::{metrics, Logger};
use crate::transport::{TransportError, TransportResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        if self.jitter && !capped.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
            capped + Duration::from_millis(jitter_ms)
        } else {
            capped
        }
    }

    /// Run `operation`, retrying retryable transport failures.
    pub fn run<T, F>(&self, what: &str, mut operation: F) -> TransportResult<T>
    where
        F: FnMut() -> TransportResult<T>,
    {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    Logger::warn(
                        "TRANSFER_RETRY",
                        &[
                            ("what", what),
                            ("attempt", &(attempt + 1).to_string()),
                            ("delay_ms", &delay.as_millis().to_string()),
                            ("error", e.message()),
                        ],
                    );
                    metrics::global().increment_retries();
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
