//! Transfer metrics.
//!
//! Counters only, monotonic, reset on process start. Thread-safe with
//! relaxed atomics; exactness matters, ordering does not.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransferMetrics {
    files_uploaded: AtomicU64,
    files_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    transfer_retries: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_upload(&self, bytes: u64) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.transfer_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commits(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rollbacks(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_uploaded(&self) -> u64 {
        self.files_uploaded.load(Ordering::Relaxed)
    }

    pub fn files_downloaded(&self) -> u64 {
        self.files_downloaded.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn transfer_retries(&self) -> u64 {
        self.transfer_retries.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics registry.
static GLOBAL: TransferMetrics = TransferMetrics {
    files_uploaded: AtomicU64::new(0),
    files_downloaded: AtomicU64::new(0),
    bytes_uploaded: AtomicU64::new(0),
    bytes_downloaded: AtomicU64::new(0),
    transfer_retries: AtomicU64::new(0),
    transactions_committed: AtomicU64::new(0),
    transactions_rolled_back: AtomicU64::new(0),
};

pub fn global() -> &'static TransferMetrics {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = TransferMetrics::new();
        m.add_upload(100);
        m.add_upload(50);
        m.add_download(7);
        m.increment_retries();
        assert_eq!(m.files_uploaded(), 2);
        assert_eq!(m.bytes_uploaded(), 150);
        assert_eq!(m.files_downloaded(), 1);
        assert_eq!(m.bytes_downloaded(), 7);
        assert_eq!(m.transfer_retries(), 1);
    }
}
