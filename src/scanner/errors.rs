//! Scanner error types.
//!
//! Error codes:
//! - DSG_SCAN_IO (ERROR severity)
//!
//! Per-file problems during a scan are warnings, not errors; only a failure
//! to walk the tree at all surfaces as a ScanError.

use std::fmt;
use std::io;

#[derive(Debug)]
pub struct ScanError {
    message: String,
    source: Option<io::Error>,
}

impl ScanError {
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[DSG_SCAN_IO] {}", self.message)
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type ScanResultT<T> = Result<T, ScanError>;
