//! Crate-wide error umbrella.
//!
//! Each domain module owns its coded error type; operations that span
//! modules (init, clone, sync, status) fold them into [`DsgError`], which
//! preserves the inner code for `--json` output and the recovery hint for
//! humans.

use thiserror::Error;

use crate::config::ConfigError;
use crate::locking::LockError;
use crate::manifest::ManifestError;
use crate::scanner::ScanError;
use crate::storage::StorageError;
use crate::transaction::TransactionError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DsgError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Lock(#[from] LockError),

    #[error("{0}")]
    Scan(#[from] ScanError),

    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Transaction(#[from] TransactionError),

    /// Planner-level and conflict-unresolved failures.
    #[error("[DSG_SYNC] {message}")]
    Sync {
        message: String,
        hint: Option<String>,
    },
}

impl DsgError {
    pub fn sync(message: impl Into<String>) -> Self {
        DsgError::Sync {
            message: message.into(),
            hint: None,
        }
    }

    pub fn sync_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        DsgError::Sync {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// Stable error kind for machine consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            DsgError::Config(e) => e.code().code(),
            DsgError::Lock(e) => e.code().code(),
            DsgError::Scan(_) => "DSG_SCAN_IO",
            DsgError::Manifest(e) => e.code().code(),
            DsgError::Storage(e) => e.code().code(),
            DsgError::Transport(e) => e.code().code(),
            DsgError::Transaction(e) => e.code().code(),
            DsgError::Sync { .. } => "DSG_SYNC",
        }
    }

    /// Remediation text, when one exists.
    pub fn recovery_hint(&self) -> Option<&str> {
        match self {
            DsgError::Config(e) => e.recovery_hint(),
            DsgError::Lock(e) => e.recovery_hint(),
            DsgError::Scan(_) => None,
            DsgError::Manifest(_) => None,
            DsgError::Storage(e) => e.recovery_hint(),
            DsgError::Transport(e) => e.recovery_hint(),
            DsgError::Transaction(e) => e.recovery_hint(),
            DsgError::Sync { hint, .. } => hint.as_deref(),
        }
    }

    /// Whether a caller may usefully retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            DsgError::Transport(e) => e.is_retryable(),
            DsgError::Lock(e) => {
                matches!(e.code(), crate::locking::errors::LockErrorCode::DsgLockTimeout)
            }
            _ => false,
        }
    }
}

pub type DsgResult<T> = Result<T, DsgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passes_through_inner_codes() {
        let e: DsgError = ConfigError::missing("no config").into();
        assert_eq!(e.kind(), "DSG_CONFIG_MISSING");

        let e = DsgError::sync("unresolved conflicts");
        assert_eq!(e.kind(), "DSG_SYNC");
    }

    #[test]
    fn test_retryable_classification() {
        let e: DsgError = TransportError::network("reset").into();
        assert!(e.is_retryable());
        let e: DsgError = TransportError::auth("denied").into();
        assert!(!e.is_retryable());
        let e = DsgError::sync("conflict");
        assert!(!e.is_retryable());
    }
}
