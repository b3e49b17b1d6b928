//! Storage error types.
//!
//! Error codes:
//! - DSG_CLIENT_FS (ERROR severity)
//! - DSG_REMOTE_FS (ERROR severity)
//! - DSG_ZFS_OPERATION (FATAL severity; a shelled-out zfs command failed)
//! - DSG_BACKEND_UNSUPPORTED (ERROR severity)

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// Client-side staging or commit failure
    DsgClientFs,
    /// Remote-side staging or commit failure
    DsgRemoteFs,
    /// A zfs command exited non-zero
    DsgZfsOperation,
    /// Configured backend exists in the config vocabulary but is not
    /// implemented
    DsgBackendUnsupported,
}

impl StorageErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::DsgClientFs => "DSG_CLIENT_FS",
            StorageErrorCode::DsgRemoteFs => "DSG_REMOTE_FS",
            StorageErrorCode::DsgZfsOperation => "DSG_ZFS_OPERATION",
            StorageErrorCode::DsgBackendUnsupported => "DSG_BACKEND_UNSUPPORTED",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageErrorCode::DsgZfsOperation)
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
    hint: Option<String>,
    source: Option<io::Error>,
}

impl StorageError {
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::DsgClientFs,
            message: message.into(),
            details: None,
            hint: None,
            source: None,
        }
    }

    pub fn client_io(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: StorageErrorCode::DsgClientFs,
            message: message.into(),
            details: None,
            hint: None,
            source: Some(source),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::DsgRemoteFs,
            message: message.into(),
            details: None,
            hint: None,
            source: None,
        }
    }

    pub fn remote_io(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: StorageErrorCode::DsgRemoteFs,
            message: message.into(),
            details: None,
            hint: None,
            source: Some(source),
        }
    }

    /// A zfs command failed; carries the command line and its output.
    pub fn zfs(command: &[&str], exit_code: i32, stderr: &str) -> Self {
        Self {
            code: StorageErrorCode::DsgZfsOperation,
            message: format!("zfs command failed with status {}", exit_code),
            details: Some(format!("{}: {}", command.join(" "), stderr.trim())),
            hint: Some("check ZFS pool health and dataset permissions on the server".to_string()),
            source: None,
        }
    }

    pub fn unsupported_backend(name: &str) -> Self {
        Self {
            code: StorageErrorCode::DsgBackendUnsupported,
            message: format!("backend '{}' is not yet supported", name),
            details: None,
            hint: Some("supported transports: ssh (zfs or xfs); rclone and ipfs are planned".to_string()),
            source: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn recovery_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::transport::TransportError> for StorageError {
    fn from(e: crate::transport::TransportError) -> Self {
        StorageError::remote(e.message().to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zfs_error_carries_command() {
        let err = StorageError::zfs(
            &["zfs", "promote", "tank/repo-sync-tx-1"],
            1,
            "dataset does not exist",
        );
        assert!(err.details().unwrap().contains("zfs promote"));
        assert!(err.code().is_fatal());
    }

    #[test]
    fn test_unsupported_backend_hint() {
        let err = StorageError::unsupported_backend("rclone");
        assert_eq!(err.code().code(), "DSG_BACKEND_UNSUPPORTED");
        assert!(err.recovery_hint().unwrap().contains("ssh"));
    }
}
