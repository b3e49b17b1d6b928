//! Manifest error types.
//!
//! Error codes:
//! - DSG_MANIFEST_IO (ERROR severity)
//! - DSG_MANIFEST_PARSE (ERROR severity)
//! - DSG_MANIFEST_INVALID_PATH (ERROR severity)
//! - DSG_MANIFEST_CHAIN (ERROR severity)

use std::fmt;
use std::io;

/// Manifest-specific error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestErrorCode {
    /// Read/write failure on a manifest or archive file
    DsgManifestIo,
    /// JSON or gzip decode failure
    DsgManifestParse,
    /// Entry path violates the path rules (relative, NFC, no `..`)
    DsgManifestInvalidPath,
    /// Snapshot chain linkage broken (id or hash mismatch)
    DsgManifestChain,
}

impl ManifestErrorCode {
    /// Returns the string code.
    pub fn code(&self) -> &'static str {
        match self {
            ManifestErrorCode::DsgManifestIo => "DSG_MANIFEST_IO",
            ManifestErrorCode::DsgManifestParse => "DSG_MANIFEST_PARSE",
            ManifestErrorCode::DsgManifestInvalidPath => "DSG_MANIFEST_INVALID_PATH",
            ManifestErrorCode::DsgManifestChain => "DSG_MANIFEST_CHAIN",
        }
    }
}

impl fmt::Display for ManifestErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Manifest error with message, optional detail, and optional I/O source.
#[derive(Debug)]
pub struct ManifestError {
    code: ManifestErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl ManifestError {
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: ManifestErrorCode::DsgManifestIo,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: ManifestErrorCode::DsgManifestParse,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self {
            code: ManifestErrorCode::DsgManifestInvalidPath,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn chain_error(message: impl Into<String>) -> Self {
        Self {
            code: ManifestErrorCode::DsgManifestChain,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn code(&self) -> ManifestErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ManifestErrorCode::DsgManifestIo.code(), "DSG_MANIFEST_IO");
        assert_eq!(
            ManifestErrorCode::DsgManifestInvalidPath.code(),
            "DSG_MANIFEST_INVALID_PATH"
        );
    }

    #[test]
    fn test_display_contains_code_and_details() {
        let err = ManifestError::parse_error("bad json").with_details("line 3");
        let s = format!("{}", err);
        assert!(s.contains("DSG_MANIFEST_PARSE"));
        assert!(s.contains("bad json"));
        assert!(s.contains("line 3"));
    }
}
