//! Transport error types.
//!
//! Error codes:
//! - DSG_NETWORK (ERROR severity, retryable)
//! - DSG_CONNECT_TIMEOUT (ERROR severity, retryable)
//! - DSG_AUTH (ERROR severity, not retryable)
//! - DSG_TRANSPORT_IO (ERROR severity, retryable)
//!
//! The retry layer consults [`TransportError::is_retryable`]; authentication
//! failures never retry.

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// Connection refused, reset, or otherwise failed mid-flight
    DsgNetwork,
    /// Handshake or command exceeded its deadline
    DsgConnectTimeout,
    /// Authentication or permission failure on the remote
    DsgAuth,
    /// Local or remote I/O failure while moving bytes
    DsgTransportIo,
}

impl TransportErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            TransportErrorCode::DsgNetwork => "DSG_NETWORK",
            TransportErrorCode::DsgConnectTimeout => "DSG_CONNECT_TIMEOUT",
            TransportErrorCode::DsgAuth => "DSG_AUTH",
            TransportErrorCode::DsgTransportIo => "DSG_TRANSPORT_IO",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportErrorCode::DsgAuth)
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct TransportError {
    code: TransportErrorCode,
    message: String,
    hint: Option<String>,
    source: Option<io::Error>,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: TransportErrorCode::DsgNetwork,
            message: message.into(),
            hint: Some("check network connectivity to the remote host".to_string()),
            source: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: TransportErrorCode::DsgConnectTimeout,
            message: message.into(),
            hint: Some("the remote host may be slow or unreachable".to_string()),
            source: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            code: TransportErrorCode::DsgAuth,
            message: message.into(),
            hint: Some("check SSH keys and remote permissions".to_string()),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: TransportErrorCode::DsgTransportIo,
            message: message.into(),
            hint: None,
            source: Some(source),
        }
    }

    pub fn io_message(message: impl Into<String>) -> Self {
        Self {
            code: TransportErrorCode::DsgTransportIo,
            message: message.into(),
            hint: None,
            source: None,
        }
    }

    /// Classify an ssh subprocess failure from its stderr.
    pub fn from_ssh_stderr(context: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("permission denied")
            || lower.contains("authentication failed")
            || lower.contains("host key verification failed")
        {
            Self::auth(format!("{}: {}", context, stderr.trim()))
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::timeout(format!("{}: {}", context, stderr.trim()))
        } else {
            Self::network(format!("{}: {}", context, stderr.trim()))
        }
    }

    pub fn code(&self) -> TransportErrorCode {
        self.code
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn recovery_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_not_retryable() {
        assert!(!TransportError::auth("denied").is_retryable());
        assert!(TransportError::network("reset").is_retryable());
        assert!(TransportError::timeout("slow").is_retryable());
    }

    #[test]
    fn test_ssh_stderr_classification() {
        let auth = TransportError::from_ssh_stderr("connect", "Permission denied (publickey)");
        assert_eq!(auth.code(), TransportErrorCode::DsgAuth);

        let timeout =
            TransportError::from_ssh_stderr("connect", "connection timed out");
        assert_eq!(timeout.code(), TransportErrorCode::DsgConnectTimeout);

        let network =
            TransportError::from_ssh_stderr("connect", "Connection refused");
        assert_eq!(network.code(), TransportErrorCode::DsgNetwork);
    }
}
