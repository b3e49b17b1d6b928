//! Lock error types.
//!
//! Error codes:
//! - DSG_LOCK_TIMEOUT (ERROR severity)
//! - DSG_LOCK_CONFLICT (ERROR severity)
//! - DSG_LOCK_IO (ERROR severity)

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorCode {
    /// Timed out waiting for the lock
    DsgLockTimeout,
    /// Held by another active holder
    DsgLockConflict,
    /// Store read/write failure during acquisition
    DsgLockIo,
}

impl LockErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            LockErrorCode::DsgLockTimeout => "DSG_LOCK_TIMEOUT",
            LockErrorCode::DsgLockConflict => "DSG_LOCK_CONFLICT",
            LockErrorCode::DsgLockIo => "DSG_LOCK_IO",
        }
    }
}

impl fmt::Display for LockErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct LockError {
    code: LockErrorCode,
    message: String,
    hint: Option<String>,
}

impl LockError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: LockErrorCode::DsgLockTimeout,
            message: message.into(),
            hint: Some("wait for the other operation to finish, or check for a stale lock".to_string()),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            code: LockErrorCode::DsgLockConflict,
            message: message.into(),
            hint: Some("another sync, init, or clone holds this repository".to_string()),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            code: LockErrorCode::DsgLockIo,
            message: message.into(),
            hint: None,
        }
    }

    pub fn code(&self) -> LockErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn recovery_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl std::error::Error for LockError {}

pub type LockResult<T> = Result<T, LockError>;
