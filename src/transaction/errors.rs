//! Transaction error types.
//!
//! Error codes:
//! - DSG_TX_INTEGRITY (ERROR severity; size mismatch on a transfer, never
//!   retried as-is — the whole transfer retries at the retry layer)
//! - DSG_TX_COMMIT (ERROR severity; failure during the commit phase)
//! - DSG_TX_ROLLBACK (ERROR severity; best-effort cleanup failed)
//! - DSG_TX (ERROR severity; other transaction failure)

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorCode {
    /// Transferred byte count disagrees with the declared stream size
    DsgTxIntegrity,
    /// Post-begin failure during commit
    DsgTxCommit,
    /// Best-effort rollback cleanup failure
    DsgTxRollback,
    /// Umbrella for other transaction failures
    DsgTx,
}

impl TransactionErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            TransactionErrorCode::DsgTxIntegrity => "DSG_TX_INTEGRITY",
            TransactionErrorCode::DsgTxCommit => "DSG_TX_COMMIT",
            TransactionErrorCode::DsgTxRollback => "DSG_TX_ROLLBACK",
            TransactionErrorCode::DsgTx => "DSG_TX",
        }
    }
}

impl fmt::Display for TransactionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct TransactionError {
    code: TransactionErrorCode,
    message: String,
    transaction_id: String,
    hint: Option<String>,
    /// Rollback failures recorded alongside the primary error.
    rollback_errors: Vec<String>,
}

impl TransactionError {
    pub fn integrity(tx_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: TransactionErrorCode::DsgTxIntegrity,
            message: message.into(),
            transaction_id: tx_id.to_string(),
            hint: Some("retry the sync; the transfer will be repeated".to_string()),
            rollback_errors: Vec::new(),
        }
    }

    pub fn commit(tx_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: TransactionErrorCode::DsgTxCommit,
            message: message.into(),
            transaction_id: tx_id.to_string(),
            hint: None,
            rollback_errors: Vec::new(),
        }
    }

    pub fn rollback(tx_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: TransactionErrorCode::DsgTxRollback,
            message: message.into(),
            transaction_id: tx_id.to_string(),
            hint: None,
            rollback_errors: Vec::new(),
        }
    }

    pub fn general(tx_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: TransactionErrorCode::DsgTx,
            message: message.into(),
            transaction_id: tx_id.to_string(),
            hint: None,
            rollback_errors: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn record_rollback_error(&mut self, error: String) {
        self.rollback_errors.push(error);
    }

    pub fn code(&self) -> TransactionErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn recovery_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn rollback_errors(&self) -> &[String] {
        &self.rollback_errors
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (transaction {})",
            self.code.code(),
            self.message,
            self.transaction_id
        )
    }
}

impl std::error::Error for TransactionError {}

pub type TransactionResult<T> = Result<T, TransactionError>;
