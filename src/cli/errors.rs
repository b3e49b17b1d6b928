//! # CLI Errors

use thiserror::Error;

use crate::errors::DsgError;

pub type CliResult<T> = Result<T, CliError>;

/// Exit code for operational failures.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code when the user interrupts the process.
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Dsg(#[from] DsgError),

    #[error("{0}")]
    Usage(String),

    /// Validation command found problems; they were already printed.
    #[error("{count} problem(s) found")]
    ValidationFailed { count: usize },

    #[error("interrupted")]
    Interrupted,
}

impl CliError {
    pub fn usage(message: impl Into<String>) -> Self {
        CliError::Usage(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CliError::Dsg(e) => e.kind(),
            CliError::Usage(_) => "DSG_USAGE",
            CliError::ValidationFailed { .. } => "DSG_VALIDATION",
            CliError::Interrupted => "DSG_INTERRUPTED",
        }
    }

    pub fn recovery_hint(&self) -> Option<&str> {
        match self {
            CliError::Dsg(e) => e.recovery_hint(),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }
}
