//! Configuration error types.
//!
//! Error codes:
//! - DSG_CONFIG_MISSING (ERROR severity)
//! - DSG_CONFIG_PARSE (ERROR severity)
//! - DSG_CONFIG_INVALID (ERROR severity)
//! - DSG_CONFIG_PERSONAL_FIELDS (ERROR severity)

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorCode {
    /// No config file found in any search location
    DsgConfigMissing,
    /// YAML failed to parse
    DsgConfigParse,
    /// Config parsed but violates a constraint
    DsgConfigInvalid,
    /// A system config carries personal fields
    DsgConfigPersonalFields,
}

impl ConfigErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigErrorCode::DsgConfigMissing => "DSG_CONFIG_MISSING",
            ConfigErrorCode::DsgConfigParse => "DSG_CONFIG_PARSE",
            ConfigErrorCode::DsgConfigInvalid => "DSG_CONFIG_INVALID",
            ConfigErrorCode::DsgConfigPersonalFields => "DSG_CONFIG_PERSONAL_FIELDS",
        }
    }
}

impl fmt::Display for ConfigErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct ConfigError {
    code: ConfigErrorCode,
    message: String,
    hint: Option<String>,
    source: Option<io::Error>,
}

impl ConfigError {
    pub fn missing(message: impl Into<String>) -> Self {
        Self {
            code: ConfigErrorCode::DsgConfigMissing,
            message: message.into(),
            hint: Some(
                "create ~/.config/dsg/dsg.yml with user_name and user_id".to_string(),
            ),
            source: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: ConfigErrorCode::DsgConfigParse,
            message: message.into(),
            hint: None,
            source: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ConfigErrorCode::DsgConfigInvalid,
            message: message.into(),
            hint: None,
            source: None,
        }
    }

    pub fn personal_fields(message: impl Into<String>) -> Self {
        Self {
            code: ConfigErrorCode::DsgConfigPersonalFields,
            message: message.into(),
            hint: Some(
                "move user_name and user_id into a per-user config file".to_string(),
            ),
            source: None,
        }
    }

    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: ConfigErrorCode::DsgConfigMissing,
            message: message.into(),
            hint: None,
            source: Some(source),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn code(&self) -> ConfigErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn recovery_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
