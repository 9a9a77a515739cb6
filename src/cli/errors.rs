//! CLI-specific error types

use std::fmt;
use std::io;

use crate::errors::RealtimeError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file or flag error
    ConfigError,
    /// I/O error (stdout)
    IoError,
    /// Invalid argument value
    InvalidArgument,
    /// Could not establish the connection
    ConnectionFailed,
    /// The server rejected or never answered a request
    RequestFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AEROLINK_CLI_CONFIG_ERROR",
            Self::IoError => "AEROLINK_CLI_IO_ERROR",
            Self::InvalidArgument => "AEROLINK_CLI_INVALID_ARGUMENT",
            Self::ConnectionFailed => "AEROLINK_CLI_CONNECTION_FAILED",
            Self::RequestFailed => "AEROLINK_CLI_REQUEST_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConnectionFailed, msg)
    }

    pub fn request_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::RequestFailed, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<RealtimeError> for CliError {
    fn from(e: RealtimeError) -> Self {
        match e {
            RealtimeError::ConfigError(msg) => Self::config_error(msg),
            other => Self::request_failed(other.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_errors_map_to_cli_codes() {
        let config: CliError = RealtimeError::ConfigError("no key".into()).into();
        assert_eq!(config.code(), &CliErrorCode::ConfigError);

        let request: CliError = RealtimeError::Timeout("ping".into()).into();
        assert_eq!(request.code_str(), "AEROLINK_CLI_REQUEST_FAILED");
        assert!(request.to_string().contains("ping"));
    }
}
