//! # Real-Time Client Errors
//!
//! Error types shared by every layer of the client.
//!
//! Two shapes exist:
//! - [`ErrorInfo`]: the structured error carried on the wire and handed to
//!   callers (numeric code, optional HTTP-style status, message).
//! - [`RealtimeError`]: the Rust error enum returned from fallible calls.
//!   Every variant maps back onto an `ErrorInfo`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Numeric error codes used by the protocol and by client-side failures.
pub mod codes {
    /// Generic bad request
    pub const BAD_REQUEST: u32 = 40000;
    /// Message larger than the connection allows
    pub const MESSAGE_TOO_LARGE: u32 = 40009;
    /// Explicit client id does not match the connection identity
    pub const INCOMPATIBLE_CLIENT_ID: u32 = 40012;
    /// Missing or invalid credentials
    pub const INVALID_CREDENTIALS: u32 = 40101;
    /// First token error code (inclusive)
    pub const TOKEN_ERROR_START: u32 = 40140;
    /// Token expired
    pub const TOKEN_EXPIRED: u32 = 40142;
    /// Last token error code (inclusive)
    pub const TOKEN_ERROR_END: u32 = 40149;
    /// Operation not permitted with the provided capability
    pub const NOT_PERMITTED: u32 = 40160;
    /// Internal client error
    pub const INTERNAL: u32 = 50000;
    /// Timed out waiting for a response
    pub const TIMEOUT: u32 = 50003;
    /// Connection failed
    pub const CONNECTION_FAILED: u32 = 80000;
    /// Connection suspended
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Connection disconnected
    pub const DISCONNECTED: u32 = 80003;
    /// Unable to recover the requested connection
    pub const UNABLE_TO_RECOVER: u32 = 80008;
    /// Connection closed
    pub const CONNECTION_CLOSED: u32 = 80017;
    /// Channel operation failed
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    /// Channel operation failed because of the channel state
    pub const INVALID_CHANNEL_STATE: u32 = 90001;
    /// Presence state is out of sync
    pub const PRESENCE_OUT_OF_SYNC: u32 = 91005;
}

/// Structured error information, as sent by the server and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Numeric error code
    pub code: u32,

    /// HTTP-style status code, when one applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Human readable description
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Create an error with a code and message
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code: None,
            message: message.into(),
        }
    }

    /// Create an error with a code, status and message
    pub fn with_status(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    /// Connection closed by the client
    pub fn connection_closed() -> Self {
        Self::with_status(codes::CONNECTION_CLOSED, 400, "Connection closed")
    }

    /// Connection suspended after repeated failures
    pub fn connection_suspended() -> Self {
        Self::with_status(codes::CONNECTION_SUSPENDED, 503, "Connection suspended")
    }

    /// Transport dropped
    pub fn disconnected() -> Self {
        Self::with_status(codes::DISCONNECTED, 503, "Connection disconnected")
    }

    /// Connection failed for good
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::with_status(codes::CONNECTION_FAILED, 400, message)
    }

    /// Timed out waiting for the server
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_status(codes::TIMEOUT, 504, message)
    }

    /// Operation not allowed in the current channel state
    pub fn invalid_channel_state(message: impl Into<String>) -> Self {
        Self::with_status(codes::INVALID_CHANNEL_STATE, 400, message)
    }

    /// Token-class error that may be fixed by renewing the token
    pub fn is_token_error(&self) -> bool {
        self.status_code.map_or(true, |s| s == 401)
            && (codes::TOKEN_ERROR_START..=codes::TOKEN_ERROR_END).contains(&self.code)
    }

    /// Server-side or network error after which a retry (possibly against a
    /// fallback host) makes sense
    pub fn is_retryable(&self) -> bool {
        match self.status_code {
            Some(status) => (500..=504).contains(&status),
            None => matches!(self.code, codes::DISCONNECTED | codes::CONNECTION_FAILED),
        }
    }

    /// Error that should move the connection straight to `Failed`
    pub fn is_fatal(&self) -> bool {
        matches!(self.status_code, Some(400..=499)) && !self.is_token_error()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{}/{}] {}", self.code, status, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {}

/// Real-time client errors
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    // ==================
    // Protocol Errors
    // ==================
    /// Error reported by the server, or attached to a state change
    #[error("{0}")]
    Protocol(ErrorInfo),

    /// Invalid or undecodable frame
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    // ==================
    // Connection Errors
    // ==================
    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timed out waiting for a response
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation not possible in the current connection state
    #[error("Invalid connection state: {0}")]
    InvalidConnectionState(String),

    // ==================
    // Channel Errors
    // ==================
    /// Operation not possible in the current channel state
    #[error("Invalid channel state: {0}")]
    InvalidChannelState(String),

    // ==================
    // Validation Errors
    // ==================
    /// Explicit client id does not match the authenticated identity
    #[error("Incompatible client id: {0}")]
    IncompatibleClientId(String),

    // ==================
    // Authorization Errors
    // ==================
    /// Could not obtain or renew credentials
    #[error("Authentication error: {0}")]
    AuthError(String),

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Numeric error code for this error
    pub fn code(&self) -> u32 {
        match self {
            RealtimeError::Protocol(info) => info.code,
            RealtimeError::InvalidMessage(_) => codes::BAD_REQUEST,
            RealtimeError::ConnectionClosed => codes::CONNECTION_CLOSED,
            RealtimeError::Timeout(_) => codes::TIMEOUT,
            RealtimeError::Transport(_) => codes::DISCONNECTED,
            RealtimeError::InvalidConnectionState(_) => codes::CONNECTION_FAILED,
            RealtimeError::InvalidChannelState(_) => codes::INVALID_CHANNEL_STATE,
            RealtimeError::IncompatibleClientId(_) => codes::INCOMPATIBLE_CLIENT_ID,
            RealtimeError::AuthError(_) => codes::INVALID_CREDENTIALS,
            RealtimeError::ConfigError(_) => codes::BAD_REQUEST,
            RealtimeError::Internal(_) => codes::INTERNAL,
        }
    }

    /// Structured form of this error
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            RealtimeError::Protocol(info) => info.clone(),
            RealtimeError::ConnectionClosed => ErrorInfo::connection_closed(),
            RealtimeError::Timeout(msg) => ErrorInfo::timeout(msg.clone()),
            RealtimeError::Transport(msg) => ErrorInfo::new(codes::DISCONNECTED, msg.clone()),
            RealtimeError::AuthError(msg) => {
                ErrorInfo::with_status(codes::INVALID_CREDENTIALS, 401, msg.clone())
            }
            other => ErrorInfo::with_status(other.code(), 400, other.to_string()),
        }
    }
}

impl From<ErrorInfo> for RealtimeError {
    fn from(info: ErrorInfo) -> Self {
        RealtimeError::Protocol(info)
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::InvalidMessage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RealtimeError::ConnectionClosed.code(), 80017);
        assert_eq!(
            RealtimeError::IncompatibleClientId("bob".into()).code(),
            codes::INCOMPATIBLE_CLIENT_ID
        );
        assert_eq!(RealtimeError::Timeout("ping".into()).code(), 50003);
    }

    #[test]
    fn test_token_error_classification() {
        let expired = ErrorInfo::with_status(codes::TOKEN_EXPIRED, 401, "Token expired");
        assert!(expired.is_token_error());
        assert!(!expired.is_fatal());

        let forbidden = ErrorInfo::with_status(codes::NOT_PERMITTED, 401, "No");
        assert!(!forbidden.is_token_error());
        assert!(forbidden.is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorInfo::with_status(50000, 500, "boom").is_retryable());
        assert!(ErrorInfo::disconnected().is_retryable());
        assert!(!ErrorInfo::with_status(40000, 400, "bad").is_retryable());
        assert!(ErrorInfo::new(codes::DISCONNECTED, "socket reset").is_retryable());
    }

    #[test]
    fn test_error_info_wire_format() {
        let info = ErrorInfo::with_status(40142, 401, "Token expired");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["statusCode"], 401);
        assert_eq!(json["code"], 40142);

        let back: ErrorInfo = serde_json::from_str(r#"{"code": 80003}"#).unwrap();
        assert_eq!(back.status_code, None);
        assert_eq!(back.message, "");
    }

    #[test]
    fn test_to_error_info_round_trip() {
        let info = ErrorInfo::connection_suspended();
        let err: RealtimeError = info.clone().into();
        assert_eq!(err.to_error_info(), info);
        assert_eq!(err.code(), codes::CONNECTION_SUSPENDED);
    }
}
