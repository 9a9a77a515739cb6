//! Connection states
//!
//! Transitions are only ever applied by the connection task, one at a time.

use std::fmt;
use std::time::Duration;

use crate::errors::ErrorInfo;

/// Lifecycle state of the realtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Frames can be written to the transport
    pub fn can_send(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Messages may be held until the connection is established,
    /// provided queuing is enabled
    pub fn can_queue(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Disconnected
        )
    }

    /// Only an explicit `connect()` leaves these states
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which pending acknowledgements are failed
    pub fn fails_pending(self) -> bool {
        matches!(
            self,
            ConnectionState::Suspended | ConnectionState::Closed | ConnectionState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notification emitted on every connection state transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic connection attempt, when one is scheduled
    pub retry_in: Option<Duration>,
}

/// Connection identity and current state, published to client handles
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub key: Option<String>,
    pub serial: Option<i64>,
    pub client_id: Option<String>,
    pub error_reason: Option<ErrorInfo>,
    pub host: Option<String>,
}

impl ConnectionSnapshot {
    pub(crate) fn initial(client_id: Option<String>) -> Self {
        Self {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            serial: None,
            client_id,
            error_reason: None,
            host: None,
        }
    }

    /// True iff the connection can be resumed: a key and a serial are known
    pub fn connection_resumable(&self) -> bool {
        self.key.as_deref().map_or(false, |k| !k.is_empty()) && self.serial.is_some()
    }

    /// `{key}:{serial}` when the connection is resumable
    pub fn recovery_key(&self) -> Option<String> {
        if !self.connection_resumable() {
            return None;
        }
        let key = self.key.as_deref()?;
        let serial = self.serial?;
        Some(RecoveryKey::new(key, serial).to_string())
    }
}

/// Parsed form of a recovery key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKey {
    pub connection_key: String,
    pub serial: i64,
}

impl RecoveryKey {
    pub fn new(connection_key: impl Into<String>, serial: i64) -> Self {
        Self {
            connection_key: connection_key.into(),
            serial,
        }
    }

    /// Parse `{key}:{serial}`. The key itself may contain `:`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (key, serial) = raw.rsplit_once(':')?;
        if key.is_empty() {
            return None;
        }
        let serial = serial.parse().ok()?;
        Some(Self::new(key, serial))
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_key, self.serial)
    }
}
