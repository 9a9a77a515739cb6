//! Protocol actions
//!
//! Ordinals are part of the wire contract and must never be renumbered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Action carried by a [`ProtocolMessage`](super::ProtocolMessage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
}

impl Action {
    /// Wire ordinal
    pub fn ordinal(self) -> u8 {
        match self {
            Action::Heartbeat => 0,
            Action::Ack => 1,
            Action::Nack => 2,
            Action::Connect => 3,
            Action::Connected => 4,
            Action::Disconnect => 5,
            Action::Disconnected => 6,
            Action::Close => 7,
            Action::Closed => 8,
            Action::Error => 9,
            Action::Attach => 10,
            Action::Attached => 11,
            Action::Detach => 12,
            Action::Detached => 13,
            Action::Presence => 14,
            Action::Message => 15,
            Action::Sync => 16,
            Action::Auth => 17,
        }
    }

    /// Actions that are addressed to a single channel
    pub fn is_channel_scoped(self) -> bool {
        matches!(
            self,
            Action::Attach
                | Action::Attached
                | Action::Detach
                | Action::Detached
                | Action::Presence
                | Action::Message
                | Action::Sync
        )
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        let action = match value {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => return Err(format!("unknown protocol action {}", other)),
        };
        Ok(action)
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action.ordinal()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Heartbeat => "HEARTBEAT",
            Action::Ack => "ACK",
            Action::Nack => "NACK",
            Action::Connect => "CONNECT",
            Action::Connected => "CONNECTED",
            Action::Disconnect => "DISCONNECT",
            Action::Disconnected => "DISCONNECTED",
            Action::Close => "CLOSE",
            Action::Closed => "CLOSED",
            Action::Error => "ERROR",
            Action::Attach => "ATTACH",
            Action::Attached => "ATTACHED",
            Action::Detach => "DETACH",
            Action::Detached => "DETACHED",
            Action::Presence => "PRESENCE",
            Action::Message => "MESSAGE",
            Action::Sync => "SYNC",
            Action::Auth => "AUTH",
        };
        write!(f, "{}", name)
    }
}
