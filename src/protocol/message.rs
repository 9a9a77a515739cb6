//! # Message Payloads
//!
//! Data messages and presence messages carried inside protocol frames.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time in millis since Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A data message published on a channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id (assigned by the server when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Publishing client identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Publishing connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Millis since Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Payload encoding chain, left untouched by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,

    /// Opaque extension data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl Message {
    /// Create a message with an event name and payload
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Set an explicit client id
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Presence action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PresenceAction {
    /// Sync witness of a member that has left
    Absent,
    /// Member reported during sync
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        }
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(format!("unknown presence action {}", other)),
        }
    }
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> Self {
        match action {
            PresenceAction::Absent => 0,
            PresenceAction::Present => 1,
            PresenceAction::Enter => 2,
            PresenceAction::Leave => 3,
            PresenceAction::Update => 4,
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Membership change or state of a single presence member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Millis since Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, client_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            action,
            id: None,
            client_id: client_id.into(),
            connection_id: None,
            data,
            timestamp: None,
        }
    }

    /// Key identifying a member: `{connection_id}:{client_id}`
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.connection_id.as_deref().unwrap_or_default(),
            self.client_id
        )
    }

    /// Whether this message supersedes `other` for the same member.
    /// Equal timestamps favor the later arrival, so only a strictly greater
    /// timestamp counts as newer.
    pub fn is_newer_than(&self, other: &PresenceMessage) -> bool {
        self.timestamp.unwrap_or(0) > other.timestamp.unwrap_or(0)
    }
}
