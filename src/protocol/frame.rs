//! # Protocol Messages
//!
//! The wire envelope exchanged with the realtime service.

use serde::{Deserialize, Serialize};

use super::action::Action;
use super::message::{Message, PresenceMessage};
use crate::errors::ErrorInfo;

/// Bit flags carried in [`ProtocolMessage::flags`]
pub mod flags {
    /// The channel has members; a presence sync will follow
    pub const HAS_PRESENCE: u32 = 1 << 0;
    /// Backlog messages will follow the attach
    pub const HAS_BACKLOG: u32 = 1 << 1;
    /// The attach resumed a previous attachment without message loss
    pub const RESUMED: u32 = 1 << 2;
}

/// Connection parameters granted by the server in a `Connected` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Identity assigned to this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,

    /// Millis the server keeps connection state after a drop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,

    /// Millis between server heartbeats/activity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
}

/// Credentials sent with an `Auth` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// Wire-level envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Channel cursor; during a presence sync `{sync_id}:{cursor}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,

    /// Number of messages acknowledged by an `Ack`/`Nack`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            msg_serial: None,
            count: None,
            flags: None,
            timestamp: None,
            messages: None,
            presence: None,
            error: None,
            connection_details: None,
            auth: None,
        }
    }

    /// Frame addressed to a channel
    pub fn for_channel(action: Action, channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(action)
        }
    }

    /// `Message` frame carrying data messages
    pub fn messages(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::for_channel(Action::Message, channel)
        }
    }

    /// `Presence` frame carrying presence updates
    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        Self {
            presence: Some(presence),
            ..Self::for_channel(Action::Presence, channel)
        }
    }

    /// `Ack`/`Nack` frame covering `count` serials from `msg_serial`
    pub fn ack(action: Action, msg_serial: i64, count: i64) -> Self {
        Self {
            msg_serial: Some(msg_serial),
            count: Some(count),
            ..Self::new(action)
        }
    }

    /// Whether the server acknowledges this frame
    pub fn ack_required(&self) -> bool {
        matches!(self.action, Action::Message | Action::Presence)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.map_or(false, |f| f & flag == flag)
    }

    /// Last serial covered by an `Ack`/`Nack`: `msg_serial + count - 1`.
    /// `None` when the range does not fit in an `i64`.
    pub fn end_serial(&self) -> Option<i64> {
        let start = self.msg_serial?;
        let count = self.count.unwrap_or(1).max(1);
        start.checked_add(count - 1)
    }

    /// Fill in ids, connection ids and timestamps that the server leaves
    /// implicit on the individual messages of an inbound frame.
    pub fn populate_inbound_fields(&mut self) {
        let frame_id = self.id.clone();
        let connection_id = self.connection_id.clone();
        let timestamp = self.timestamp;

        if let Some(messages) = self.messages.as_mut() {
            for (index, msg) in messages.iter_mut().enumerate() {
                if msg.id.is_none() {
                    msg.id = frame_id.as_ref().map(|id| format!("{}:{}", id, index));
                }
                if msg.connection_id.is_none() {
                    msg.connection_id = connection_id.clone();
                }
                if msg.timestamp.is_none() {
                    msg.timestamp = timestamp;
                }
            }
        }

        if let Some(presence) = self.presence.as_mut() {
            for (index, msg) in presence.iter_mut().enumerate() {
                if msg.id.is_none() {
                    msg.id = frame_id.as_ref().map(|id| format!("{}:{}", id, index));
                }
                if msg.connection_id.is_none() {
                    msg.connection_id = connection_id.clone();
                }
                if msg.timestamp.is_none() {
                    msg.timestamp = timestamp;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceAction;
    use serde_json::json;

    #[test]
    fn test_parse_connected_frame() {
        let raw = r#"{
            "action": 4,
            "connectionId": "abc",
            "connectionKey": "abc!key",
            "connectionSerial": -1,
            "connectionDetails": {"clientId": "alice", "maxIdleInterval": 15000}
        }"#;

        let msg: ProtocolMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.action, Action::Connected);
        assert_eq!(msg.connection_key.as_deref(), Some("abc!key"));
        let details = msg.connection_details.unwrap();
        assert_eq!(details.client_id.as_deref(), Some("alice"));
        assert_eq!(details.max_idle_interval, Some(15000));
    }

    #[test]
    fn test_ack_required() {
        assert!(ProtocolMessage::messages("c", vec![]).ack_required());
        assert!(ProtocolMessage::presence("c", vec![]).ack_required());
        assert!(!ProtocolMessage::for_channel(Action::Attach, "c").ack_required());
    }

    #[test]
    fn test_end_serial() {
        assert_eq!(ProtocolMessage::ack(Action::Ack, 3, 2).end_serial(), Some(4));
        assert_eq!(ProtocolMessage::ack(Action::Nack, 0, 1).end_serial(), Some(0));
        assert_eq!(ProtocolMessage::new(Action::Ack).end_serial(), None);
    }

    #[test]
    fn test_end_serial_overflow_is_none() {
        assert_eq!(ProtocolMessage::ack(Action::Ack, i64::MAX, 2).end_serial(), None);
        assert_eq!(ProtocolMessage::ack(Action::Ack, i64::MAX, 1).end_serial(), Some(i64::MAX));
    }

    #[test]
    fn test_flags() {
        let mut msg = ProtocolMessage::for_channel(Action::Attached, "c");
        assert!(!msg.has_flag(flags::HAS_PRESENCE));
        msg.flags = Some(flags::HAS_PRESENCE | flags::RESUMED);
        assert!(msg.has_flag(flags::HAS_PRESENCE));
        assert!(msg.has_flag(flags::RESUMED));
        assert!(!msg.has_flag(flags::HAS_BACKLOG));
    }

    #[test]
    fn test_populate_inbound_fields() {
        let mut frame = ProtocolMessage::messages(
            "chat",
            vec![Message::new("a", json!(1)), Message::new("b", json!(2))],
        );
        frame.id = Some("conn-1:7".into());
        frame.connection_id = Some("conn-1".into());
        frame.timestamp = Some(1_000);
        frame.presence = Some(vec![PresenceMessage::new(PresenceAction::Enter, "alice", None)]);

        frame.populate_inbound_fields();

        let messages = frame.messages.unwrap();
        assert_eq!(messages[1].id.as_deref(), Some("conn-1:7:1"));
        assert_eq!(messages[0].connection_id.as_deref(), Some("conn-1"));
        assert_eq!(messages[0].timestamp, Some(1_000));

        let presence = frame.presence.unwrap();
        assert_eq!(presence[0].member_key(), "conn-1:alice");
    }

    #[test]
    fn test_outbound_omits_empty_fields() {
        let frame = ProtocolMessage::for_channel(Action::Attach, "chat");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json, json!({"action": 10, "channel": "chat"}));
    }
}
