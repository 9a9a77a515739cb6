//! Frame codec
//!
//! The connection never assumes a concrete wire format; it encodes and decodes
//! frames through an injected [`Codec`].

use super::frame::ProtocolMessage;
use crate::errors::{RealtimeError, RealtimeResult};

/// Converts protocol messages to and from transport payloads
pub trait Codec: Send + Sync {
    fn encode(&self, message: &ProtocolMessage) -> RealtimeResult<Vec<u8>>;

    fn decode(&self, payload: &[u8]) -> RealtimeResult<ProtocolMessage>;

    /// Whether payloads must travel as binary frames
    fn is_binary(&self) -> bool;

    /// Value of the `format` connect parameter
    fn format(&self) -> &'static str;
}

/// JSON text codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &ProtocolMessage) -> RealtimeResult<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, payload: &[u8]) -> RealtimeResult<ProtocolMessage> {
        serde_json::from_slice(payload)
            .map_err(|e| RealtimeError::InvalidMessage(format!("Undecodable frame: {}", e)))
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn format(&self) -> &'static str {
        "json"
    }
}
