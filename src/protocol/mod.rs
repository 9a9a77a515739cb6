//! # Realtime Protocol
//!
//! Wire model shared by the connection, channel and presence layers:
//! - **Action**: ordinal-stable frame kinds
//! - **ProtocolMessage**: the frame envelope
//! - **Message / PresenceMessage**: payloads
//! - **Codec**: pluggable frame encoding

pub mod action;
pub mod codec;
pub mod frame;
pub mod message;

pub use action::Action;
pub use codec::{Codec, JsonCodec};
pub use frame::{flags, AuthDetails, ConnectionDetails, ProtocolMessage};
pub use message::{now_millis, Message, PresenceAction, PresenceMessage};
