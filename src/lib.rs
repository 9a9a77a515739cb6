//! aerolink - a realtime pub/sub client
//!
//! One connection per client, multiplexing named channels. Publishes are
//! acknowledged in order, channels re-attach across reconnects, and
//! presence is kept in sync with the server.
//!
//! ```no_run
//! use aerolink::{ClientOptions, Realtime};
//! use serde_json::json;
//!
//! # async fn demo() -> aerolink::RealtimeResult<()> {
//! let client = Realtime::new(ClientOptions::with_key("app.id:secret"))?;
//! let channel = client.channels().get("chat");
//! channel.subscribe(|message| println!("{:?}", message.data));
//! channel.publish("greeting", json!({"text": "hi"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod handlers;
pub mod presence;
pub mod protocol;
pub mod transport;

pub use auth::{AuthProvider, Credentials, TokenDetails};
pub use channel::{ChannelOptions, ChannelState, ChannelStateChange, Channels, RealtimeChannel};
pub use client::{Realtime, RealtimeBuilder};
pub use config::ClientOptions;
pub use connection::{AckResult, Connection, ConnectionState, ConnectionStateChange, RecoveryKey};
pub use errors::{ErrorInfo, RealtimeError, RealtimeResult};
pub use handlers::{Handlers, SubscriptionId};
pub use presence::Presence;
pub use protocol::{Message, PresenceAction, PresenceMessage, ProtocolMessage};
