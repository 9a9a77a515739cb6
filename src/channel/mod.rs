//! # Channels
//!
//! Per-channel attach/detach lifecycle, publish queuing and message
//! dispatch. The state machine (`machine`) runs inside the connection task;
//! [`RealtimeChannel`] and [`Channels`] are the application-facing handles.

mod handle;
pub(crate) mod machine;
mod registry;
pub mod state;

pub use handle::RealtimeChannel;
pub use registry::Channels;
pub use state::{ChannelOptions, ChannelState, ChannelStateChange, ChannelStatus};
