//! # Connection
//!
//! Connection state machine, acknowledgement tracking and retry
//! bookkeeping. The state machine runs in its own task (see `manager`);
//! [`Connection`] is the handle the application holds.

pub mod ack;
pub mod attempts;
mod handle;
pub(crate) mod manager;
pub mod state;

pub use ack::{AckCallback, AckResult, AckTracker, PendingMessage};
pub use attempts::{AttemptsInfo, ConnectionAttempt, HostSelector};
pub use handle::Connection;
pub use manager::WILDCARD_CLIENT_ID;
pub use state::{ConnectionSnapshot, ConnectionState, ConnectionStateChange, RecoveryKey};
