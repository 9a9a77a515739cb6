//! Channel states and the state shared between a channel machine and its
//! public handles.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::{broadcast, watch};

use crate::errors::ErrorInfo;
use crate::handlers::Handlers;
use crate::protocol::{Message, PresenceMessage};

/// Capacity of each channel's state-change broadcast
const STATE_EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Failed => "failed",
        }
    }

    /// Attached, or on the way there
    pub fn is_attached_or_attaching(self) -> bool {
        matches!(self, ChannelState::Attaching | ChannelState::Attached)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notification emitted on every channel state transition
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub channel: String,
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// The attachment survived without message loss
    pub resumed: bool,
}

/// Per-channel options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Subscribing to messages attaches the channel (default: true)
    pub attach_on_subscribe: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            attach_on_subscribe: true,
        }
    }
}

/// Latest channel status, readable without a round trip to the connection task
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub reason: Option<ErrorInfo>,
    pub presence_sync_complete: bool,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Initialized,
            reason: None,
            presence_sync_complete: false,
        }
    }
}

/// Subscriber registries and status published by the channel machine
#[derive(Debug)]
pub(crate) struct ChannelShared {
    pub(crate) messages: Handlers<Message>,
    pub(crate) presence: Handlers<PresenceMessage>,
    options: Mutex<ChannelOptions>,
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<ChannelStateChange>,
}

impl ChannelShared {
    pub(crate) fn new(options: ChannelOptions) -> Self {
        let (status, _) = watch::channel(ChannelStatus::default());
        let (events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            messages: Handlers::new(),
            presence: Handlers::new(),
            options: Mutex::new(options),
            status,
            events,
        }
    }

    pub(crate) fn options(&self) -> ChannelOptions {
        self.options
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_options(&self, options: ChannelOptions) {
        *self.options.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = options;
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.events.subscribe()
    }

    pub(crate) fn publish_status(&self, status: ChannelStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn emit(&self, change: ChannelStateChange) {
        // No receivers is fine
        let _ = self.events.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_published() {
        let shared = ChannelShared::new(ChannelOptions::default());
        let mut events = shared.subscribe_events();
        assert_eq!(shared.status().state, ChannelState::Initialized);

        shared.publish_status(ChannelStatus {
            state: ChannelState::Attaching,
            ..Default::default()
        });
        shared.emit(ChannelStateChange {
            channel: "chat".into(),
            previous: ChannelState::Initialized,
            current: ChannelState::Attaching,
            reason: None,
            resumed: false,
        });

        assert_eq!(shared.status().state, ChannelState::Attaching);
        assert_eq!(events.try_recv().unwrap().current, ChannelState::Attaching);
    }

    #[test]
    fn test_state_helpers() {
        assert!(ChannelState::Attaching.is_attached_or_attaching());
        assert!(!ChannelState::Detaching.is_attached_or_attaching());
        assert_eq!(ChannelState::Failed.to_string(), "failed");
    }
}
