//! Public channel handle

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::state::{ChannelOptions, ChannelShared, ChannelState, ChannelStateChange, ChannelStatus};
use crate::connection::manager::{validate_client_ids, Command};
use crate::connection::{AckCallback, AckResult, Connection};
use crate::errors::{ErrorInfo, RealtimeError, RealtimeResult};
use crate::handlers::SubscriptionId;
use crate::presence::Presence;
use crate::protocol::{Message, ProtocolMessage};

/// Handle to one named channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct RealtimeChannel {
    name: Arc<str>,
    connection: Connection,
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl RealtimeChannel {
    pub(crate) fn new(name: &str, connection: Connection, shared: Arc<ChannelShared>) -> Self {
        Self {
            name: Arc::from(name),
            connection,
            shared,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.status().state
    }

    /// Error behind the last transition, if any
    pub fn reason(&self) -> Option<ErrorInfo> {
        self.shared.status().reason
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.status()
    }

    pub fn options(&self) -> ChannelOptions {
        self.shared.options()
    }

    pub fn set_options(&self, options: ChannelOptions) {
        self.shared.set_options(options);
    }

    /// Stream of state transitions from now on
    pub fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.shared.subscribe_events()
    }

    /// Latest status, updated on every transition
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.watch_status()
    }

    pub fn presence(&self) -> Presence {
        Presence::new(self.clone())
    }

    // ==================
    // Attach / detach
    // ==================

    /// Attach and wait for the server to confirm
    pub async fn attach(&self) -> RealtimeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.connection.send_command(Command::Attach {
            name: self.name.to_string(),
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| RealtimeError::ConnectionClosed)?
    }

    /// Detach and wait for the server to confirm
    pub async fn detach(&self) -> RealtimeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.connection.send_command(Command::Detach {
            name: self.name.to_string(),
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| RealtimeError::ConnectionClosed)?
    }

    /// Attach without waiting for the outcome
    pub(crate) fn request_attach(&self) {
        let command = Command::Attach {
            name: self.name.to_string(),
            reply: None,
        };
        if self.connection.send_command(command).is_err() {
            tracing::debug!(channel = %self.name, "attach requested after the connection task stopped");
        }
    }

    // ==================
    // Publish
    // ==================

    /// Publish one message and wait for the server's acknowledgement
    pub async fn publish(&self, name: impl Into<String>, data: Value) -> RealtimeResult<()> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    pub async fn publish_message(&self, message: Message) -> RealtimeResult<()> {
        self.publish_messages(vec![message]).await
    }

    /// Publish several messages in one frame. They are acknowledged together.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> RealtimeResult<()> {
        let frame = ProtocolMessage::messages(self.name.to_string(), messages);
        self.publish_frame(frame).await
    }

    /// Callback flavor of [`RealtimeChannel::publish_messages`]. Validation
    /// failures are returned directly and the callback is not invoked.
    pub fn publish_with_callback(
        &self,
        messages: Vec<Message>,
        callback: impl FnOnce(AckResult) + Send + 'static,
    ) -> RealtimeResult<()> {
        let frame = ProtocolMessage::messages(self.name.to_string(), messages);
        self.submit(frame, AckCallback::new(callback))
    }

    pub(crate) async fn publish_frame(&self, frame: ProtocolMessage) -> RealtimeResult<()> {
        let (callback, rx) = AckCallback::channel();
        self.submit(frame, callback)?;
        match rx.await {
            Ok(result) => result.map_err(RealtimeError::Protocol),
            Err(_) => Err(RealtimeError::ConnectionClosed),
        }
    }

    /// Checks that can be answered without the connection task, then hand
    /// the frame over
    fn submit(&self, frame: ProtocolMessage, callback: AckCallback) -> RealtimeResult<()> {
        let state = self.state();
        if matches!(
            state,
            ChannelState::Detaching | ChannelState::Detached | ChannelState::Failed
        ) {
            return Err(RealtimeError::InvalidChannelState(format!(
                "Cannot publish to channel '{}' in state {}",
                self.name, state
            )));
        }
        let identity = self.connection.client_id();
        validate_client_ids(identity.as_deref(), &frame)
            .map_err(|info| RealtimeError::IncompatibleClientId(info.message))?;

        self.connection.send_command(Command::Publish {
            name: self.name.to_string(),
            message: frame,
            callback,
        })
    }

    // ==================
    // Subscribe
    // ==================

    fn attach_for_subscribe(&self) {
        if self.shared.options().attach_on_subscribe && !self.state().is_attached_or_attaching() {
            self.request_attach();
        }
    }

    /// Receive every message on the channel
    pub fn subscribe(&self, listener: impl Fn(&Message) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.shared.messages.add(listener);
        self.attach_for_subscribe();
        id
    }

    /// Receive messages with the given name
    pub fn subscribe_event(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.shared.messages.add_for_event(event, listener);
        self.attach_for_subscribe();
        id
    }

    /// Receive every message through a stream
    pub fn subscribe_stream(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Message>) {
        let subscription = self.shared.messages.add_stream();
        self.attach_for_subscribe();
        subscription
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.messages.remove(id)
    }

    pub fn unsubscribe_all(&self) {
        self.shared.messages.clear();
    }
}
