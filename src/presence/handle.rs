//! Public presence handle

use serde_json::Value;
use tokio::sync::oneshot;

use crate::channel::RealtimeChannel;
use crate::connection::manager::Command;
use crate::connection::WILDCARD_CLIENT_ID;
use crate::errors::{codes, ErrorInfo, RealtimeError, RealtimeResult};
use crate::handlers::SubscriptionId;
use crate::protocol::{PresenceAction, PresenceMessage, ProtocolMessage};

/// Presence on one channel
#[derive(Debug, Clone)]
pub struct Presence {
    channel: RealtimeChannel,
}

impl Presence {
    pub(crate) fn new(channel: RealtimeChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    /// Enter as this connection's client
    pub async fn enter(&self, data: Option<Value>) -> RealtimeResult<()> {
        let client_id = self.own_client_id()?;
        self.send(PresenceAction::Enter, client_id, data).await
    }

    pub async fn update(&self, data: Option<Value>) -> RealtimeResult<()> {
        let client_id = self.own_client_id()?;
        self.send(PresenceAction::Update, client_id, data).await
    }

    pub async fn leave(&self, data: Option<Value>) -> RealtimeResult<()> {
        let client_id = self.own_client_id()?;
        self.send(PresenceAction::Leave, client_id, data).await
    }

    /// Enter on behalf of `client_id`. Requires a wildcard identity unless
    /// it matches this connection's client.
    pub async fn enter_client(&self, client_id: impl Into<String>, data: Option<Value>) -> RealtimeResult<()> {
        self.send(PresenceAction::Enter, client_id.into(), data).await
    }

    pub async fn update_client(&self, client_id: impl Into<String>, data: Option<Value>) -> RealtimeResult<()> {
        self.send(PresenceAction::Update, client_id.into(), data).await
    }

    pub async fn leave_client(&self, client_id: impl Into<String>, data: Option<Value>) -> RealtimeResult<()> {
        self.send(PresenceAction::Leave, client_id.into(), data).await
    }

    fn own_client_id(&self) -> RealtimeResult<String> {
        match self.channel.connection().client_id() {
            Some(id) if !id.is_empty() && id != WILDCARD_CLIENT_ID => Ok(id),
            _ => Err(RealtimeError::Protocol(ErrorInfo::with_status(
                codes::BAD_REQUEST,
                400,
                "Presence requires a concrete client id",
            ))),
        }
    }

    async fn send(&self, action: PresenceAction, client_id: String, data: Option<Value>) -> RealtimeResult<()> {
        let member = PresenceMessage::new(action, client_id, data);
        let frame = ProtocolMessage::presence(self.channel.name().to_string(), vec![member]);
        self.channel.publish_frame(frame).await
    }

    /// Current members, sorted by member key
    pub async fn get(&self) -> RealtimeResult<Vec<PresenceMessage>> {
        let (reply, rx) = oneshot::channel();
        self.channel.connection().send_command(Command::PresenceMembers {
            name: self.channel.name().to_string(),
            reply,
        })?;
        rx.await.map_err(|_| RealtimeError::ConnectionClosed)?
    }

    /// Whether the member list has been synchronized since the last attach
    pub fn is_sync_complete(&self) -> bool {
        self.channel.status().presence_sync_complete
    }

    /// Receive every presence event
    pub fn subscribe(&self, listener: impl Fn(&PresenceMessage) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.channel.shared().presence.add(listener);
        self.attach_for_subscribe();
        id
    }

    /// Receive presence events of one kind
    pub fn subscribe_action(
        &self,
        action: PresenceAction,
        listener: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.channel.shared().presence.add_for_event(action.as_str(), listener);
        self.attach_for_subscribe();
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.channel.shared().presence.remove(id)
    }

    pub fn unsubscribe_all(&self) {
        self.channel.shared().presence.clear();
    }

    fn attach_for_subscribe(&self) {
        if self.channel.options().attach_on_subscribe && !self.channel.state().is_attached_or_attaching() {
            self.channel.request_attach();
        }
    }
}
