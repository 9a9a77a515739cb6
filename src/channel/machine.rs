//! # Channel State Machine
//!
//! Per-channel attach/detach lifecycle, the publish queue held until the
//! channel is attached, and inbound dispatch to subscribers and presence.
//!
//! A machine is owned by the connection task and only ever touched from
//! there. It reaches the connection through [`ChannelLink`], which keeps
//! the machine testable without a transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::state::{ChannelShared, ChannelState, ChannelStateChange, ChannelStatus};
use crate::connection::{AckCallback, ConnectionState, ConnectionStateChange};
use crate::errors::{codes, ErrorInfo, RealtimeError, RealtimeResult};
use crate::presence::map::{sync_has_more, PresenceMap};
use crate::protocol::{flags, Action, PresenceAction, PresenceMessage, ProtocolMessage};

/// Completion of an attach or detach request
pub(crate) type Waiter = oneshot::Sender<RealtimeResult<()>>;

/// What a channel needs from its connection
pub(crate) trait ChannelLink {
    fn connection_state(&self) -> ConnectionState;

    /// Error reason of the connection, if any
    fn connection_reason(&self) -> Option<ErrorInfo>;

    /// Send a frame now or queue it at connection level, per the connection's
    /// state. The callback is resolved exactly once.
    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>);

    /// Start connecting when the connection has never been asked to
    fn connect(&mut self);

    /// Fail the messages of one channel awaiting acknowledgement
    fn fail_channel_messages(&self, channel: &str, error: &ErrorInfo);

    fn request_timeout(&self) -> Duration;

    fn channel_retry_timeout(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    AttachTimeout,
    DetachTimeout,
    RetryAttach,
}

#[derive(Debug)]
struct QueuedPublish {
    message: ProtocolMessage,
    callback: AckCallback,
}

pub(crate) struct ChannelMachine {
    name: String,
    state: ChannelState,
    reason: Option<ErrorInfo>,
    channel_serial: Option<String>,
    queue: VecDeque<QueuedPublish>,
    presence: PresenceMap,
    attach_waiters: Vec<Waiter>,
    detach_waiters: Vec<Waiter>,
    timer: Option<(Instant, TimerKind)>,
    shared: Arc<ChannelShared>,
}

fn resolve(waiters: &mut Vec<Waiter>, result: RealtimeResult<()>) {
    for waiter in waiters.drain(..) {
        // The caller may have stopped waiting
        let _ = waiter.send(result.clone());
    }
}

impl ChannelMachine {
    pub(crate) fn new(name: impl Into<String>, shared: Arc<ChannelShared>) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Initialized,
            reason: None,
            channel_serial: None,
            queue: VecDeque::new(),
            presence: PresenceMap::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            timer: None,
            shared,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    /// Current members. Fails once a suspended connection has detached the
    /// channel, since the list can no longer be trusted.
    pub(crate) fn presence_members(&self) -> RealtimeResult<Vec<PresenceMessage>> {
        let suspended = self.state == ChannelState::Detached
            && self.reason.as_ref().map(|r| r.code) == Some(codes::CONNECTION_SUSPENDED);
        if suspended {
            return Err(RealtimeError::Protocol(ErrorInfo::with_status(
                codes::PRESENCE_OUT_OF_SYNC,
                400,
                format!("Presence state of '{}' is out of sync", self.name),
            )));
        }
        Ok(self.presence.values())
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Next instant at which [`ChannelMachine::on_timer`] has work to do
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timer.map(|(at, _)| at)
    }

    // ==================
    // Transitions
    // ==================

    fn set_state(&mut self, state: ChannelState, reason: Option<ErrorInfo>, resumed: bool) {
        let previous = self.state;
        self.state = state;
        self.reason = reason.clone();
        self.publish_status();

        if previous != state {
            tracing::info!(
                channel = %self.name,
                from = %previous,
                to = %state,
                reason = ?reason.as_ref().map(|r| r.code),
                "channel state changed"
            );
            self.shared.emit(ChannelStateChange {
                channel: self.name.clone(),
                previous,
                current: state,
                reason,
                resumed,
            });
        }
    }

    fn publish_status(&self) {
        self.shared.publish_status(ChannelStatus {
            state: self.state,
            reason: self.reason.clone(),
            presence_sync_complete: self.presence.is_sync_complete(),
        });
    }

    fn fail_queue(&mut self, error: &ErrorInfo) {
        for queued in self.queue.drain(..) {
            queued.callback.invoke(Err(error.clone()));
        }
    }

    /// Why the connection cannot carry an attach at all
    fn attach_blocked_by(link: &dyn ChannelLink) -> Option<ErrorInfo> {
        match link.connection_state() {
            ConnectionState::Closing | ConnectionState::Closed => Some(ErrorInfo::connection_closed()),
            ConnectionState::Suspended => Some(ErrorInfo::connection_suspended()),
            ConnectionState::Failed => Some(
                link.connection_reason()
                    .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed")),
            ),
            _ => None,
        }
    }

    fn send_attach(&mut self, link: &mut dyn ChannelLink, with_timeout: bool) {
        let mut frame = ProtocolMessage::for_channel(Action::Attach, self.name.clone());
        frame.channel_serial = self.channel_serial.clone();
        link.send(frame, None);
        if with_timeout {
            self.timer = Some((Instant::now() + link.request_timeout(), TimerKind::AttachTimeout));
        }
    }

    fn send_detach(&mut self, link: &mut dyn ChannelLink) {
        link.send(ProtocolMessage::for_channel(Action::Detach, self.name.clone()), None);
        self.timer = Some((Instant::now() + link.request_timeout(), TimerKind::DetachTimeout));
    }

    /// Put an `Attach` on the wire once the connection allows it
    fn request_attach(&mut self, link: &mut dyn ChannelLink) {
        match link.connection_state() {
            ConnectionState::Connected => self.send_attach(link, true),
            ConnectionState::Initialized => link.connect(),
            // Sent when the connection reaches Connected
            _ => self.timer = None,
        }
    }

    fn complete_detach(&mut self, reason: Option<ErrorInfo>) {
        self.timer = None;
        self.set_state(ChannelState::Detached, reason.clone(), false);
        resolve(&mut self.detach_waiters, Ok(()));

        let error = reason.unwrap_or_else(|| {
            ErrorInfo::invalid_channel_state(format!("Channel '{}' detached", self.name))
        });
        resolve(&mut self.attach_waiters, Err(RealtimeError::Protocol(error.clone())));
        self.fail_queue(&error);
    }

    fn fail(&mut self, link: &dyn ChannelLink, error: ErrorInfo) {
        self.timer = None;
        self.set_state(ChannelState::Failed, Some(error.clone()), false);
        let result = Err(RealtimeError::Protocol(error.clone()));
        resolve(&mut self.attach_waiters, result.clone());
        resolve(&mut self.detach_waiters, result);
        self.fail_queue(&error);
        link.fail_channel_messages(&self.name, &error);
    }

    // ==================
    // Caller operations
    // ==================

    pub(crate) fn attach(&mut self, link: &mut dyn ChannelLink, waiter: Option<Waiter>) {
        match self.state {
            ChannelState::Attached => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                return;
            }
            ChannelState::Attaching => {
                self.attach_waiters.extend(waiter);
                return;
            }
            _ => {}
        }

        if let Some(error) = Self::attach_blocked_by(link) {
            tracing::debug!(channel = %self.name, code = error.code, "attach rejected by connection state");
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(RealtimeError::Protocol(error)));
            }
            return;
        }

        self.attach_waiters.extend(waiter);
        resolve(
            &mut self.detach_waiters,
            Err(RealtimeError::InvalidChannelState("Detach superseded by attach".into())),
        );
        self.set_state(ChannelState::Attaching, None, false);
        self.request_attach(link);
    }

    pub(crate) fn detach(&mut self, link: &mut dyn ChannelLink, waiter: Option<Waiter>) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelState::Failed => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(RealtimeError::InvalidChannelState(format!(
                        "Cannot detach failed channel '{}'",
                        self.name
                    ))));
                }
            }
            ChannelState::Detaching => self.detach_waiters.extend(waiter),
            ChannelState::Attaching | ChannelState::Attached => {
                self.detach_waiters.extend(waiter);
                resolve(
                    &mut self.attach_waiters,
                    Err(RealtimeError::InvalidChannelState("Attach superseded by detach".into())),
                );
                if link.connection_state() == ConnectionState::Connected {
                    self.set_state(ChannelState::Detaching, None, false);
                    self.send_detach(link);
                } else {
                    // Nothing attached on the server side to tell
                    self.complete_detach(None);
                }
            }
        }
    }

    /// Publish a `Message` or `Presence` frame: sent when attached, queued
    /// while attaching, rejected otherwise.
    pub(crate) fn publish(&mut self, link: &mut dyn ChannelLink, message: ProtocolMessage, callback: AckCallback) {
        match self.state {
            ChannelState::Attached => link.send(message, Some(callback)),
            ChannelState::Attaching => self.queue.push_back(QueuedPublish { message, callback }),
            ChannelState::Initialized => {
                self.attach(link, None);
                if self.state == ChannelState::Attaching {
                    self.queue.push_back(QueuedPublish { message, callback });
                } else {
                    let error = Self::attach_blocked_by(link).unwrap_or_else(|| {
                        ErrorInfo::invalid_channel_state(format!("Unable to attach channel '{}'", self.name))
                    });
                    callback.invoke(Err(error));
                }
            }
            ChannelState::Detaching | ChannelState::Detached | ChannelState::Failed => {
                callback.invoke(Err(ErrorInfo::invalid_channel_state(format!(
                    "Cannot publish to channel '{}' in state {}",
                    self.name, self.state
                ))));
            }
        }
    }

    /// Detach and drop everything held for callers
    pub(crate) fn release(&mut self, link: &mut dyn ChannelLink) {
        if self.state.is_attached_or_attaching() && link.connection_state() == ConnectionState::Connected {
            link.send(ProtocolMessage::for_channel(Action::Detach, self.name.clone()), None);
        }
        self.timer = None;

        let error = ErrorInfo::invalid_channel_state(format!("Channel '{}' released", self.name));
        let result = Err(RealtimeError::Protocol(error.clone()));
        resolve(&mut self.attach_waiters, result.clone());
        resolve(&mut self.detach_waiters, result);
        self.fail_queue(&error);

        if self.state != ChannelState::Initialized && self.state != ChannelState::Failed {
            self.set_state(ChannelState::Detached, None, false);
        }
        self.presence.clear();
        self.shared.messages.clear();
        self.shared.presence.clear();
    }

    // ==================
    // Inbound frames
    // ==================

    pub(crate) fn on_message(&mut self, link: &mut dyn ChannelLink, message: ProtocolMessage) {
        match message.action {
            Action::Attached => self.on_attached(link, message),
            Action::Detached => self.on_detached(link, message),
            Action::Error => {
                let error = message.error.unwrap_or_else(|| {
                    ErrorInfo::with_status(codes::CHANNEL_OPERATION_FAILED, 500, "Channel error")
                });
                tracing::warn!(channel = %self.name, code = error.code, "channel error from server");
                self.fail(link, error);
            }
            Action::Message => self.on_data(message),
            Action::Presence => self.on_presence(message),
            Action::Sync => self.on_sync(message),
            other => {
                tracing::debug!(channel = %self.name, action = %other, "ignoring unexpected channel frame");
            }
        }
    }

    fn on_attached(&mut self, link: &mut dyn ChannelLink, message: ProtocolMessage) {
        if message.channel_serial.is_some() {
            self.channel_serial = message.channel_serial.clone();
        }
        let resumed = message.has_flag(flags::RESUMED);
        let has_presence = message.has_flag(flags::HAS_PRESENCE);

        match self.state {
            ChannelState::Attaching => {
                self.timer = None;
                self.set_state(ChannelState::Attached, message.error, resumed);
                resolve(&mut self.attach_waiters, Ok(()));
                self.reconcile_presence_on_attach(resumed, has_presence);
                self.flush_queue(link);
            }
            ChannelState::Attached => {
                // Re-attach after a reconnect, or a server-side update
                self.timer = None;
                if message.error.is_some() {
                    self.reason = message.error;
                }
                self.reconcile_presence_on_attach(resumed, has_presence);
            }
            state => {
                tracing::debug!(channel = %self.name, %state, "ignoring ATTACHED");
            }
        }
    }

    fn reconcile_presence_on_attach(&mut self, resumed: bool, has_presence: bool) {
        if !resumed {
            self.presence.start_sync();
            if !has_presence {
                // Nobody is present; an empty sync clears the map
                let departed = self.presence.end_sync();
                self.broadcast_presence(&departed);
            }
        }
        self.publish_status();
    }

    fn flush_queue(&mut self, link: &mut dyn ChannelLink) {
        if self.queue.is_empty() {
            return;
        }
        tracing::debug!(channel = %self.name, count = self.queue.len(), "flushing queued messages");
        let queued: Vec<QueuedPublish> = self.queue.drain(..).collect();
        for QueuedPublish { message, callback } in queued {
            link.send(message, Some(callback));
        }
    }

    fn on_detached(&mut self, link: &mut dyn ChannelLink, message: ProtocolMessage) {
        match self.state {
            ChannelState::Detaching => self.complete_detach(message.error),
            ChannelState::Attached => {
                tracing::warn!(channel = %self.name, reason = ?message.error, "server detached channel; re-attaching");
                self.set_state(ChannelState::Attaching, message.error, false);
                self.request_attach(link);
            }
            ChannelState::Attaching => {
                // Attach refused for now; try again later
                self.reason = message.error;
                self.publish_status();
                self.timer = Some((Instant::now() + link.channel_retry_timeout(), TimerKind::RetryAttach));
            }
            state => {
                tracing::debug!(channel = %self.name, %state, "ignoring DETACHED");
            }
        }
    }

    fn on_data(&mut self, message: ProtocolMessage) {
        if self.state != ChannelState::Attached {
            tracing::debug!(channel = %self.name, state = %self.state, "dropping message on unattached channel");
            return;
        }
        if message.channel_serial.is_some() {
            self.channel_serial = message.channel_serial;
        }
        for msg in message.messages.unwrap_or_default() {
            self.shared.messages.dispatch(&msg);
        }
    }

    fn on_presence(&mut self, message: ProtocolMessage) {
        for member in message.presence.unwrap_or_default() {
            if self.apply_presence(&member) {
                self.shared.presence.dispatch(&member);
            }
        }
    }

    fn on_sync(&mut self, message: ProtocolMessage) {
        self.presence.start_sync();
        for member in message.presence.unwrap_or_default() {
            if self.apply_presence(&member) {
                self.shared.presence.dispatch(&member);
            }
        }
        if !sync_has_more(message.channel_serial.as_deref()) {
            let departed = self.presence.end_sync();
            self.broadcast_presence(&departed);
        }
        self.publish_status();
    }

    fn apply_presence(&mut self, member: &PresenceMessage) -> bool {
        match member.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => self.presence.put(member),
            PresenceAction::Leave | PresenceAction::Absent => self.presence.remove(member),
        }
    }

    fn broadcast_presence(&self, members: &[PresenceMessage]) {
        for member in members {
            self.shared.presence.dispatch(member);
        }
    }

    // ==================
    // Connection and timers
    // ==================

    pub(crate) fn on_connection_state(&mut self, link: &mut dyn ChannelLink, change: &ConnectionStateChange) {
        match change.current {
            ConnectionState::Connected => match self.state {
                ChannelState::Attaching => self.send_attach(link, true),
                ChannelState::Attached => self.send_attach(link, false),
                ChannelState::Detaching => self.send_detach(link),
                _ => {}
            },
            ConnectionState::Disconnected => {
                // Requests in flight are re-sent once connected again
                if matches!(self.timer, Some((_, TimerKind::AttachTimeout | TimerKind::DetachTimeout))) {
                    self.timer = None;
                }
            }
            ConnectionState::Suspended => {
                if matches!(
                    self.state,
                    ChannelState::Attaching | ChannelState::Attached | ChannelState::Detaching
                ) {
                    let reason = change.reason.clone().unwrap_or_else(ErrorInfo::connection_suspended);
                    self.complete_detach(Some(reason));
                }
            }
            ConnectionState::Closed => {
                let reason = change.reason.clone().unwrap_or_else(ErrorInfo::connection_closed);
                if self.state.is_attached_or_attaching() {
                    self.set_state(ChannelState::Detaching, Some(reason.clone()), false);
                }
                if self.state == ChannelState::Detaching {
                    self.complete_detach(Some(reason));
                }
            }
            ConnectionState::Failed => {
                if matches!(
                    self.state,
                    ChannelState::Attaching | ChannelState::Attached | ChannelState::Detaching
                ) {
                    let reason = change
                        .reason
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed"));
                    self.fail(link, reason);
                }
            }
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Closing => {}
        }
    }

    pub(crate) fn on_timer(&mut self, link: &mut dyn ChannelLink, now: Instant) {
        let Some((at, kind)) = self.timer else {
            return;
        };
        if at > now {
            return;
        }
        self.timer = None;

        match (kind, self.state) {
            (TimerKind::AttachTimeout, ChannelState::Attaching) => {
                let error = ErrorInfo::timeout(format!("Timed out attaching channel '{}'", self.name));
                tracing::warn!(channel = %self.name, "attach timed out");
                self.complete_detach(Some(error));
            }
            (TimerKind::DetachTimeout, ChannelState::Detaching) => {
                let error = ErrorInfo::timeout(format!("Timed out detaching channel '{}'", self.name));
                tracing::warn!(channel = %self.name, "detach timed out");
                self.set_state(ChannelState::Attached, Some(error.clone()), false);
                resolve(&mut self.detach_waiters, Err(RealtimeError::Protocol(error)));
            }
            (TimerKind::RetryAttach, ChannelState::Attaching) => self.request_attach(link),
            _ => {}
        }
    }

    /// Fail everything held for callers; the connection task is going away
    pub(crate) fn shutdown(&mut self) {
        let error = ErrorInfo::connection_closed();
        let result = Err(RealtimeError::Protocol(error.clone()));
        resolve(&mut self.attach_waiters, result.clone());
        resolve(&mut self.detach_waiters, result);
        self.fail_queue(&error);
    }
}
