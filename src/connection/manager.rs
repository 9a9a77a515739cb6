//! # Connection Task
//!
//! The connection state machine runs as a single task that drains one
//! command queue: caller requests, transport events, token results and
//! timers are handled strictly one at a time, so state transitions never
//! race. Channel machines live inside the same task and see the
//! connection through [`ChannelLink`].

use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use super::ack::{AckCallback, AckTracker};
use super::attempts::{AttemptsInfo, HostSelector};
use super::handle::Connection;
use super::state::{ConnectionSnapshot, ConnectionState, ConnectionStateChange};
use crate::auth::{AuthSource, Credentials, TokenDetails};
use crate::channel::machine::{ChannelLink, ChannelMachine, Waiter};
use crate::channel::state::ChannelShared;
use crate::config::ClientOptions;
use crate::errors::{codes, ErrorInfo, RealtimeError, RealtimeResult};
use crate::protocol::{Action, AuthDetails, Codec, PresenceMessage, ProtocolMessage};
use crate::transport::{Transport, TransportEvent, TransportEventReceiver, TransportFactory, TransportParams};

/// Client id allowed to act on behalf of any client
pub const WILDCARD_CLIENT_ID: &str = "*";

/// Capacity of the connection state-change broadcast
const STATE_EVENT_CAPACITY: usize = 64;

/// Requests from client handles to the connection task
pub(crate) enum Command {
    Connect,
    Close,
    Ping {
        reply: oneshot::Sender<RealtimeResult<Duration>>,
    },
    CreateChannel {
        name: String,
        shared: Arc<ChannelShared>,
    },
    ReleaseChannel {
        name: String,
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    Attach {
        name: String,
        reply: Option<Waiter>,
    },
    Detach {
        name: String,
        reply: Option<Waiter>,
    },
    Publish {
        name: String,
        message: ProtocolMessage,
        callback: AckCallback,
    },
    PresenceMembers {
        name: String,
        reply: oneshot::Sender<RealtimeResult<Vec<PresenceMessage>>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenPurpose {
    /// Credentials for the next connection attempt
    Connect,
    /// Server asked for fresh credentials on a live connection
    Reauthorize,
}

/// Results of background work posted back to the task
enum Internal {
    Token {
        generation: u64,
        purpose: TokenPurpose,
        result: RealtimeResult<TokenDetails>,
    },
}

/// A message held until the connection is established
struct QueuedMessage {
    message: ProtocolMessage,
    callback: Option<AckCallback>,
}

struct PendingPing {
    started: Instant,
    deadline: Instant,
    reply: oneshot::Sender<RealtimeResult<Duration>>,
}

/// Collaborators the connection is built from
pub(crate) struct ConnectionSetup {
    pub(crate) options: ClientOptions,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) auth: AuthSource,
}

/// Reject explicit client ids that differ from the connection identity,
/// unless the identity is the wildcard or not known yet.
pub(crate) fn validate_client_ids(identity: Option<&str>, message: &ProtocolMessage) -> Result<(), ErrorInfo> {
    let Some(identity) = identity else {
        return Ok(());
    };
    if identity == WILDCARD_CLIENT_ID {
        return Ok(());
    }

    let explicit = message
        .messages
        .iter()
        .flatten()
        .filter_map(|m| m.client_id.as_deref())
        .chain(message.presence.iter().flatten().map(|p| p.client_id.as_str()))
        .filter(|id| !id.is_empty());

    for client_id in explicit {
        if client_id != identity {
            return Err(ErrorInfo::with_status(
                codes::INCOMPATIBLE_CLIENT_ID,
                400,
                format!(
                    "Client id '{}' does not match connection client id '{}'",
                    client_id, identity
                ),
            ));
        }
    }
    Ok(())
}

/// Start the connection task. Must be called within a tokio runtime.
pub(crate) fn spawn(setup: ConnectionSetup) -> Connection {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (internal_tx, internal) = mpsc::unbounded_channel();
    let snapshot = ConnectionSnapshot::initial(setup.options.client_id.clone());
    let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
    let (events_tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);
    let ack = Arc::new(AckTracker::new());

    let hosts = HostSelector::new(setup.options.host.clone(), setup.options.fallback_hosts.clone());
    let core = ConnectionCore {
        connection_state_ttl: setup.options.connection_state_ttl(),
        options: setup.options,
        codec: setup.codec,
        factory: setup.factory,
        auth: setup.auth,
        ack: Arc::clone(&ack),
        internal_tx,
        snapshot,
        transport: None,
        transport_rx: None,
        queued: VecDeque::new(),
        attempts: AttemptsInfo::new(),
        hosts,
        rng: StdRng::from_entropy(),
        tried_to_renew_token: false,
        auth_generation: 0,
        max_idle_interval: None,
        max_message_size: None,
        last_activity: Instant::now(),
        connect_deadline: None,
        close_deadline: None,
        retry_at: None,
        pings: HashMap::new(),
        transitions: VecDeque::new(),
        snapshot_tx,
        events_tx: events_tx.clone(),
    };

    let manager = ConnectionManager {
        core,
        channels: HashMap::new(),
        commands,
        internal,
    };
    tokio::spawn(manager.run());

    Connection::new(commands_tx, snapshot_rx, events_tx, ack)
}

/// Connection state and transport, everything except the channels
struct ConnectionCore {
    options: ClientOptions,
    codec: Arc<dyn Codec>,
    factory: Arc<dyn TransportFactory>,
    auth: AuthSource,
    ack: Arc<AckTracker>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    snapshot: ConnectionSnapshot,
    transport: Option<Box<dyn Transport>>,
    transport_rx: Option<TransportEventReceiver>,
    queued: VecDeque<QueuedMessage>,

    attempts: AttemptsInfo,
    hosts: HostSelector,
    rng: StdRng,
    tried_to_renew_token: bool,
    auth_generation: u64,

    connection_state_ttl: Duration,
    max_idle_interval: Option<Duration>,
    max_message_size: Option<usize>,
    last_activity: Instant,
    connect_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    pings: HashMap<String, PendingPing>,

    /// Transitions not yet seen by the channels
    transitions: VecDeque<ConnectionStateChange>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    events_tx: broadcast::Sender<ConnectionStateChange>,
}

impl ConnectionCore {
    fn state(&self) -> ConnectionState {
        self.snapshot.state
    }

    fn request_timeout(&self) -> Duration {
        self.options.realtime_request_timeout()
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    /// Apply a transition. Entering a state that fails pending work fails it
    /// here, with the transition's reason.
    fn set_state(&mut self, state: ConnectionState, reason: Option<ErrorInfo>, retry_in: Option<Duration>) {
        let previous = self.snapshot.state;
        if previous == state {
            return;
        }
        self.snapshot.state = state;
        self.snapshot.error_reason = reason.clone();

        tracing::info!(
            from = %previous,
            to = %state,
            reason = ?reason.as_ref().map(|r| r.code),
            connection_id = ?self.snapshot.id,
            "connection state changed"
        );

        if state.fails_pending() {
            let error = reason.clone().unwrap_or_else(|| self.state_error(state));
            self.ack.clear_queue_and_fail_messages(&error);
            self.fail_queued(&error);
        }
        if previous == ConnectionState::Connected {
            let error = reason.clone().unwrap_or_else(ErrorInfo::disconnected);
            self.fail_pings(&error);
        }

        self.publish_snapshot();
        let change = ConnectionStateChange {
            previous,
            current: state,
            reason,
            retry_in,
        };
        // No receivers is fine
        let _ = self.events_tx.send(change.clone());
        self.transitions.push_back(change);
    }

    /// Error for an operation the given state cannot carry
    fn state_error(&self, state: ConnectionState) -> ErrorInfo {
        match state {
            ConnectionState::Suspended => ErrorInfo::connection_suspended(),
            ConnectionState::Closing | ConnectionState::Closed => ErrorInfo::connection_closed(),
            ConnectionState::Failed => self
                .snapshot
                .error_reason
                .clone()
                .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed")),
            other => ErrorInfo::with_status(
                codes::DISCONNECTED,
                400,
                format!("Cannot send while {} with message queuing disabled", other),
            ),
        }
    }

    fn fail_queued(&mut self, error: &ErrorInfo) {
        for queued in self.queued.drain(..) {
            if let Some(callback) = queued.callback {
                callback.invoke(Err(error.clone()));
            }
        }
    }

    fn fail_pings(&mut self, error: &ErrorInfo) {
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(RealtimeError::Protocol(error.clone())));
        }
    }

    fn dispose_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.transport_rx = None;
    }

    fn clear_timers(&mut self) {
        self.connect_deadline = None;
        self.close_deadline = None;
        self.retry_at = None;
    }

    /// Forget the server-side connection; the next connect starts fresh
    fn forget_connection(&mut self) {
        self.snapshot.id = None;
        self.snapshot.key = None;
        self.snapshot.serial = None;
    }

    // ==================
    // Connect / close
    // ==================

    fn connect(&mut self) {
        let state = self.state();
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!(%state, "connect ignored");
            }
            _ => {
                if state != ConnectionState::Disconnected {
                    self.attempts.reset();
                }
                self.tried_to_renew_token = false;
                self.close_deadline = None;
                self.start_connect(false);
            }
        }
    }

    fn start_connect(&mut self, use_fallback: bool) {
        self.dispose_transport();
        self.retry_at = None;
        let host = self.hosts.next_host(use_fallback, &mut self.rng).to_string();
        self.snapshot.host = Some(host);
        self.connect_deadline = Some(Instant::now() + self.request_timeout());
        self.set_state(ConnectionState::Connecting, None, None);

        match self.auth.clone() {
            AuthSource::Static(credentials) => self.open_transport(credentials),
            AuthSource::Provider(_) => self.request_token(false, TokenPurpose::Connect),
        }
    }

    fn request_token(&mut self, force_renew: bool, purpose: TokenPurpose) {
        let AuthSource::Provider(provider) = &self.auth else {
            return;
        };
        self.auth_generation += 1;
        let generation = self.auth_generation;
        let future = provider.current_valid_token(force_renew);
        let internal = self.internal_tx.clone();
        tracing::debug!(force_renew, ?purpose, "requesting token");
        tokio::spawn(async move {
            let result = future.await;
            let _ = internal.send(Internal::Token {
                generation,
                purpose,
                result,
            });
        });
    }

    fn on_token(&mut self, generation: u64, purpose: TokenPurpose, result: RealtimeResult<TokenDetails>) {
        if generation != self.auth_generation {
            tracing::debug!(generation, "discarding stale token result");
            return;
        }

        match purpose {
            TokenPurpose::Connect => {
                if self.state() != ConnectionState::Connecting {
                    return;
                }
                match result {
                    Ok(token) => self.open_transport(Credentials::Token(token.token)),
                    Err(e) => {
                        let error = match e {
                            RealtimeError::Protocol(info) => info,
                            auth @ RealtimeError::AuthError(_) => auth.to_error_info(),
                            other => ErrorInfo::with_status(
                                codes::CONNECTION_FAILED,
                                503,
                                format!("Unable to obtain a token: {}", other),
                            ),
                        };
                        tracing::warn!(code = error.code, "token request failed");
                        if error.is_fatal() {
                            self.fail(error);
                        } else if error.is_token_error() {
                            self.on_token_error(error);
                        } else {
                            self.on_transport_lost(error);
                        }
                    }
                }
            }
            TokenPurpose::Reauthorize => {
                if self.state() != ConnectionState::Connected {
                    return;
                }
                match result {
                    Ok(token) => {
                        let mut frame = ProtocolMessage::new(Action::Auth);
                        frame.auth = Some(AuthDetails {
                            access_token: token.token,
                        });
                        self.send_now(frame, None);
                    }
                    Err(e) => tracing::warn!(error = %e, "reauthorization failed"),
                }
            }
        }
    }

    fn open_transport(&mut self, credentials: Credentials) {
        let host = self.hosts.current().to_string();
        let resume = self.snapshot.id.as_ref().and(self.snapshot.key.clone());
        let params = TransportParams {
            endpoint: self.options.endpoint(&host),
            host,
            credentials,
            client_id: self
                .options
                .client_id
                .clone()
                .filter(|id| id != WILDCARD_CLIENT_ID),
            format: self.codec.format(),
            echo: self.options.echo_messages,
            resume,
            recover: self.options.recover.clone(),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.factory.create(params, self.codec.is_binary(), events_tx) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.transport_rx = Some(events_rx);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to create transport");
                self.on_transport_lost(e.to_error_info());
            }
        }
    }

    fn close(&mut self) {
        let state = self.state();
        match state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                tracing::debug!(%state, "close ignored");
            }
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Closing, None, None);
                self.close_deadline = Some(Instant::now() + self.request_timeout());
                if self.write(&ProtocolMessage::new(Action::Close)).is_err() {
                    self.finish_close(None);
                }
            }
            _ => self.finish_close(None),
        }
    }

    fn finish_close(&mut self, reason: Option<ErrorInfo>) {
        self.dispose_transport();
        self.clear_timers();
        self.forget_connection();
        let reason = reason.unwrap_or_else(ErrorInfo::connection_closed);
        self.set_state(ConnectionState::Closed, Some(reason), None);
    }

    fn fail(&mut self, error: ErrorInfo) {
        tracing::error!(code = error.code, message = %error.message, "connection failed");
        self.dispose_transport();
        self.clear_timers();
        self.forget_connection();
        self.set_state(ConnectionState::Failed, Some(error), None);
    }

    // ==================
    // Failure handling
    // ==================

    /// The transport is gone, or the server told us to go away
    fn on_transport_lost(&mut self, error: ErrorInfo) {
        self.dispose_transport();
        let state = self.state();
        match state {
            ConnectionState::Closing => self.finish_close(None),
            ConnectionState::Connecting | ConnectionState::Connected => {
                if error.is_token_error() {
                    self.on_token_error(error);
                    return;
                }
                if error.is_fatal() {
                    self.fail(error);
                    return;
                }

                let now = Instant::now();
                self.connect_deadline = None;
                self.attempts.record_failure(now, state, Some(error.clone()));
                if self.attempts.should_suspend(now, self.connection_state_ttl) {
                    self.enter_suspended();
                } else {
                    let delay = if state == ConnectionState::Connected {
                        Duration::ZERO
                    } else {
                        let base = self.options.disconnected_retry_timeout();
                        self.attempts.retry_delay(base, &mut self.rng)
                    };
                    self.enter_disconnected(error, delay);
                }
            }
            _ => tracing::debug!(%state, "ignoring transport loss"),
        }
    }

    fn enter_disconnected(&mut self, error: ErrorInfo, delay: Duration) {
        tracing::warn!(code = error.code, retry_in_ms = delay.as_millis() as u64, "connection lost");
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected, Some(error), Some(delay));
    }

    fn enter_suspended(&mut self) {
        let delay = self.options.suspended_retry_timeout();
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(
            ConnectionState::Suspended,
            Some(ErrorInfo::connection_suspended()),
            Some(delay),
        );
    }

    /// At most one renewal per failure cycle before giving up
    fn on_token_error(&mut self, error: ErrorInfo) {
        if !self.tried_to_renew_token && self.auth.can_renew() {
            tracing::info!(code = error.code, "token rejected; renewing");
            self.tried_to_renew_token = true;
            self.dispose_transport();
            self.connect_deadline = Some(Instant::now() + self.request_timeout());
            self.set_state(ConnectionState::Connecting, Some(error), None);
            self.request_token(true, TokenPurpose::Connect);
        } else {
            self.fail(error);
        }
    }

    /// `Error` frame addressed to the connection
    fn on_connection_error(&mut self, error: Option<ErrorInfo>) {
        let error = error.unwrap_or_else(|| ErrorInfo::connection_failed("Connection error"));
        if error.is_token_error() {
            self.dispose_transport();
            self.on_token_error(error);
        } else {
            self.fail(error);
        }
    }

    fn on_closed_frame(&mut self, error: Option<ErrorInfo>) {
        match self.state() {
            ConnectionState::Closing => self.finish_close(None),
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::info!("connection closed by server");
                self.finish_close(error);
            }
            _ => {}
        }
    }

    fn retry(&mut self) {
        let state = self.state();
        let use_fallback =
            AttemptsInfo::should_use_fallback(state, self.attempts.last().and_then(|a| a.error.as_ref()));
        match state {
            ConnectionState::Disconnected => {
                if self.attempts.should_suspend(Instant::now(), self.connection_state_ttl) {
                    self.enter_suspended();
                } else {
                    self.start_connect(use_fallback);
                }
            }
            ConnectionState::Suspended => self.start_connect(use_fallback),
            _ => {}
        }
    }

    // ==================
    // Inbound
    // ==================

    fn on_connected(&mut self, message: ProtocolMessage) {
        let previous_id = self.snapshot.id.clone();
        let resumed = previous_id.is_some() && previous_id == message.connection_id;
        let details = message.connection_details.clone().unwrap_or_default();

        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        self.max_idle_interval = details.max_idle_interval.map(Duration::from_millis);
        self.max_message_size = details.max_message_size.and_then(|size| usize::try_from(size).ok());
        self.snapshot.id = message.connection_id.clone();
        self.snapshot.key = message.connection_key.clone().or(details.connection_key);
        if !resumed {
            self.snapshot.serial = message.connection_serial;
        }
        if details.client_id.is_some() {
            self.snapshot.client_id = details.client_id;
        }
        let recovering = self.options.recover.take().is_some() && previous_id.is_none();
        let error = match message.error {
            Some(error) if recovering && error.code != codes::UNABLE_TO_RECOVER => {
                tracing::warn!(code = error.code, "recovery key rejected");
                Some(ErrorInfo::with_status(
                    codes::UNABLE_TO_RECOVER,
                    error.status_code.unwrap_or(400),
                    format!("Unable to recover connection: {}", error.message),
                ))
            }
            error => error,
        };
        self.tried_to_renew_token = false;
        self.attempts.reset();
        self.connect_deadline = None;
        self.retry_at = None;
        self.last_activity = Instant::now();

        if previous_id.is_some() && !resumed {
            tracing::info!(connection_id = ?self.snapshot.id, "connection not resumed; pending messages re-stamped");
        }

        if self.state() == ConnectionState::Connected {
            self.snapshot.error_reason = error;
            self.publish_snapshot();
            return;
        }
        self.set_state(ConnectionState::Connected, error, None);

        for frame in self.ack.messages_for_resend(resumed) {
            if self.write(&frame).is_err() {
                self.on_transport_lost(ErrorInfo::disconnected());
                return;
            }
        }
        let queued: Vec<QueuedMessage> = self.queued.drain(..).collect();
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "sending messages queued while connecting");
        }
        for QueuedMessage { message, callback } in queued {
            self.send(message, callback);
        }
    }

    fn on_heartbeat(&mut self, id: Option<&str>) {
        if let Some(ping) = id.and_then(|id| self.pings.remove(id)) {
            let _ = ping.reply.send(Ok(Instant::now().saturating_duration_since(ping.started)));
        }
    }

    fn reauthorize(&mut self) {
        if matches!(self.auth, AuthSource::Provider(_)) {
            self.request_token(true, TokenPurpose::Reauthorize);
        } else {
            tracing::warn!("server requested reauthorization but no auth provider is configured");
        }
    }

    // ==================
    // Outbound
    // ==================

    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>) {
        let identity = self.snapshot.client_id.clone();
        if let Err(error) = validate_client_ids(identity.as_deref(), &message) {
            tracing::warn!(code = error.code, "rejecting message with incompatible client id");
            if let Some(callback) = callback {
                callback.invoke(Err(error));
            }
            return;
        }

        if let Err(error) = self.check_size(&message) {
            tracing::warn!(code = error.code, "rejecting oversized message");
            if let Some(callback) = callback {
                callback.invoke(Err(error));
            }
            return;
        }

        let state = self.state();
        if state.can_send() {
            self.send_now(message, callback);
        } else if state.can_queue() && self.options.queue_messages {
            self.queued.push_back(QueuedMessage { message, callback });
        } else if let Some(callback) = callback {
            callback.invoke(Err(self.state_error(state)));
        }
    }

    /// Messages and presence must fit the size the server announced. Nothing
    /// is checked before the first CONNECTED.
    fn check_size(&self, message: &ProtocolMessage) -> Result<(), ErrorInfo> {
        let Some(limit) = self.max_message_size else {
            return Ok(());
        };
        if !message.ack_required() {
            return Ok(());
        }
        let size = self.codec.encode(message).map_err(|e| e.to_error_info())?.len();
        if size > limit {
            return Err(ErrorInfo::with_status(
                codes::MESSAGE_TOO_LARGE,
                400,
                format!("Message of {} bytes exceeds the {} byte limit", size, limit),
            ));
        }
        Ok(())
    }

    fn send_now(&mut self, mut message: ProtocolMessage, callback: Option<AckCallback>) {
        let callback = if message.ack_required() {
            let callback = callback.unwrap_or_else(|| AckCallback::new(|_| {}));
            self.ack.queue_if_necessary(&mut message, callback, Instant::now())
        } else {
            callback
        };

        match self.write(&message) {
            Ok(()) => {
                if let Some(callback) = callback {
                    callback.invoke(Ok(()));
                }
            }
            Err(RealtimeError::Transport(reason)) => {
                // Ack-required messages stay pending and are resent
                tracing::warn!(%reason, "transport send failed");
                let error = ErrorInfo::new(codes::DISCONNECTED, reason);
                if let Some(callback) = callback {
                    callback.invoke(Err(error.clone()));
                }
                self.on_transport_lost(error);
            }
            Err(e) => {
                let error = e.to_error_info();
                tracing::error!(error = %e, "failed to encode frame");
                match (message.msg_serial, callback) {
                    (_, Some(callback)) => callback.invoke(Err(error)),
                    (Some(serial), None) => {
                        self.ack.fail_serial(serial, &error);
                    }
                    (None, None) => {}
                }
            }
        }
    }

    fn write(&mut self, message: &ProtocolMessage) -> RealtimeResult<()> {
        let payload = self.codec.encode(message)?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| RealtimeError::Transport("No transport".into()))?;
        tracing::debug!(
            action = %message.action,
            channel = ?message.channel,
            serial = ?message.msg_serial,
            "sending frame"
        );
        transport.send(payload)
    }

    fn ping(&mut self, reply: oneshot::Sender<RealtimeResult<Duration>>) {
        let state = self.state();
        if state != ConnectionState::Connected {
            let _ = reply.send(Err(RealtimeError::InvalidConnectionState(format!(
                "Cannot ping while {}",
                state
            ))));
            return;
        }

        let id = Uuid::new_v4().to_string();
        let mut frame = ProtocolMessage::new(Action::Heartbeat);
        frame.id = Some(id.clone());
        if let Err(e) = self.write(&frame) {
            let _ = reply.send(Err(e));
            self.on_transport_lost(ErrorInfo::disconnected());
            return;
        }

        let now = Instant::now();
        self.pings.insert(
            id,
            PendingPing {
                started: now,
                deadline: now + self.request_timeout(),
                reply,
            },
        );
    }

    // ==================
    // Timers
    // ==================

    fn idle_deadline(&self) -> Option<Instant> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.max_idle_interval
            .map(|idle| self.last_activity + idle + self.request_timeout())
    }

    fn next_deadline(&self) -> Option<Instant> {
        let ack_deadline = self
            .options
            .ack_timeout()
            .and_then(|timeout| self.ack.next_timeout(timeout));
        [
            self.connect_deadline,
            self.close_deadline,
            self.retry_at,
            self.idle_deadline(),
            self.pings.values().map(|p| p.deadline).min(),
            ack_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_timers(&mut self, now: Instant) {
        if self.connect_deadline.map_or(false, |at| at <= now) {
            self.connect_deadline = None;
            if self.state() == ConnectionState::Connecting {
                self.on_transport_lost(ErrorInfo::timeout("Connection attempt timed out"));
            }
        }
        if self.close_deadline.map_or(false, |at| at <= now) {
            self.close_deadline = None;
            if self.state() == ConnectionState::Closing {
                self.finish_close(None);
            }
        }
        if self.retry_at.map_or(false, |at| at <= now) {
            self.retry_at = None;
            self.retry();
        }
        if self.idle_deadline().map_or(false, |at| at <= now) {
            self.on_transport_lost(ErrorInfo::with_status(
                codes::DISCONNECTED,
                503,
                "No activity from server",
            ));
        }

        let expired: Vec<String> = self
            .pings
            .iter()
            .filter(|(_, ping)| ping.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(ping) = self.pings.remove(&id) {
                let _ = ping
                    .reply
                    .send(Err(RealtimeError::Timeout("No heartbeat received".into())));
            }
        }

        if let Some(timeout) = self.options.ack_timeout() {
            self.ack.fail_timed_out(now, timeout);
        }
    }
}

impl ChannelLink for ConnectionCore {
    fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    fn connection_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.error_reason.clone()
    }

    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>) {
        ConnectionCore::send(self, message, callback);
    }

    fn connect(&mut self) {
        if self.state() == ConnectionState::Initialized {
            ConnectionCore::connect(self);
        }
    }

    fn fail_channel_messages(&self, channel: &str, error: &ErrorInfo) {
        self.ack.fail_channel_messages(channel, error);
    }

    fn request_timeout(&self) -> Duration {
        ConnectionCore::request_timeout(self)
    }

    fn channel_retry_timeout(&self) -> Duration {
        self.options.channel_retry_timeout()
    }
}

/// The connection task: connection core plus the channel machines
struct ConnectionManager {
    core: ConnectionCore,
    channels: HashMap<String, ChannelMachine>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
}

async fn next_transport_event(events: &mut Option<TransportEventReceiver>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

fn released(name: &str) -> ErrorInfo {
    ErrorInfo::invalid_channel_state(format!("Channel '{}' has been released", name))
}

impl ConnectionManager {
    async fn run(mut self) {
        tracing::debug!("connection task started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone
                    None => break,
                },
                Some(internal) = self.internal.recv() => self.handle_internal(internal),
                event = next_transport_event(&mut self.core.transport_rx) => self.handle_transport_event(event),
                _ = sleep_until_deadline(deadline) => self.handle_timers(Instant::now()),
            }
            self.propagate_transitions();
        }
        self.shutdown();
        tracing::debug!("connection task stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(ChannelMachine::deadline)
            .chain(self.core.next_deadline())
            .min()
    }

    /// Let every channel react to each connection transition, in order
    fn propagate_transitions(&mut self) {
        while let Some(change) = self.core.transitions.pop_front() {
            for channel in self.channels.values_mut() {
                channel.on_connection_state(&mut self.core, &change);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.core.connect(),
            Command::Close => self.core.close(),
            Command::Ping { reply } => self.core.ping(reply),
            Command::CreateChannel { name, shared } => {
                self.channels
                    .entry(name.clone())
                    .or_insert_with(|| ChannelMachine::new(name, shared));
            }
            Command::ReleaseChannel { name, reply } => {
                if let Some(mut channel) = self.channels.remove(&name) {
                    channel.release(&mut self.core);
                    tracing::debug!(channel = %channel.name(), "channel released");
                }
                let _ = reply.send(Ok(()));
            }
            Command::Attach { name, reply } => match self.channels.get_mut(&name) {
                Some(channel) => channel.attach(&mut self.core, reply),
                None => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(RealtimeError::Protocol(released(&name))));
                    }
                }
            },
            Command::Detach { name, reply } => match self.channels.get_mut(&name) {
                Some(channel) => channel.detach(&mut self.core, reply),
                None => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(RealtimeError::Protocol(released(&name))));
                    }
                }
            },
            Command::Publish { name, message, callback } => match self.channels.get_mut(&name) {
                Some(channel) => channel.publish(&mut self.core, message, callback),
                None => callback.invoke(Err(released(&name))),
            },
            Command::PresenceMembers { name, reply } => {
                let result = self
                    .channels
                    .get(&name)
                    .ok_or_else(|| RealtimeError::Protocol(released(&name)))
                    .and_then(ChannelMachine::presence_members);
                let _ = reply.send(result);
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Token {
                generation,
                purpose,
                result,
            } => self.core.on_token(generation, purpose, result),
        }
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => {
                tracing::debug!(host = ?self.core.snapshot.host, "transport opened");
                self.core.last_activity = Instant::now();
            }
            Some(TransportEvent::Data(payload)) => self.handle_frame(&payload),
            Some(TransportEvent::Closed(error)) => {
                self.core.on_transport_lost(error.unwrap_or_else(ErrorInfo::disconnected));
            }
            // The transport went away without saying so
            None => self.core.on_transport_lost(ErrorInfo::disconnected()),
        }
    }

    fn handle_frame(&mut self, payload: &[u8]) {
        let mut message = match self.core.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        tracing::debug!(action = %message.action, channel = ?message.channel, "received frame");

        self.core.last_activity = Instant::now();
        if let Some(serial) = message.connection_serial {
            if message.action != Action::Connected {
                self.core.snapshot.serial = Some(serial);
                self.core.publish_snapshot();
            }
        }

        if self.core.ack.on_message_received(&message) {
            return;
        }
        message.populate_inbound_fields();

        match message.action {
            Action::Heartbeat => self.core.on_heartbeat(message.id.as_deref()),
            Action::Connected => self.core.on_connected(message),
            Action::Disconnected => self
                .core
                .on_transport_lost(message.error.unwrap_or_else(ErrorInfo::disconnected)),
            Action::Closed => self.core.on_closed_frame(message.error),
            Action::Error if message.channel.is_none() => self.core.on_connection_error(message.error),
            Action::Auth => self.core.reauthorize(),
            Action::Error => self.route_to_channel(message),
            action if action.is_channel_scoped() => self.route_to_channel(message),
            action => tracing::debug!(%action, "ignoring unexpected frame"),
        }
    }

    fn route_to_channel(&mut self, message: ProtocolMessage) {
        let Some(name) = message.channel.clone() else {
            tracing::warn!(action = %message.action, "channel frame without channel name");
            return;
        };
        match self.channels.get_mut(&name) {
            Some(channel) => channel.on_message(&mut self.core, message),
            None => tracing::debug!(channel = %name, action = %message.action, "frame for unknown channel"),
        }
    }

    fn handle_timers(&mut self, now: Instant) {
        self.core.on_timers(now);
        for channel in self.channels.values_mut() {
            channel.on_timer(&mut self.core, now);
        }
    }

    fn shutdown(&mut self) {
        self.core.dispose_transport();
        let error = ErrorInfo::connection_closed();
        self.core.ack.clear_queue_and_fail_messages(&error);
        self.core.fail_queued(&error);
        self.core.fail_pings(&error);
        for channel in self.channels.values_mut() {
            channel.shutdown();
        }
    }
}
