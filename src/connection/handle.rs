//! Public handle onto the connection task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::ack::AckTracker;
use super::manager::Command;
use super::state::{ConnectionSnapshot, ConnectionState, ConnectionStateChange};
use crate::errors::{ErrorInfo, RealtimeError, RealtimeResult};

/// Cheaply cloneable handle to the client's realtime connection.
///
/// All mutation happens in the connection task; the handle only enqueues
/// commands and reads the last published snapshot.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<ConnectionStateChange>,
    ack: Arc<AckTracker>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("id", &self.id())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<ConnectionSnapshot>,
        events: broadcast::Sender<ConnectionStateChange>,
        ack: Arc<AckTracker>,
    ) -> Self {
        Self {
            commands,
            snapshot,
            events,
            ack,
        }
    }

    pub(crate) fn send_command(&self, command: Command) -> RealtimeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RealtimeError::ConnectionClosed)
    }

    // ==================
    // Control
    // ==================

    /// Start connecting. A no-op while connecting or connected; the only way
    /// out of `Closed` and `Failed`.
    pub fn connect(&self) {
        if self.send_command(Command::Connect).is_err() {
            tracing::warn!("connect requested after the connection task stopped");
        }
    }

    /// Close the connection gracefully
    pub fn close(&self) {
        if self.send_command(Command::Close).is_err() {
            tracing::debug!("close requested after the connection task stopped");
        }
    }

    /// Send a heartbeat and wait for the server to echo it. Returns the
    /// round-trip time.
    pub async fn ping(&self) -> RealtimeResult<Duration> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Ping { reply })?;
        rx.await.map_err(|_| RealtimeError::ConnectionClosed)?
    }

    // ==================
    // Observation
    // ==================

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn id(&self) -> Option<String> {
        self.snapshot.borrow().id.clone()
    }

    pub fn key(&self) -> Option<String> {
        self.snapshot.borrow().key.clone()
    }

    pub fn serial(&self) -> Option<i64> {
        self.snapshot.borrow().serial
    }

    /// Identity assigned by the server, or the configured one before that
    pub fn client_id(&self) -> Option<String> {
        self.snapshot.borrow().client_id.clone()
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.borrow().error_reason.clone()
    }

    pub fn host(&self) -> Option<String> {
        self.snapshot.borrow().host.clone()
    }

    pub fn connection_resumable(&self) -> bool {
        self.snapshot.borrow().connection_resumable()
    }

    /// Key a later client can pass as `recover` to pick up this connection
    pub fn recovery_key(&self) -> Option<String> {
        self.snapshot.borrow().recovery_key()
    }

    /// Messages sent and still waiting for an ack
    pub fn pending_ack_count(&self) -> usize {
        self.ack.pending_count()
    }

    /// Stream of state transitions from now on
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.events.subscribe()
    }

    /// Wait until the connection reaches `target`. Returns immediately if it
    /// already has.
    pub async fn wait_for_state(&self, target: ConnectionState) -> RealtimeResult<()> {
        let mut snapshot = self.snapshot.clone();
        snapshot
            .wait_for(|s| s.state == target)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::ConnectionClosed)
    }
}
