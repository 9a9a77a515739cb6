//! Shared harness: an in-memory transport the tests drive as the server.
//!
//! Every connection attempt made by the client shows up as a
//! [`ServerConnection`] on [`MockServer::next_connection`]. The test reads
//! the frames the client sent and injects server frames or socket loss.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aerolink::protocol::{flags, Action, ConnectionDetails, PresenceMessage};
use aerolink::transport::{
    Transport, TransportEvent, TransportEventSender, TransportFactory, TransportParams,
};
use aerolink::{
    AuthProvider, ClientOptions, ErrorInfo, ProtocolMessage, Realtime, RealtimeBuilder,
    RealtimeChannel, RealtimeResult,
};
use tokio::sync::mpsc;

/// Long enough for the client task to react, short enough to fail fast
pub const STEP: Duration = Duration::from_secs(5);

// =============================================================================
// Mock transport
// =============================================================================

struct MockTransport {
    sent: mpsc::UnboundedSender<ProtocolMessage>,
    closed: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn send(&mut self, payload: Vec<u8>) -> RealtimeResult<()> {
        let frame: ProtocolMessage = serde_json::from_slice(&payload)?;
        let _ = self.sent.send(frame);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockTransportFactory {
    connections: mpsc::UnboundedSender<ServerConnection>,
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        params: TransportParams,
        _binary: bool,
        events: TransportEventSender,
    ) -> RealtimeResult<Box<dyn Transport>> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = events.send(TransportEvent::Opened);
        let _ = self.connections.send(ServerConnection {
            params,
            events,
            sent: sent_rx,
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(MockTransport {
            sent: sent_tx,
            closed,
        }))
    }
}

/// Receives the client's connection attempts
pub struct MockServer {
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MockServer {
    /// The next transport the client opens
    pub async fn next_connection(&mut self) -> ServerConnection {
        tokio::time::timeout(STEP, self.connections.recv())
            .await
            .expect("no connection attempt")
            .expect("client dropped")
    }

    /// Whether the client has opened another transport
    pub fn try_next_connection(&mut self) -> Option<ServerConnection> {
        self.connections.try_recv().ok()
    }
}

/// Server side of one transport
pub struct ServerConnection {
    pub params: TransportParams,
    events: TransportEventSender,
    sent: mpsc::UnboundedReceiver<ProtocolMessage>,
    closed: Arc<AtomicBool>,
}

impl ServerConnection {
    /// Inject a frame from the server
    pub fn deliver(&self, frame: ProtocolMessage) {
        let payload = serde_json::to_vec(&frame).expect("encode frame");
        let _ = self.events.send(TransportEvent::Data(payload));
    }

    /// Complete the handshake
    pub fn accept(&self, connection_id: &str, connection_key: &str) {
        self.deliver(connected(connection_id, connection_key));
    }

    /// Simulate socket loss
    pub fn drop_socket(&self, error: Option<ErrorInfo>) {
        let _ = self.events.send(TransportEvent::Closed(error));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next frame the client sent on this transport
    pub async fn next_frame(&mut self) -> ProtocolMessage {
        tokio::time::timeout(STEP, self.sent.recv())
            .await
            .expect("no frame sent")
            .expect("transport dropped")
    }

    /// Next frame, which must carry `action`
    pub async fn expect(&mut self, action: Action) -> ProtocolMessage {
        let frame = self.next_frame().await;
        assert_eq!(frame.action, action, "unexpected frame: {:?}", frame);
        frame
    }

    /// Frames already sent and not yet read
    pub fn drain_frames(&mut self) -> Vec<ProtocolMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

// =============================================================================
// Server frames
// =============================================================================

pub fn connected(connection_id: &str, connection_key: &str) -> ProtocolMessage {
    let mut frame = ProtocolMessage::new(Action::Connected);
    frame.connection_id = Some(connection_id.to_string());
    frame.connection_key = Some(connection_key.to_string());
    frame.connection_serial = Some(-1);
    frame.connection_details = Some(ConnectionDetails {
        connection_key: Some(connection_key.to_string()),
        ..Default::default()
    });
    frame
}

pub fn attached(channel: &str, flag_bits: u32) -> ProtocolMessage {
    let mut frame = ProtocolMessage::for_channel(Action::Attached, channel);
    if flag_bits != 0 {
        frame.flags = Some(flag_bits);
    }
    frame
}

pub fn attached_with_presence(channel: &str) -> ProtocolMessage {
    attached(channel, flags::HAS_PRESENCE)
}

pub fn ack(serial: i64, count: i64) -> ProtocolMessage {
    ProtocolMessage::ack(Action::Ack, serial, count)
}

pub fn nack(serial: i64, count: i64, error: ErrorInfo) -> ProtocolMessage {
    let mut frame = ProtocolMessage::ack(Action::Nack, serial, count);
    frame.error = Some(error);
    frame
}

pub fn sync(channel: &str, cursor: &str, members: Vec<PresenceMessage>) -> ProtocolMessage {
    let mut frame = ProtocolMessage::for_channel(Action::Sync, channel);
    frame.channel_serial = Some(format!("sync-1:{}", cursor));
    frame.presence = Some(members);
    frame
}

pub fn error_frame(channel: Option<&str>, error: ErrorInfo) -> ProtocolMessage {
    let mut frame = match channel {
        Some(channel) => ProtocolMessage::for_channel(Action::Error, channel),
        None => ProtocolMessage::new(Action::Error),
    };
    frame.error = Some(error);
    frame
}

// =============================================================================
// Client setup
// =============================================================================

/// Options with a key and without auto-connect
pub fn options() -> ClientOptions {
    ClientOptions {
        auto_connect: false,
        ..ClientOptions::with_key("app.key:secret")
    }
}

/// Client wired to a mock server
pub fn client(options: ClientOptions) -> (Realtime, MockServer) {
    build_client(Realtime::builder(options))
}

/// Client wired to a mock server, taking tokens from `provider`
pub fn client_with_provider(
    options: ClientOptions,
    provider: Arc<dyn AuthProvider>,
) -> (Realtime, MockServer) {
    build_client(Realtime::builder(options).auth_provider(provider))
}

fn build_client(builder: RealtimeBuilder) -> (Realtime, MockServer) {
    let (connections_tx, connections) = mpsc::unbounded_channel();
    let client = builder
        .transport(Arc::new(MockTransportFactory {
            connections: connections_tx,
        }))
        .build()
        .expect("build client");
    (client, MockServer { connections })
}

/// Connect and complete the handshake as `conn-1`
pub async fn connected_client(options: ClientOptions) -> (Realtime, MockServer, ServerConnection) {
    let (client, mut server) = client(options);
    client.connect();
    let conn = server.next_connection().await;
    conn.accept("conn-1", "key-1");
    wait_connected(&client).await;
    (client, server, conn)
}

pub async fn wait_connected(client: &Realtime) {
    tokio::time::timeout(
        STEP,
        client
            .connection()
            .wait_for_state(aerolink::ConnectionState::Connected),
    )
    .await
    .expect("not connected")
    .expect("connection task stopped");
}

pub async fn wait_for_state(client: &Realtime, state: aerolink::ConnectionState) {
    tokio::time::timeout(STEP, client.connection().wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("never reached {}", state))
        .expect("connection task stopped");
}

/// Attach `name` and answer the ATTACH
pub async fn attach(client: &Realtime, conn: &mut ServerConnection, name: &str) -> RealtimeChannel {
    let channel = client.channels().get(name);
    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.attach().await })
    };
    let frame = conn.expect(Action::Attach).await;
    assert_eq!(frame.channel.as_deref(), Some(name));
    conn.deliver(attached(name, 0));
    pending
        .await
        .expect("attach task panicked")
        .expect("attach failed");
    channel
}

/// Drop every connection attempt until the client gives up and suspends.
/// Returns the number of failed attempts.
pub async fn fail_attempts_until_suspended(client: &Realtime, server: &mut MockServer) -> usize {
    let connection = client.connection().clone();
    for attempts in 0..50 {
        tokio::select! {
            next = server.next_connection() => next.drop_socket(Some(ErrorInfo::disconnected())),
            _ = connection.wait_for_state(aerolink::ConnectionState::Suspended) => return attempts,
        }
    }
    panic!("connection never suspended");
}

/// Wait until `predicate` holds, checking after each scheduler turn
pub async fn eventually(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(STEP, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition never held");
}
