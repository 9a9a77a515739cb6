//! Connection Lifecycle Tests
//!
//! Tests for:
//! - Handshake and connection identity
//! - Graceful close and close timeout
//! - Closed/Failed are only left through an explicit connect
//! - Heartbeat ping
//! - Recovery keys and resume parameters

mod common;

use std::time::Duration;

use aerolink::protocol::Action;
use aerolink::{ClientOptions, ConnectionState, Credentials, ErrorInfo, ProtocolMessage, RealtimeError};
use common::{connected_client, options, wait_for_state};

fn fast_options() -> ClientOptions {
    ClientOptions {
        realtime_request_timeout_ms: 1_000,
        disconnected_retry_timeout_ms: 1_000,
        ..options()
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_connect_exposes_identity() {
    let (client, _server, conn) = connected_client(options()).await;
    let connection = client.connection();

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.id().as_deref(), Some("conn-1"));
    assert_eq!(connection.key().as_deref(), Some("key-1"));
    assert_eq!(connection.serial(), Some(-1));
    assert!(connection.connection_resumable());
    assert_eq!(connection.recovery_key().as_deref(), Some("key-1:-1"));

    assert_eq!(conn.params.credentials, Credentials::Key("app.key:secret".into()));
    assert_eq!(conn.params.resume, None);
}

#[tokio::test]
async fn test_state_changes_are_broadcast_in_order() {
    let (client, mut server) = common::client(options());
    let mut changes = client.connection().on_state_change();

    client.connect();
    let conn = server.next_connection().await;
    conn.accept("conn-1", "key-1");

    let first = changes.recv().await.unwrap();
    assert_eq!(first.previous, ConnectionState::Initialized);
    assert_eq!(first.current, ConnectionState::Connecting);

    let second = changes.recv().await.unwrap();
    assert_eq!(second.previous, ConnectionState::Connecting);
    assert_eq!(second.current, ConnectionState::Connected);
    assert!(second.reason.is_none());
}

#[tokio::test]
async fn test_connect_while_connected_is_noop() {
    let (client, mut server, _conn) = connected_client(options()).await;
    client.connect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(server.try_next_connection().is_none());
    assert_eq!(client.connection().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_inbound_serial_updates_connection_serial() {
    let (client, _server, conn) = connected_client(options()).await;

    let mut frame = ProtocolMessage::for_channel(Action::Message, "unknown");
    frame.connection_serial = Some(7);
    conn.deliver(frame);

    common::eventually(|| client.connection().serial() == Some(7)).await;
    assert_eq!(client.connection().recovery_key().as_deref(), Some("key-1:7"));
}

// =============================================================================
// Close
// =============================================================================

/// Close sends CLOSE and completes on the server's CLOSED.
#[tokio::test]
async fn test_close_is_graceful() {
    let (client, _server, mut conn) = connected_client(options()).await;

    client.close();
    conn.expect(Action::Close).await;
    assert_eq!(client.connection().state(), ConnectionState::Closing);

    conn.deliver(ProtocolMessage::new(Action::Closed));
    wait_for_state(&client, ConnectionState::Closed).await;

    let connection = client.connection();
    assert_eq!(connection.error_reason().map(|r| r.code), Some(80017));
    assert!(connection.id().is_none());
    assert!(connection.key().is_none());
    assert!(!connection.connection_resumable());
}

#[tokio::test(start_paused = true)]
async fn test_close_completes_without_server_reply() {
    let (client, _server, mut conn) = connected_client(fast_options()).await;

    client.close();
    conn.expect(Action::Close).await;
    wait_for_state(&client, ConnectionState::Closed).await;
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_close_before_connect_goes_straight_to_closed() {
    let (client, mut server) = common::client(options());
    client.close();
    wait_for_state(&client, ConnectionState::Closed).await;
    assert!(server.try_next_connection().is_none());
}

// =============================================================================
// Terminal states
// =============================================================================

/// Closed is never left automatically; connect() starts a fresh connection.
#[tokio::test(start_paused = true)]
async fn test_closed_is_only_left_through_connect() {
    let (client, mut server, mut conn) = connected_client(fast_options()).await;

    client.close();
    conn.expect(Action::Close).await;
    conn.deliver(ProtocolMessage::new(Action::Closed));
    wait_for_state(&client, ConnectionState::Closed).await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(client.connection().state(), ConnectionState::Closed);
    assert!(server.try_next_connection().is_none());

    client.connect();
    let next = server.next_connection().await;
    assert_eq!(next.params.resume, None);
    assert_eq!(client.connection().state(), ConnectionState::Connecting);
}

/// A connection-level ERROR fails the connection until connect() is called.
#[tokio::test(start_paused = true)]
async fn test_connection_error_fails_until_connect() {
    let (client, mut server, conn) = connected_client(fast_options()).await;

    let error = ErrorInfo::with_status(40160, 401, "Not permitted");
    conn.deliver(common::error_frame(None, error.clone()));
    wait_for_state(&client, ConnectionState::Failed).await;
    assert_eq!(client.connection().error_reason(), Some(error));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(client.connection().state(), ConnectionState::Failed);
    assert!(server.try_next_connection().is_none());

    client.connect();
    let next = server.next_connection().await;
    next.accept("conn-2", "key-2");
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(client.connection().id().as_deref(), Some("conn-2"));
}

// =============================================================================
// Ping
// =============================================================================

#[tokio::test]
async fn test_ping_round_trip() {
    let (client, _server, mut conn) = connected_client(options()).await;

    let ping = {
        let connection = client.connection().clone();
        tokio::spawn(async move { connection.ping().await })
    };
    let heartbeat = conn.expect(Action::Heartbeat).await;
    assert!(heartbeat.id.is_some());

    let mut reply = ProtocolMessage::new(Action::Heartbeat);
    reply.id = heartbeat.id;
    conn.deliver(reply);

    assert!(ping.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_ping_times_out_without_reply() {
    let (client, _server, mut conn) = connected_client(fast_options()).await;

    let ping = {
        let connection = client.connection().clone();
        tokio::spawn(async move { connection.ping().await })
    };
    conn.expect(Action::Heartbeat).await;

    match ping.await.unwrap() {
        Err(RealtimeError::Timeout(_)) => {}
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_requires_connected_state() {
    let (client, _server) = common::client(options());
    match client.connection().ping().await {
        Err(RealtimeError::InvalidConnectionState(_)) => {}
        other => panic!("expected invalid state, got {:?}", other),
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// The recover option is used for the first connection only; reconnects
/// resume with the connection key.
#[tokio::test]
async fn test_recover_then_resume() {
    let (client, mut server) = common::client(ClientOptions {
        recover: Some("old-key:5".into()),
        ..options()
    });

    client.connect();
    let first = server.next_connection().await;
    assert_eq!(first.params.recover.as_deref(), Some("old-key:5"));
    assert_eq!(first.params.resume, None);
    first.accept("conn-1", "key-1");
    wait_for_state(&client, ConnectionState::Connected).await;

    first.drop_socket(None);
    let second = server.next_connection().await;
    assert_eq!(second.params.resume.as_deref(), Some("key-1"));
    assert_eq!(second.params.recover, None);
}

/// A CONNECTED carrying an error after a recover attempt means the old
/// connection is gone; the client stays connected on the new one.
#[tokio::test]
async fn test_rejected_recovery_reports_unable_to_recover() {
    let (client, mut server) = common::client(ClientOptions {
        recover: Some("old-key:5".into()),
        ..options()
    });

    client.connect();
    let first = server.next_connection().await;
    let mut handshake = common::connected("conn-new", "key-new");
    handshake.error = Some(ErrorInfo::with_status(80018, 400, "Invalid connection key"));
    first.deliver(handshake);
    wait_for_state(&client, ConnectionState::Connected).await;

    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.code, 80008);
    assert_eq!(reason.status_code, Some(400));
    assert_eq!(client.connection().id().as_deref(), Some("conn-new"));
}

#[tokio::test]
async fn test_malformed_recovery_key_is_rejected() {
    let result = aerolink::Realtime::builder(ClientOptions {
        recover: Some("no-serial".into()),
        ..options()
    })
    .build();
    assert!(matches!(result, Err(RealtimeError::ConfigError(_))));
}
