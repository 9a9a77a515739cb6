//! Presence Tests
//!
//! Tests for:
//! - Sync reconciliation: members not re-confirmed by a sync are removed
//! - Attach without HAS_PRESENCE clears the member list
//! - Enter/update/leave frames and client id rules
//! - Presence published while attaching is queued with the channel

mod common;

use std::sync::{Arc, Mutex};

use aerolink::protocol::{flags, Action};
use aerolink::{ClientOptions, Presence, PresenceAction, PresenceMessage, ProtocolMessage, RealtimeError};
use common::{ack, attach, attached, connected_client, options, sync};
use serde_json::json;
use tokio::sync::mpsc;

fn member(client: &str, action: PresenceAction, timestamp: i64) -> PresenceMessage {
    let mut msg = PresenceMessage::new(action, client, None);
    msg.connection_id = Some(format!("conn-{}", client));
    msg.timestamp = Some(timestamp);
    msg
}

fn client_ids(members: &[PresenceMessage]) -> Vec<&str> {
    members.iter().map(|m| m.client_id.as_str()).collect()
}

/// Every presence event seen by the channel
fn presence_events(presence: &Presence) -> mpsc::UnboundedReceiver<PresenceMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    presence.subscribe(move |m| {
        let _ = tx.send(m.clone());
    });
    rx
}

fn alice() -> ClientOptions {
    ClientOptions {
        client_id: Some("alice".into()),
        ..options()
    }
}

// =============================================================================
// Sync
// =============================================================================

/// With {A, B, C} present, a two-page sync re-confirming {A, B} leaves
/// exactly {A, B} and reports C as having left.
#[tokio::test]
async fn test_sync_removes_members_not_reconfirmed() {
    let (client, _server, mut conn) = connected_client(options()).await;
    let channel = client.channels().get("room");
    let presence = channel.presence();

    let leaves = Arc::new(Mutex::new(Vec::new()));
    {
        let leaves = Arc::clone(&leaves);
        presence.subscribe_action(PresenceAction::Leave, move |m| {
            leaves.lock().unwrap().push(m.client_id.clone());
        });
    }

    conn.expect(Action::Attach).await;
    conn.deliver(attached("room", flags::HAS_PRESENCE));
    conn.deliver(sync(
        "room",
        "",
        vec![
            member("a", PresenceAction::Present, 100),
            member("b", PresenceAction::Present, 100),
            member("c", PresenceAction::Present, 100),
        ],
    ));
    common::eventually(|| presence.is_sync_complete()).await;
    assert_eq!(client_ids(&presence.get().await.unwrap()), vec!["a", "b", "c"]);

    conn.deliver(sync("room", "page-2", vec![member("a", PresenceAction::Present, 200)]));
    conn.deliver(sync("room", "", vec![member("b", PresenceAction::Present, 200)]));

    common::eventually(|| !leaves.lock().unwrap().is_empty()).await;
    assert_eq!(client_ids(&presence.get().await.unwrap()), vec!["a", "b"]);
    assert_eq!(*leaves.lock().unwrap(), vec!["c".to_string()]);
    assert!(presence.is_sync_complete());
}

/// A leave received mid-sync is not undone by an older sync entry.
#[tokio::test]
async fn test_leave_during_sync_wins_over_older_sync_entry() {
    let (client, _server, mut conn) = connected_client(options()).await;
    let channel = attach(&client, &mut conn, "room").await;
    let presence = channel.presence();
    let mut events = presence_events(&presence);

    conn.deliver(sync("room", "page-2", vec![member("a", PresenceAction::Present, 100)]));
    conn.deliver(ProtocolMessage::presence("room", vec![member("b", PresenceAction::Leave, 300)]));
    conn.deliver(sync("room", "", vec![member("b", PresenceAction::Present, 200)]));
    // Frames are handled in order, so once this arrives the sync is done
    conn.deliver(ProtocolMessage::presence("room", vec![member("z", PresenceAction::Enter, 400)]));

    while events.recv().await.unwrap().client_id != "z" {}
    assert_eq!(client_ids(&presence.get().await.unwrap()), vec!["a", "z"]);
    assert!(presence.is_sync_complete());
}

/// Re-attaching without HAS_PRESENCE means nobody is present.
#[tokio::test]
async fn test_attach_without_presence_clears_members() {
    let (client, _server, mut conn) = connected_client(options()).await;
    let channel = attach(&client, &mut conn, "room").await;
    let presence = channel.presence();
    let mut events = presence_events(&presence);

    conn.deliver(ProtocolMessage::presence(
        "room",
        vec![member("a", PresenceAction::Enter, 100), member("b", PresenceAction::Enter, 100)],
    ));
    for _ in 0..2 {
        assert_eq!(events.recv().await.unwrap().action, PresenceAction::Enter);
    }
    assert_eq!(presence.get().await.unwrap().len(), 2);

    conn.deliver(ProtocolMessage::for_channel(Action::Detached, "room"));
    conn.expect(Action::Attach).await;
    conn.deliver(attached("room", 0));

    let mut departed = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
    departed.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    assert_eq!(client_ids(&departed), vec!["a", "b"]);
    assert!(departed.iter().all(|m| m.action == PresenceAction::Leave));
    assert!(presence.get().await.unwrap().is_empty());
    assert!(presence.is_sync_complete());
}

// =============================================================================
// Enter / update / leave
// =============================================================================

#[tokio::test]
async fn test_enter_update_leave_send_presence_frames() {
    let (client, _server, mut conn) = connected_client(alice()).await;
    let channel = attach(&client, &mut conn, "room").await;
    let presence = channel.presence();

    let steps = [
        (PresenceAction::Enter, Some(json!({"status": "here"}))),
        (PresenceAction::Update, Some(json!({"status": "busy"}))),
        (PresenceAction::Leave, None),
    ];
    for (serial, (action, data)) in steps.into_iter().enumerate() {
        let pending = {
            let presence = presence.clone();
            let data = data.clone();
            tokio::spawn(async move {
                match action {
                    PresenceAction::Enter => presence.enter(data).await,
                    PresenceAction::Update => presence.update(data).await,
                    _ => presence.leave(data).await,
                }
            })
        };

        let frame = conn.expect(Action::Presence).await;
        assert_eq!(frame.msg_serial, Some(serial as i64));
        let sent = frame.presence.unwrap().remove(0);
        assert_eq!(sent.action, action);
        assert_eq!(sent.client_id, "alice");
        assert_eq!(sent.data, data);

        conn.deliver(ack(serial as i64, 1));
        pending.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_enter_requires_concrete_client_id() {
    let (client, _server, mut conn) = connected_client(options()).await;
    let channel = attach(&client, &mut conn, "room").await;
    assert!(channel.presence().enter(None).await.is_err());

    let (client, _server, mut conn) = connected_client(ClientOptions {
        client_id: Some("*".into()),
        ..options()
    })
    .await;
    let channel = attach(&client, &mut conn, "room").await;
    assert!(channel.presence().enter(None).await.is_err());
}

#[tokio::test]
async fn test_enter_client_validates_identity() {
    let (client, _server, mut conn) = connected_client(alice()).await;
    let channel = attach(&client, &mut conn, "room").await;

    match channel.presence().enter_client("bob", None).await {
        Err(RealtimeError::IncompatibleClientId(_)) => {}
        other => panic!("expected incompatible client id, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wildcard_identity_may_enter_for_others() {
    let (client, _server, mut conn) = connected_client(ClientOptions {
        client_id: Some("*".into()),
        ..options()
    })
    .await;
    let channel = attach(&client, &mut conn, "room").await;

    let pending = {
        let presence = channel.presence();
        tokio::spawn(async move { presence.enter_client("bob", Some(json!(1))).await })
    };
    let frame = conn.expect(Action::Presence).await;
    assert_eq!(frame.presence.unwrap()[0].client_id, "bob");
    conn.deliver(ack(0, 1));
    pending.await.unwrap().unwrap();
}

/// Presence sent while attaching goes out with the channel queue.
#[tokio::test]
async fn test_enter_while_attaching_is_queued() {
    let (client, _server, mut conn) = connected_client(alice()).await;
    let channel = client.channels().get("room");

    let attaching = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.attach().await })
    };
    conn.expect(Action::Attach).await;

    let entering = {
        let presence = channel.presence();
        tokio::spawn(async move { presence.enter(None).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(conn.drain_frames().is_empty());

    conn.deliver(attached("room", 0));
    attaching.await.unwrap().unwrap();
    let frame = conn.expect(Action::Presence).await;
    conn.deliver(ack(frame.msg_serial.unwrap(), 1));
    entering.await.unwrap().unwrap();
}
