//! Hub behavior tests through the public handle.
//!
//! Covers:
//! - Join/leave flow with presence snapshots and notifications
//! - Room isolation and sender exclusion
//! - Membership counting under repeated register/unregister
//! - Slow consumer eviction
//! - Shutdown and draining

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use collab_service::errors::CollabError;
use collab_service::hub::CloseReason;
use collab_service::protocol::{
    MessageType, PresenceSnapshot, TableEvent, UserCursor, UserJoined, UserLeft,
};
use collab_test_utils::{participant, spawn_hub, TestClient};
use serde_json::json;
use uuid::Uuid;

// ============================================================================
// Join / Leave Flow
// ============================================================================

#[tokio::test]
async fn test_two_user_session() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    // C1 joins an empty room and sees only itself
    let mut c1 = TestClient::join(&hub, room, participant("alice")).await;
    let snapshot: PresenceSnapshot = c1
        .expect_kind(MessageType::PresenceSnapshot)
        .await
        .decode(&MessageType::PresenceSnapshot)
        .unwrap();
    assert_eq!(snapshot.users.len(), 1);
    assert_eq!(snapshot.users[0].user_id, c1.user_id());

    // C2 joins; C1 is told, C2 sees both
    let mut c2 = TestClient::join(&hub, room, participant("bob")).await;
    let joined: UserJoined = c1
        .expect_kind(MessageType::UserJoined)
        .await
        .decode(&MessageType::UserJoined)
        .unwrap();
    assert_eq!(joined.user_id, c2.user_id());
    assert_eq!(joined.display_name, "bob");

    let snapshot: PresenceSnapshot = c2
        .expect_kind(MessageType::PresenceSnapshot)
        .await
        .decode(&MessageType::PresenceSnapshot)
        .unwrap();
    let users: Vec<Uuid> = snapshot.users.iter().map(|u| u.user_id).collect();
    assert_eq!(users.len(), 2);
    assert!(users.contains(&c1.user_id()));
    assert!(users.contains(&c2.user_id()));

    // C1 moves its cursor; only C2 hears about it
    c1.send(&hub, MessageType::UserCursor, json!({"x": 10.0, "y": 20.0}))
        .await;
    let cursor_envelope = c2.expect_kind(MessageType::UserCursor).await;
    assert_eq!(cursor_envelope.user_id, Some(c1.user_id()));
    assert_eq!(cursor_envelope.project_id, room);
    let cursor: UserCursor = cursor_envelope.decode(&MessageType::UserCursor).unwrap();
    assert!((cursor.position.x - 10.0).abs() < f64::EPSILON);
    c1.expect_silence().await;

    // C2 leaves; C1 is told and the room shrinks to one
    let c2_user = c2.user_id();
    c2.leave(&hub).await;
    let left: UserLeft = c1
        .expect_kind(MessageType::UserLeft)
        .await
        .decode(&MessageType::UserLeft)
        .unwrap();
    assert_eq!(left.user_id, c2_user);
    assert_eq!(hub.room_size(room).await.unwrap(), 1);
}

#[tokio::test]
async fn test_presence_reflects_last_cursor() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let mut c1 = TestClient::join(&hub, room, participant("alice")).await;
    c1.expect_kind(MessageType::PresenceSnapshot).await;

    c1.send(&hub, MessageType::UserCursor, json!({"x": 1.5, "y": -3.0}))
        .await;

    let presence = hub.presence(room).await.unwrap();
    assert_eq!(presence.len(), 1);
    let cursor = presence[0].cursor.expect("cursor recorded");
    assert!((cursor.x - 1.5).abs() < f64::EPSILON);
    assert!((cursor.y + 3.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_presence_of_unknown_room_is_empty() {
    let hub = spawn_hub();
    assert!(hub.presence(Uuid::new_v4()).await.unwrap().is_empty());
    assert_eq!(hub.room_size(Uuid::new_v4()).await.unwrap(), 0);
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn test_broadcast_excludes_only_sender() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let mut sender = TestClient::join(&hub, room, participant("sender")).await;
    let mut others = Vec::new();
    for name in ["a", "b", "c"] {
        others.push(TestClient::join(&hub, room, participant(name)).await);
    }
    sender.drain();
    for other in &mut others {
        other.drain();
    }

    let table = json!({"table_id": Uuid::new_v4(), "name": "orders"});
    sender
        .send(&hub, MessageType::TableCreated, table.clone())
        .await;

    for other in &mut others {
        let envelope = other.expect_kind(MessageType::TableCreated).await;
        let event: TableEvent = envelope.decode(&MessageType::TableCreated).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap()["name"], "orders");
    }
    sender.expect_silence().await;
}

#[tokio::test]
async fn test_notify_reaches_every_member() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let mut c1 = TestClient::join(&hub, room, participant("alice")).await;
    let mut c2 = TestClient::join(&hub, room, participant("bob")).await;
    c1.drain();
    c2.drain();

    let event = TableEvent {
        table_id: Uuid::new_v4(),
        attributes: serde_json::Map::new(),
    };
    hub.notify(room, MessageType::TableDeleted, &event, Some(c1.user_id()))
        .await
        .unwrap();

    // The acting user's own connection is included
    let envelope = c1.expect_kind(MessageType::TableDeleted).await;
    assert_eq!(envelope.user_id, Some(c1.user_id()));
    c2.expect_kind(MessageType::TableDeleted).await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let hub = spawn_hub();
    let room_a = Uuid::new_v4();
    let room_b = Uuid::new_v4();

    let mut a1 = TestClient::join(&hub, room_a, participant("a1")).await;
    let mut a2 = TestClient::join(&hub, room_a, participant("a2")).await;
    let mut b1 = TestClient::join(&hub, room_b, participant("b1")).await;
    a1.drain();
    a2.drain();
    b1.drain();

    a1.send(&hub, MessageType::CanvasUpdated, json!({"zoom": 1.25}))
        .await;

    a2.expect_kind(MessageType::CanvasUpdated).await;
    b1.expect_silence().await;

    let status = hub.status().await.unwrap();
    assert_eq!(status.room_count, 2);
    assert_eq!(status.connection_count, 3);
    assert!(!status.bridge_enabled);
}

#[tokio::test]
async fn test_unknown_type_is_routed() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let c1 = TestClient::join(&hub, room, participant("alice")).await;
    let mut c2 = TestClient::join(&hub, room, participant("bob")).await;
    c2.drain();

    c1.send(
        &hub,
        MessageType::Other("note_added".to_string()),
        json!({"text": "hi"}),
    )
    .await;

    let envelope = c2.recv_envelope().await;
    assert_eq!(envelope.kind.as_str(), "note_added");
    assert_eq!(envelope.data["text"], "hi");
}

// ============================================================================
// Membership Accounting
// ============================================================================

#[tokio::test]
async fn test_count_tracks_register_minus_unregister() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let mut clients = Vec::new();
    for i in 0..6 {
        clients.push(TestClient::join(&hub, room, participant(&format!("user-{i}"))).await);
    }
    assert_eq!(hub.room_size(room).await.unwrap(), 6);

    for client in clients.drain(..2) {
        client.leave(&hub).await;
    }
    assert_eq!(hub.room_size(room).await.unwrap(), 4);

    for client in clients.drain(..) {
        client.leave(&hub).await;
    }
    assert_eq!(hub.room_size(room).await.unwrap(), 0);
    assert_eq!(hub.status().await.unwrap().room_count, 0);
}

#[tokio::test]
async fn test_double_unregister_is_noop() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let mut stayer = TestClient::join(&hub, room, participant("stayer")).await;
    let leaver = TestClient::join(&hub, room, participant("leaver")).await;
    stayer.drain();

    let id = leaver.id();
    hub.unregister(id, CloseReason::Normal).await;
    hub.unregister(id, CloseReason::Normal).await;

    assert_eq!(leaver.expect_closed().await, CloseReason::Normal);
    stayer.expect_kind(MessageType::UserLeft).await;
    // Only one departure is announced
    stayer.expect_silence().await;
    assert_eq!(hub.room_size(room).await.unwrap(), 1);
}

#[tokio::test]
async fn test_same_user_in_two_tabs() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();
    let alice = participant("alice");

    let mut tab1 = TestClient::join(&hub, room, alice.clone()).await;
    let mut tab2 = TestClient::join(&hub, room, alice).await;
    tab1.drain();
    tab2.drain();

    // Connections, not users, are excluded
    tab1.send(&hub, MessageType::TableMoved, json!({"table_id": Uuid::new_v4()}))
        .await;
    tab2.expect_kind(MessageType::TableMoved).await;
    tab1.expect_silence().await;
    assert_eq!(hub.room_size(room).await.unwrap(), 2);
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn test_slow_consumer_is_evicted() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();

    let mut fast = TestClient::join(&hub, room, participant("fast")).await;
    // Queue holds exactly the presence snapshot
    let slow = TestClient::try_join_with_capacity(&hub, room, participant("slow"), 1)
        .await
        .unwrap();
    fast.drain();

    fast.send(&hub, MessageType::FieldUpdated, json!({"name": "email"}))
        .await;

    assert_eq!(slow.expect_closed().await, CloseReason::SlowConsumer);
    let left: UserLeft = fast
        .expect_kind(MessageType::UserLeft)
        .await
        .decode(&MessageType::UserLeft)
        .unwrap();
    assert_eq!(left.user_id, slow.user_id());
    assert_eq!(hub.room_size(room).await.unwrap(), 1);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let hub = spawn_hub();
    let room_a = Uuid::new_v4();
    let room_b = Uuid::new_v4();

    let a = TestClient::join(&hub, room_a, participant("a")).await;
    let b = TestClient::join(&hub, room_b, participant("b")).await;

    hub.shutdown().await.unwrap();

    assert_eq!(a.expect_closed().await, CloseReason::ServerShutdown);
    assert_eq!(b.expect_closed().await, CloseReason::ServerShutdown);

    let status = hub.status().await.unwrap();
    assert!(status.is_draining);
    assert_eq!(status.room_count, 0);
    assert_eq!(status.connection_count, 0);
}

#[tokio::test]
async fn test_double_shutdown_is_noop() {
    let hub = spawn_hub();
    hub.shutdown().await.unwrap();
    hub.shutdown().await.unwrap();

    hub.cancel();
    // After the actor stops, shutdown still succeeds
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_register_while_draining_is_rejected() {
    let hub = spawn_hub();
    hub.shutdown().await.unwrap();

    let result =
        TestClient::try_join_with_capacity(&hub, Uuid::new_v4(), participant("late"), 8).await;
    assert!(matches!(result, Err(CollabError::Draining)));
}

#[tokio::test]
async fn test_broadcast_after_shutdown_is_dropped() {
    let hub = spawn_hub();
    let room = Uuid::new_v4();
    let client = TestClient::join(&hub, room, participant("alice")).await;

    hub.shutdown().await.unwrap();
    client
        .send(&hub, MessageType::TableCreated, json!({"table_id": Uuid::new_v4()}))
        .await;

    assert_eq!(hub.room_size(room).await.unwrap(), 0);
}
