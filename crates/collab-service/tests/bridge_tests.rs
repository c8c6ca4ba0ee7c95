//! Cross-instance tests: several hubs bridged through one in-memory medium.
//!
//! Covers:
//! - Relay of local broadcasts to other instances
//! - Same-user loop avoidance
//! - Subscription lifecycle (one per room, released on last leave and shutdown)
//! - Degraded mode when the medium fails, and recovery afterwards

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use collab_service::bridge::{Bridge, PubSubBridge};
use collab_service::hub::HubConfig;
use collab_service::protocol::{MessageType, UserJoined};
use collab_test_utils::{
    participant, spawn_bridged_hub, spawn_hub_with, test_channel, InMemoryMedium, TestClient,
    TEST_CHANNEL_PREFIX,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test]
async fn test_broadcast_reaches_other_instance() {
    let medium = Arc::new(InMemoryMedium::new());
    let (hub_a, _) = spawn_bridged_hub(&medium, "instance-a");
    let (hub_b, _) = spawn_bridged_hub(&medium, "instance-b");
    let room = Uuid::new_v4();
    let channel = test_channel(room);

    let mut alice = TestClient::join(&hub_a, room, participant("alice")).await;
    alice.expect_kind(MessageType::PresenceSnapshot).await;
    medium.wait_for_subscribers(&channel, 1).await;

    let mut bob = TestClient::join(&hub_b, room, participant("bob")).await;
    // Presence snapshots are per instance
    let snapshot = bob.expect_kind(MessageType::PresenceSnapshot).await;
    assert_eq!(snapshot.data["users"].as_array().unwrap().len(), 1);
    medium.wait_for_subscribers(&channel, 2).await;

    // Bob's arrival is relayed to Alice
    let joined: UserJoined = alice
        .expect_kind(MessageType::UserJoined)
        .await
        .decode(&MessageType::UserJoined)
        .unwrap();
    assert_eq!(joined.user_id, bob.user_id());

    alice
        .send(&hub_a, MessageType::TableCreated, json!({"table_id": Uuid::new_v4()}))
        .await;

    let relayed = bob.expect_kind(MessageType::TableCreated).await;
    assert_eq!(relayed.user_id, Some(alice.user_id()));
    assert_eq!(relayed.project_id, room);

    // Own frames are not echoed back through the medium
    alice.expect_silence().await;
}

#[tokio::test]
async fn test_foreign_frames_skip_same_user() {
    let medium = Arc::new(InMemoryMedium::new());
    let (hub_a, _) = spawn_bridged_hub(&medium, "instance-a");
    let (hub_b, _) = spawn_bridged_hub(&medium, "instance-b");
    let room = Uuid::new_v4();
    let channel = test_channel(room);
    let alice = participant("alice");

    let mut alice_a = TestClient::join(&hub_a, room, alice.clone()).await;
    alice_a.drain();
    medium.wait_for_subscribers(&channel, 1).await;

    let mut alice_b = TestClient::join(&hub_b, room, alice).await;
    let mut carol = TestClient::join(&hub_b, room, participant("carol")).await;
    alice_b.drain();
    carol.drain();
    medium.wait_for_subscribers(&channel, 2).await;

    // Alice's second tab is never announced to her first; Carol is
    let joined: UserJoined = alice_a
        .expect_kind(MessageType::UserJoined)
        .await
        .decode(&MessageType::UserJoined)
        .unwrap();
    assert_eq!(joined.user_id, carol.user_id());

    alice_a
        .send(&hub_a, MessageType::FieldCreated, json!({"name": "id"}))
        .await;

    carol.expect_kind(MessageType::FieldCreated).await;
    alice_b.expect_silence().await;
}

#[tokio::test]
async fn test_foreign_frames_are_not_republished() {
    let medium = Arc::new(InMemoryMedium::new());
    let (hub_a, _) = spawn_bridged_hub(&medium, "instance-a");
    let (hub_b, _) = spawn_bridged_hub(&medium, "instance-b");
    let room = Uuid::new_v4();
    let channel = test_channel(room);

    let alice = TestClient::join(&hub_a, room, participant("alice")).await;
    let mut bob = TestClient::join(&hub_b, room, participant("bob")).await;
    medium.wait_for_subscribers(&channel, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    bob.drain();

    let before = medium.published_count();
    alice
        .send(&hub_a, MessageType::TableUpdated, json!({"table_id": Uuid::new_v4()}))
        .await;
    bob.expect_kind(MessageType::TableUpdated).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(medium.published_count(), before + 1);
}

#[tokio::test]
async fn test_one_subscription_per_room() {
    let medium = Arc::new(InMemoryMedium::new());
    let (hub, bridge) = spawn_bridged_hub(&medium, "instance-a");
    let room = Uuid::new_v4();
    let channel = test_channel(room);

    let first = TestClient::join(&hub, room, participant("first")).await;
    let second = TestClient::join(&hub, room, participant("second")).await;
    medium.wait_for_subscribers(&channel, 1).await;
    assert_eq!(bridge.subscription_count(), 1);

    first.leave(&hub).await;
    assert_eq!(hub.room_size(room).await.unwrap(), 1);
    assert!(bridge.is_subscribed(room));

    // Last leave releases the subscription
    second.leave(&hub).await;
    assert_eq!(hub.room_size(room).await.unwrap(), 0);
    assert!(!bridge.is_subscribed(room));
    medium.wait_for_subscribers(&channel, 0).await;
}

#[tokio::test]
async fn test_direct_subscribe_is_idempotent() {
    let medium = Arc::new(InMemoryMedium::new());
    let bridge = PubSubBridge::new(Arc::clone(&medium), "instance-a", TEST_CHANNEL_PREFIX);
    let room = Uuid::new_v4();
    let (sink, _foreign) = mpsc::channel(8);

    bridge.subscribe(room, sink.clone());
    bridge.subscribe(room, sink);
    medium.wait_for_subscribers(&bridge.channel_for(room), 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(bridge.subscription_count(), 1);
    assert_eq!(medium.subscriber_count(&bridge.channel_for(room)), 1);

    bridge.unsubscribe(room);
    bridge.unsubscribe(room);
    medium.wait_for_subscribers(&bridge.channel_for(room), 0).await;
    assert_eq!(bridge.subscription_count(), 0);
}

#[tokio::test]
async fn test_shutdown_releases_subscriptions() {
    let medium = Arc::new(InMemoryMedium::new());
    let (hub, bridge) = spawn_bridged_hub(&medium, "instance-a");
    let rooms = [Uuid::new_v4(), Uuid::new_v4()];

    let mut clients = Vec::new();
    for room in rooms {
        clients.push(TestClient::join(&hub, room, participant("user")).await);
        medium.wait_for_subscribers(&test_channel(room), 1).await;
    }

    hub.shutdown().await.unwrap();

    assert_eq!(bridge.subscription_count(), 0);
    for room in rooms {
        medium.wait_for_subscribers(&test_channel(room), 0).await;
    }
}

#[tokio::test]
async fn test_failing_medium_keeps_local_delivery() {
    let medium = Arc::new(InMemoryMedium::failing());
    let bridge = Arc::new(PubSubBridge::new(
        Arc::clone(&medium),
        "instance-a",
        TEST_CHANNEL_PREFIX,
    ));
    let hub = spawn_hub_with(HubConfig::default(), bridge);
    let room = Uuid::new_v4();

    let alice = TestClient::join(&hub, room, participant("alice")).await;
    let mut bob = TestClient::join(&hub, room, participant("bob")).await;
    bob.drain();

    alice
        .send(&hub, MessageType::RelationshipCreate, json!({"relationship_id": Uuid::new_v4()}))
        .await;

    bob.expect_kind(MessageType::RelationshipCreate).await;
    assert!(hub.status().await.unwrap().bridge_enabled);
    assert_eq!(medium.published_count(), 0);
}

#[tokio::test]
async fn test_room_recovers_after_medium_outage() {
    let medium = Arc::new(InMemoryMedium::failing());
    let (hub_a, bridge_a) = spawn_bridged_hub(&medium, "instance-a");
    let (hub_b, _) = spawn_bridged_hub(&medium, "instance-b");
    let room = Uuid::new_v4();
    let channel = test_channel(room);

    let mut alice = TestClient::join(&hub_a, room, participant("alice")).await;
    alice.expect_kind(MessageType::PresenceSnapshot).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(medium.subscriber_count(&channel), 0);

    medium.set_failing(false);
    let mut carol = TestClient::join(&hub_a, room, participant("carol")).await;
    carol.drain();
    alice.expect_kind(MessageType::UserJoined).await;
    medium.wait_for_subscribers(&channel, 1).await;
    assert_eq!(bridge_a.subscription_count(), 1);

    let mut bob = TestClient::join(&hub_b, room, participant("bob")).await;
    bob.drain();
    medium.wait_for_subscribers(&channel, 2).await;
    let joined: UserJoined = alice
        .expect_kind(MessageType::UserJoined)
        .await
        .decode(&MessageType::UserJoined)
        .unwrap();
    assert_eq!(joined.user_id, bob.user_id());

    bob.send(&hub_b, MessageType::TableCreated, json!({"table_id": Uuid::new_v4()}))
        .await;

    let relayed = alice.expect_kind(MessageType::TableCreated).await;
    assert_eq!(relayed.user_id, Some(bob.user_id()));
    carol.expect_kind(MessageType::UserJoined).await;
    carol.expect_kind(MessageType::TableCreated).await;
}

#[tokio::test]
async fn test_lost_subscription_is_restored() {
    let medium = Arc::new(InMemoryMedium::new());
    let (hub_a, _) = spawn_bridged_hub(&medium, "instance-a");
    let (hub_b, _) = spawn_bridged_hub(&medium, "instance-b");
    let room = Uuid::new_v4();
    let channel = test_channel(room);

    let mut alice = TestClient::join(&hub_a, room, participant("alice")).await;
    let mut bob = TestClient::join(&hub_b, room, participant("bob")).await;
    medium.wait_for_subscribers(&channel, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    alice.drain();
    bob.drain();

    medium.disconnect(&channel);
    assert_eq!(medium.subscriber_count(&channel), 0);
    medium.wait_for_subscribers(&channel, 2).await;

    bob.send(&hub_b, MessageType::TableDeleted, json!({"table_id": Uuid::new_v4()}))
        .await;
    alice.expect_kind(MessageType::TableDeleted).await;
}
