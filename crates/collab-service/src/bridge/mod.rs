//! Cross-process bridge.
//!
//! Rooms served by several hub instances stay consistent by relaying every
//! local broadcast through an external pub/sub medium. The hub only sees the
//! narrow [`Bridge`] interface, so it runs unchanged in single-instance mode
//! with [`NoopBridge`].
//!
//! All methods are synchronous and must return without waiting on the
//! medium: they are called from the hub control loop.

pub mod pubsub;
pub mod redis;

pub use pubsub::{BridgeFrame, PubSubBridge, PubSubMedium};
pub use redis::RedisMedium;

use crate::hub::{ForeignMessage, RoomId};

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Relay between the local hub and other instances.
pub trait Bridge: Send + Sync + fmt::Debug {
    /// Whether a medium is configured.
    fn is_enabled(&self) -> bool;

    /// Publish an encoded envelope for `room_id`. Best-effort; failures are
    /// logged and swallowed.
    fn publish(&self, room_id: RoomId, sender: Option<Uuid>, frame: Bytes);

    /// Start relaying foreign frames for `room_id` into `sink`.
    ///
    /// A no-op if the room is already subscribed.
    fn subscribe(&self, room_id: RoomId, sink: mpsc::Sender<ForeignMessage>);

    /// Stop relaying `room_id`. A no-op if not subscribed.
    fn unsubscribe(&self, room_id: RoomId);

    /// Cancel every subscription and stop publishing.
    fn shutdown(&self);
}

/// Single-instance mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBridge;

impl Bridge for NoopBridge {
    fn is_enabled(&self) -> bool {
        false
    }

    fn publish(&self, _room_id: RoomId, _sender: Option<Uuid>, _frame: Bytes) {}

    fn subscribe(&self, _room_id: RoomId, _sink: mpsc::Sender<ForeignMessage>) {}

    fn unsubscribe(&self, _room_id: RoomId) {}

    fn shutdown(&self) {}
}
