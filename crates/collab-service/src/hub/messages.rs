//! Messages consumed by the hub control loop.
//!
//! Requests that need an answer carry a `oneshot` reply channel; the rest are
//! fire-and-forget and applied in submission order.

use super::connection::{CloseReason, Connection, ConnectionId, RoomId};
use crate::errors::CollabError;
use crate::protocol::{Envelope, PresenceEntry};

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Requests sent to the `HubActor` through its mailbox.
#[derive(Debug)]
pub enum HubMessage {
    /// Add a connection to its room.
    Register {
        connection: Connection,
        /// Rejected with `CollabError::Draining` after shutdown began.
        respond_to: oneshot::Sender<Result<(), CollabError>>,
    },

    /// Remove a connection. Unknown ids are ignored.
    Unregister {
        connection_id: ConnectionId,
        reason: CloseReason,
    },

    /// Fan an envelope out to a room.
    Broadcast {
        room_id: RoomId,
        envelope: Envelope,
        /// Member to skip, usually the sender.
        except: Option<ConnectionId>,
    },

    /// Presence snapshot of a room.
    Presence {
        room_id: RoomId,
        respond_to: oneshot::Sender<Vec<PresenceEntry>>,
    },

    /// Number of connections registered in a room.
    RoomSize {
        room_id: RoomId,
        respond_to: oneshot::Sender<usize>,
    },

    /// Hub-wide counters.
    GetStatus {
        respond_to: oneshot::Sender<HubStatus>,
    },

    /// Drain and close everything.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Frame received from another instance through the bridge.
///
/// Delivered to local members only; never republished.
#[derive(Debug, Clone)]
pub struct ForeignMessage {
    pub room_id: RoomId,
    /// Declared sender; local connections of this user are skipped.
    pub sender: Option<Uuid>,
    /// Encoded envelope, forwarded as-is.
    pub frame: Bytes,
}

/// Hub status for health checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStatus {
    pub room_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub bridge_enabled: bool,
}
