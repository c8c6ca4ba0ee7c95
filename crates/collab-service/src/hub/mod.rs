//! Room registry and fan-out.
//!
//! A single hub actor, reached through [`HubHandle`], owns every room. Rooms are implicit:
//! a room exists while it has at least one connection, is created on first
//! join (subscribing the bridge) and removed on last leave (unsubscribing).

pub mod connection;
pub mod controller;
pub mod messages;

pub use connection::{
    CloseReason, Connection, ConnectionId, ConnectionLink, ConnectionReceiver, OutboundFrame,
    Participant, RoomId, SendOutcome,
};
pub use controller::{HubConfig, HubHandle, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_STALE_AFTER};
pub use messages::{ForeignMessage, HubMessage, HubStatus};
