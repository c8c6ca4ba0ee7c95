//! Wire protocol: envelope, message types and payload layouts.

pub mod envelope;
pub mod payloads;

pub use envelope::{Envelope, InboundFrame, MessageType};
pub use payloads::{
    AuthRequest, Cursor, Empty, ErrorPayload, PresenceEntry, PresenceSnapshot, TableEvent,
    UserCursor, UserJoined, UserLeft,
};
