//! Wire envelope and the closed set of message types.
//!
//! Every frame on the wire is a JSON object:
//!
//! ```text
//! {"type": "...", "data": {...}, "user_id": uuid, "project_id": uuid, "timestamp": RFC3339}
//! ```
//!
//! Field names are a compatibility contract with browser clients. Unknown
//! `type` values survive a decode/encode cycle untouched so that newer
//! clients can exchange messages through an older hub.

use crate::errors::CollabError;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message type carried in the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    UserJoined,
    UserLeft,
    UserCursor,
    UserPresence,
    PresenceSnapshot,
    TableCreated,
    TableUpdated,
    TableMoved,
    TableDeleted,
    FieldCreated,
    FieldUpdated,
    FieldDeleted,
    RelationshipCreate,
    RelationshipUpdate,
    RelationshipDelete,
    CanvasUpdated,
    Auth,
    Error,
    Ping,
    Pong,
    /// A type this build does not know; routed without interpretation.
    Other(String),
}

impl MessageType {
    /// Returns the wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::UserJoined => "user_joined",
            MessageType::UserLeft => "user_left",
            MessageType::UserCursor => "user_cursor",
            MessageType::UserPresence => "user_presence",
            MessageType::PresenceSnapshot => "presence_snapshot",
            MessageType::TableCreated => "table_created",
            MessageType::TableUpdated => "table_updated",
            MessageType::TableMoved => "table_moved",
            MessageType::TableDeleted => "table_deleted",
            MessageType::FieldCreated => "field_created",
            MessageType::FieldUpdated => "field_updated",
            MessageType::FieldDeleted => "field_deleted",
            MessageType::RelationshipCreate => "relationship_create",
            MessageType::RelationshipUpdate => "relationship_update",
            MessageType::RelationshipDelete => "relationship_delete",
            MessageType::CanvasUpdated => "canvas_updated",
            MessageType::Auth => "auth",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Other(name) => name,
        }
    }

    /// Bounded label for metrics; unknown types collapse to `"other"`.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            MessageType::UserJoined => "user_joined",
            MessageType::UserLeft => "user_left",
            MessageType::UserCursor => "user_cursor",
            MessageType::UserPresence => "user_presence",
            MessageType::PresenceSnapshot => "presence_snapshot",
            MessageType::TableCreated
            | MessageType::TableUpdated
            | MessageType::TableMoved
            | MessageType::TableDeleted => "table",
            MessageType::FieldCreated | MessageType::FieldUpdated | MessageType::FieldDeleted => {
                "field"
            }
            MessageType::RelationshipCreate
            | MessageType::RelationshipUpdate
            | MessageType::RelationshipDelete => "relationship",
            MessageType::CanvasUpdated => "canvas_updated",
            MessageType::Auth => "auth",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Other(_) => "other",
        }
    }

    /// Whether a client may fan this type out to the rest of its room.
    ///
    /// Control types (`auth`, `error`, `ping`, `pong`) and hub-generated
    /// membership events are never relayed from clients.
    #[must_use]
    pub fn is_client_broadcastable(&self) -> bool {
        !matches!(
            self,
            MessageType::Auth
                | MessageType::Error
                | MessageType::Ping
                | MessageType::Pong
                | MessageType::UserJoined
                | MessageType::UserLeft
                | MessageType::PresenceSnapshot
        )
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "user_joined" => MessageType::UserJoined,
            "user_left" => MessageType::UserLeft,
            "user_cursor" => MessageType::UserCursor,
            "user_presence" => MessageType::UserPresence,
            "presence_snapshot" => MessageType::PresenceSnapshot,
            "table_created" => MessageType::TableCreated,
            "table_updated" => MessageType::TableUpdated,
            "table_moved" => MessageType::TableMoved,
            "table_deleted" => MessageType::TableDeleted,
            "field_created" => MessageType::FieldCreated,
            "field_updated" => MessageType::FieldUpdated,
            "field_deleted" => MessageType::FieldDeleted,
            "relationship_create" => MessageType::RelationshipCreate,
            "relationship_update" => MessageType::RelationshipUpdate,
            "relationship_delete" => MessageType::RelationshipDelete,
            "canvas_updated" => MessageType::CanvasUpdated,
            "auth" => MessageType::Auth,
            "error" => MessageType::Error,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed wire message.
///
/// `data` is kept as an opaque JSON value; its layout is determined by
/// `kind` and interpreted only through [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Sender user id; `None` for hub-originated messages.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub project_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Serialize `payload` into a new envelope stamped with the current time.
    pub fn encode<P: Serialize>(
        kind: MessageType,
        payload: &P,
        sender: Option<Uuid>,
        project_id: Uuid,
    ) -> Result<Self, CollabError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| CollabError::Internal(format!("payload serialization failed: {e}")))?;
        Ok(Self::from_parts(kind, data, sender, project_id))
    }

    /// Build an envelope around an already-serialized payload.
    #[must_use]
    pub fn from_parts(
        kind: MessageType,
        data: serde_json::Value,
        sender: Option<Uuid>,
        project_id: Uuid,
    ) -> Self {
        Self {
            kind,
            data,
            user_id: sender,
            project_id,
            timestamp: Utc::now(),
        }
    }

    /// Decode the payload as `P`, requiring the envelope to carry `expected`.
    pub fn decode<P: DeserializeOwned>(&self, expected: &MessageType) -> Result<P, CollabError> {
        if &self.kind != expected {
            return Err(CollabError::Decode(format!(
                "expected {expected} payload, got {}",
                self.kind
            )));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| CollabError::Decode(format!("invalid {expected} payload: {e}")))
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_frame(&self) -> Result<Bytes, CollabError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CollabError::Internal(format!("envelope serialization failed: {e}")))
    }

    /// Parse a full envelope (as produced by [`Envelope::to_frame`]).
    pub fn from_frame(frame: &[u8]) -> Result<Self, CollabError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Frame as sent by a browser client.
///
/// Clients only choose `type` and `data`; sender, room and timestamp are
/// stamped by the server so a client cannot impersonate another user.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundFrame {
    /// Parse a client frame, enforcing the size bound before touching JSON.
    pub fn parse(frame: &[u8], max_bytes: usize) -> Result<Self, CollabError> {
        if frame.len() > max_bytes {
            return Err(CollabError::FrameTooLarge {
                size: frame.len(),
                max: max_bytes,
            });
        }
        Ok(serde_json::from_slice(frame)?)
    }

    /// Stamp server-side identity onto the frame.
    #[must_use]
    pub fn into_envelope(self, sender: Uuid, project_id: Uuid) -> Envelope {
        Envelope::from_parts(self.kind, self.data, Some(sender), project_id)
    }
}
