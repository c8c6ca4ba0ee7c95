//! Payload layouts for the message types the hub itself produces or reads.
//!
//! Schema-edit payloads (`table_*`, `field_*`, `relationship_*`,
//! `canvas_updated`) are owned by the CRUD services and relayed opaquely.
//! [`TableEvent`] is the one typed view, used when the table service
//! pushes an edit through `HubHandle::notify`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor position on the design canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// One user currently connected to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub last_seen: DateTime<Utc>,
}

/// `user_joined`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoined {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: String,
}

/// `user_left`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeft {
    pub user_id: Uuid,
    pub display_name: String,
}

/// `user_cursor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCursor {
    #[serde(flatten)]
    pub position: Cursor,
    /// Element under the cursor (table or field id), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
}

/// `presence_snapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub users: Vec<PresenceEntry>,
}

/// `auth` (in-band authentication, first frame only)
#[derive(Debug, Clone, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// `table_created` / `table_updated` / `table_moved` / `table_deleted`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEvent {
    pub table_id: Uuid,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Empty payload used by `ping` and `pong`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, MessageType};
    use serde_json::json;

    #[test]
    fn test_user_cursor_flattens_position() {
        let cursor = UserCursor {
            position: Cursor { x: 10.5, y: -3.0 },
            target_id: None,
        };
        let value = serde_json::to_value(&cursor).unwrap();
        assert_eq!(value, json!({"x": 10.5, "y": -3.0}));
    }

    #[test]
    fn test_table_event_keeps_unknown_attributes() {
        let table_id = Uuid::new_v4();
        let raw = json!({
            "table_id": table_id,
            "name": "orders",
            "position": {"x": 120, "y": 80}
        });
        let envelope =
            Envelope::from_parts(MessageType::TableMoved, raw, Some(Uuid::new_v4()), Uuid::new_v4());

        let event: TableEvent = envelope.decode(&MessageType::TableMoved).unwrap();
        assert_eq!(event.table_id, table_id);
        assert_eq!(event.attributes["name"], "orders");
        assert_eq!(event.attributes["position"]["x"], 120);
    }

    #[test]
    fn test_presence_entry_omits_missing_cursor() {
        let entry = PresenceEntry {
            user_id: Uuid::new_v4(),
            display_name: "Ada".to_string(),
            color: "#E57373".to_string(),
            cursor: None,
            last_seen: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("cursor").is_none());
    }
}
