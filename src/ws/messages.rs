//! WebSocket message types: envelope and client commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level WebSocket message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    /// Client-provided ID for requests; server-generated for events.
    pub id: String,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: WsMessageType,
    /// ISO-8601 timestamp.
    pub timestamp: DateTime<Utc>,
    /// Variant-specific payload.
    pub payload: serde_json::Value,
}

impl WsMessage {
    /// Server message of the given type.
    #[must_use]
    pub fn server(
        id: impl Into<String>,
        msg_type: WsMessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            msg_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Error reply carrying a numeric code.
    #[must_use]
    pub fn error(id: impl Into<String>, code: u16, message: &str) -> Self {
        Self::server(
            id,
            WsMessageType::Error,
            serde_json::json!({ "code": code, "message": message }),
        )
    }
}

/// Discriminator for WebSocket message types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WsMessageType {
    /// Client → Server command.
    Command,
    /// Server → Client response to a command.
    Response,
    /// Server → Client snapshot update.
    Event,
    /// Server → Client error.
    Error,
}

/// Commands carried in the payload of a `command` message.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WsCommand {
    /// Receive snapshot updates for rooms. `"*"` subscribes to every room.
    Subscribe {
        /// Room IDs, or `"*"`.
        room_ids: Vec<String>,
    },
    /// Stop receiving updates for rooms. `"*"` clears the wildcard.
    Unsubscribe {
        /// Room IDs, or `"*"`.
        room_ids: Vec<String>,
    },
    /// Fetch the current snapshot of one room.
    GetSnapshot {
        /// Room ID.
        room_id: String,
    },
}
