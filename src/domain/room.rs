//! Room settings as seen by the ad engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RoomId;

/// The slice of a room record the ad engine needs. Owned by the room
/// layer; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Room identifier.
    pub id: RoomId,
    /// Whether the host allows ads in this room.
    pub ads_enabled: bool,
    /// Set once the room has ended.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Room {
    /// Returns `true` while the room is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.ended_at.is_none()
    }
}
