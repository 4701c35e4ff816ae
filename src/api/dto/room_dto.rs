//! Room lifecycle DTOs: participant presence and room end.

use serde::Serialize;
use utoipa::ToSchema;

use super::EvaluateResponse;
use crate::domain::{RoomId, RoomSnapshot};

/// Response body for participant join and leave.
#[derive(Debug, Serialize, ToSchema)]
pub struct ParticipantResponse {
    /// Room.
    #[schema(value_type = String, format = Uuid)]
    pub room_id: RoomId,
    /// Participant handle.
    pub user_id: String,
    /// `joined` or `left`.
    pub presence: String,
    /// Auto-evaluation that followed the presence change.
    pub evaluation: EvaluateResponse,
}

/// Response body for `POST /rooms/{room_id}/end`.
#[derive(Debug, Serialize, ToSchema)]
pub struct EndRoomResponse {
    /// Snapshot after the session stopped.
    #[schema(value_type = Object)]
    pub snapshot: RoomSnapshot,
    /// Whether the media room was terminated.
    pub media_room_ended: bool,
    /// Distribution runs in the background; poll the payout endpoint.
    pub distribution: String,
}
