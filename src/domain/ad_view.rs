//! Durable watch records produced by the watch-time tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reservation::Reservation;
use super::{AdId, ReservationId, RoomId, SessionId, UserId};

/// How long one viewer watched one reservation.
///
/// Unique per `(reservation_id, user_id)`; a repeated flush replaces the
/// row rather than adding to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdView {
    /// Reservation watched.
    pub reservation_id: ReservationId,
    /// Advertisement shown.
    pub ad_id: AdId,
    /// Room it played in.
    pub room_id: RoomId,
    /// Session it belonged to.
    pub session_id: SessionId,
    /// Viewer.
    pub user_id: UserId,
    /// Exposure in milliseconds, at most the reservation length.
    pub watched_ms: u64,
    /// Reservation start.
    pub started_at: DateTime<Utc>,
    /// Reservation end.
    pub completed_at: DateTime<Utc>,
}

impl AdView {
    /// Builds the view record for `user_id` on `reservation`, capping the
    /// exposure at the reservation length.
    #[must_use]
    pub fn for_reservation(reservation: &Reservation, user_id: UserId, watched_ms: u64) -> Self {
        Self {
            reservation_id: reservation.id,
            ad_id: reservation.ad_id,
            room_id: reservation.room_id,
            session_id: reservation.session_id,
            user_id,
            watched_ms: watched_ms.min(reservation.duration_ms()),
            started_at: reservation.reserved_at,
            completed_at: reservation.expires_at,
        }
    }
}
