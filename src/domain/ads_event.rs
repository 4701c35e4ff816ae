//! Ad lifecycle events delivered to webhooks.
//!
//! Every session transition emits one [`AdsEvent`]. The dispatcher wraps it
//! in a signed envelope; the event itself only knows its wire name, its
//! idempotency key and its payload fields.

use serde::Serialize;

use super::{AdId, IdleReason, ReservationId, RoomId, SessionId, StopReason};

/// Event emitted on a session transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum AdsEvent {
    /// A session opened in a room.
    #[serde(rename = "ads.session.started")]
    SessionStarted {
        /// Room.
        room_id: RoomId,
        /// New session.
        session_id: SessionId,
        /// Viewers at start.
        participant_count: u32,
    },

    /// A reservation started playing.
    #[serde(rename = "ads.ad.started")]
    AdStarted {
        /// Room.
        room_id: RoomId,
        /// Session.
        session_id: SessionId,
        /// Reservation.
        reservation_id: ReservationId,
        /// Advertisement.
        ad_id: AdId,
        /// Slot length.
        duration_sec: u64,
        /// Viewers at allocation.
        participant_count: u32,
        /// Campaign audience threshold.
        min_participants: u32,
    },

    /// A reservation ran to its natural end.
    #[serde(rename = "ads.ad.completed")]
    AdCompleted {
        /// Room.
        room_id: RoomId,
        /// Session.
        session_id: SessionId,
        /// Reservation.
        reservation_id: ReservationId,
        /// Advertisement.
        ad_id: AdId,
        /// Slot length.
        duration_sec: u64,
    },

    /// Allocation found nothing to play.
    #[serde(rename = "ads.session.idle")]
    SessionIdle {
        /// Room.
        room_id: RoomId,
        /// Session.
        session_id: SessionId,
        /// Why nothing was allocated.
        reason: IdleReason,
        /// Viewers at the attempt.
        participant_count: u32,
    },

    /// A session stopped.
    #[serde(rename = "ads.session.stopped")]
    SessionStopped {
        /// Room.
        room_id: RoomId,
        /// Session.
        session_id: SessionId,
        /// Why it stopped.
        reason: StopReason,
    },
}

impl AdsEvent {
    /// Wire name sent in `X-Ads-Event`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "ads.session.started",
            Self::AdStarted { .. } => "ads.ad.started",
            Self::AdCompleted { .. } => "ads.ad.completed",
            Self::SessionIdle { .. } => "ads.session.idle",
            Self::SessionStopped { .. } => "ads.session.stopped",
        }
    }

    /// Room the event belongs to.
    #[must_use]
    pub const fn room_id(&self) -> RoomId {
        match self {
            Self::SessionStarted { room_id, .. }
            | Self::AdStarted { room_id, .. }
            | Self::AdCompleted { room_id, .. }
            | Self::SessionIdle { room_id, .. }
            | Self::SessionStopped { room_id, .. } => *room_id,
        }
    }

    /// Session the event belongs to.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::AdStarted { session_id, .. }
            | Self::AdCompleted { session_id, .. }
            | Self::SessionIdle { session_id, .. }
            | Self::SessionStopped { session_id, .. } => *session_id,
        }
    }

    /// Reservation the event belongs to, for ad events.
    #[must_use]
    pub const fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            Self::AdStarted { reservation_id, .. } | Self::AdCompleted { reservation_id, .. } => {
                Some(*reservation_id)
            }
            _ => None,
        }
    }

    /// Key that is identical for every delivery of the same logical event.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self.reservation_id() {
            Some(reservation_id) => format!(
                "{}:{}:{}:{}",
                self.name(),
                self.room_id(),
                self.session_id(),
                reservation_id
            ),
            None => format!("{}:{}:{}", self.name(), self.room_id(), self.session_id()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_dotted_name_and_camel_case_fields() {
        let event = AdsEvent::AdStarted {
            room_id: RoomId::new(),
            session_id: SessionId::new(),
            reservation_id: ReservationId::new(),
            ad_id: AdId::new(),
            duration_sec: 300,
            participant_count: 2,
            min_participants: 1,
        };
        let json = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(json["event"], "ads.ad.started");
        assert_eq!(json["durationSec"], 300);
        assert_eq!(json["minParticipants"], 1);
        assert!(json.get("roomId").is_some());
    }

    #[test]
    fn idempotency_key_is_stable_and_scoped() {
        let room_id = RoomId::new();
        let session_id = SessionId::new();
        let stopped = AdsEvent::SessionStopped {
            room_id,
            session_id,
            reason: StopReason::Manual,
        };
        assert_eq!(stopped.idempotency_key(), stopped.clone().idempotency_key());
        assert_eq!(
            stopped.idempotency_key(),
            format!("ads.session.stopped:{room_id}:{session_id}")
        );

        let completed = AdsEvent::AdCompleted {
            room_id,
            session_id,
            reservation_id: ReservationId::new(),
            ad_id: AdId::new(),
            duration_sec: 60,
        };
        assert!(completed.idempotency_key().starts_with("ads.ad.completed:"));
        assert_eq!(completed.idempotency_key().matches(':').count(), 3);
    }

    #[test]
    fn idle_reason_is_snake_case() {
        let event = AdsEvent::SessionIdle {
            room_id: RoomId::new(),
            session_id: SessionId::new(),
            reason: IdleReason::NoInventory,
            participant_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(json["reason"], "no_inventory");
        assert_eq!(event.name(), "ads.session.idle");
    }
}
