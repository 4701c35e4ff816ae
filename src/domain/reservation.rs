//! Ad reservations: one ad playing in one room for one rotation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{AdId, ReservationId, RoomId, SessionId};

/// Reservation state. Transitions are monotonic:
/// `reserved → completed | canceled`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Currently playing.
    Reserved,
    /// Ran to natural expiry.
    Completed,
    /// Stopped early (manual stop, room end, reaper).
    Canceled,
}

impl ReservationStatus {
    /// Returns the status as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Parses a stored status string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(Self::Reserved),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// One ad slot in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier.
    pub id: ReservationId,
    /// Advertisement being played.
    pub ad_id: AdId,
    /// Room it plays in.
    pub room_id: RoomId,
    /// Session that allocated it.
    pub session_id: SessionId,
    /// Slot length in seconds.
    pub duration_sec: u64,
    /// When the slot started.
    pub reserved_at: DateTime<Utc>,
    /// `reserved_at + duration_sec`.
    pub expires_at: DateTime<Utc>,
    /// Current state.
    pub status: ReservationStatus,
    /// Where ad events for this slot are delivered.
    pub webhook_url: Option<String>,
}

impl Reservation {
    /// Creates a new `reserved` slot starting at `reserved_at`.
    #[must_use]
    pub fn new(
        ad_id: AdId,
        room_id: RoomId,
        session_id: SessionId,
        duration_sec: u64,
        reserved_at: DateTime<Utc>,
        webhook_url: Option<String>,
    ) -> Self {
        let secs = i64::try_from(duration_sec).unwrap_or(i64::MAX);
        Self {
            id: ReservationId::new(),
            ad_id,
            room_id,
            session_id,
            duration_sec,
            reserved_at,
            expires_at: reserved_at + Duration::seconds(secs),
            status: ReservationStatus::Reserved,
            webhook_url,
        }
    }

    /// Returns `true` while the slot is playing.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    /// Returns `true` once `now` has reached the slot's end.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until the rotation should fire, zero if already due.
    ///
    /// Derived from `expires_at` rather than a fixed delay so a timer
    /// rescheduled after a restart resumes where it left off.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }

    /// Clamps a timestamp into `[reserved_at, expires_at]`.
    #[must_use]
    pub fn clamp(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.clamp(self.reserved_at, self.expires_at)
    }

    /// Slot length in milliseconds.
    #[must_use]
    pub const fn duration_ms(&self) -> u64 {
        self.duration_sec.saturating_mul(1000)
    }
}

/// Compact view of the playing reservation, embedded in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSummary {
    /// Reservation identifier.
    pub reservation_id: ReservationId,
    /// Advertisement being played.
    pub ad_id: AdId,
    /// Slot length in seconds.
    pub duration_sec: u64,
    /// Slot start.
    pub reserved_at: DateTime<Utc>,
    /// Slot end.
    pub expires_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationSummary {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            ad_id: r.ad_id,
            duration_sec: r.duration_sec,
            reserved_at: r.reserved_at,
            expires_at: r.expires_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn make(reserved_at: DateTime<Utc>) -> Reservation {
        Reservation::new(
            AdId::new(),
            RoomId::new(),
            SessionId::new(),
            300,
            reserved_at,
            None,
        )
    }

    #[test]
    fn expires_after_duration() {
        let start = Utc::now();
        let r = make(start);
        assert_eq!(r.expires_at - r.reserved_at, Duration::seconds(300));
        assert!(r.is_reserved());
        assert!(!r.is_expired_at(start));
        assert!(r.is_expired_at(start + Duration::seconds(300)));
    }

    #[test]
    fn remaining_is_relative_to_expiry() {
        let start = Utc::now();
        let r = make(start);
        assert_eq!(
            r.remaining_at(start + Duration::seconds(100)),
            std::time::Duration::from_secs(200)
        );
        assert_eq!(
            r.remaining_at(start + Duration::seconds(900)),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn clamp_stays_inside_slot() {
        let start = Utc::now();
        let r = make(start);
        assert_eq!(r.clamp(start - Duration::seconds(5)), start);
        assert_eq!(r.clamp(start + Duration::seconds(999)), r.expires_at);
    }

    #[test]
    fn status_round_trips_through_storage_strings() {
        for status in [
            ReservationStatus::Reserved,
            ReservationStatus::Completed,
            ReservationStatus::Canceled,
        ] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("bogus"), None);
    }
}
