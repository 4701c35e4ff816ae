//! Cached per-room projection of the ad state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reservation::ReservationSummary;
use super::{RoomId, SessionId, SessionState};

/// Read model of a room's ad state.
///
/// Rewritten on every transition and published to live subscribers.
/// It is a projection, never the source of truth: if it expires it is
/// rebuilt from the reservation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Room this snapshot describes.
    pub room_id: RoomId,
    /// Incremented on every write.
    pub version: u64,
    /// Session state.
    pub state: SessionState,
    /// Active (or last) session.
    pub session_id: Option<SessionId>,
    /// Reservation currently playing.
    pub current: Option<ReservationSummary>,
    /// Name of the last emitted event, e.g. `ads.ad.started`.
    pub last_event: Option<String>,
    /// Why the session stopped or went idle.
    pub reason: Option<String>,
    /// Viewer count at the last transition.
    pub participant_count: u32,
    /// Audience threshold of the playing ad.
    pub min_participants: Option<u32>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl RoomSnapshot {
    /// An empty, stopped snapshot at version 0.
    #[must_use]
    pub fn stopped(room_id: RoomId) -> Self {
        Self {
            room_id,
            version: 0,
            state: SessionState::Stopped,
            session_id: None,
            current: None,
            last_event: None,
            reason: None,
            participant_count: 0,
            min_participants: None,
            updated_at: Utc::now(),
        }
    }

    /// Returns `true` if a session is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Returns `true` if the snapshot is running under `session_id`.
    #[must_use]
    pub fn is_running_session(&self, session_id: SessionId) -> bool {
        self.is_running() && self.session_id == Some(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_snapshot_is_not_running() {
        let snap = RoomSnapshot::stopped(RoomId::new());
        assert!(!snap.is_running());
        assert_eq!(snap.version, 0);
        assert!(snap.current.is_none());
    }

    #[test]
    fn running_session_check_matches_session() {
        let session = SessionId::new();
        let mut snap = RoomSnapshot::stopped(RoomId::new());
        snap.state = SessionState::Running;
        snap.session_id = Some(session);
        assert!(snap.is_running_session(session));
        assert!(!snap.is_running_session(SessionId::new()));
    }
}
