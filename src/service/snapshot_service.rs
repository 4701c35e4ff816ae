//! Snapshot service: reads, rebuilds and publishes room snapshots.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::coordination::SnapshotCache;
use crate::domain::{
    EventBus, Reservation, ReservationSummary, RoomId, RoomSnapshot, SessionId, SessionState,
};
use crate::error::AdsError;
use crate::persistence::ReservationStore;

/// Default time a snapshot survives without being rewritten.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Owns the per-room snapshot projection.
///
/// Every write goes through [`SnapshotService::write`], which stores the
/// snapshot with a fresh version and publishes it on the [`EventBus`].
#[derive(Clone)]
pub struct SnapshotService {
    cache: Arc<dyn SnapshotCache>,
    reservations: Arc<dyn ReservationStore>,
    event_bus: EventBus,
    ttl: Duration,
}

impl fmt::Debug for SnapshotService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotService")
            .field("ttl", &self.ttl)
            .field("subscribers", &self.event_bus.receiver_count())
            .finish_non_exhaustive()
    }
}

impl SnapshotService {
    /// Creates a new `SnapshotService`.
    #[must_use]
    pub fn new(
        cache: Arc<dyn SnapshotCache>,
        reservations: Arc<dyn ReservationStore>,
        event_bus: EventBus,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            reservations,
            event_bus,
            ttl,
        }
    }

    /// Returns a reference to the inner [`EventBus`].
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Current snapshot for a room, rebuilt from the reservation store when
    /// the cached copy is missing.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the cache or the store fails.
    pub async fn get(&self, room_id: RoomId) -> Result<RoomSnapshot, AdsError> {
        if let Some(snapshot) = self.cache.get(room_id).await? {
            return Ok(snapshot);
        }
        self.rebuild(room_id).await
    }

    /// Rebuilds the projection from durable state.
    ///
    /// A reserved reservation yields a `running` snapshot, which is cached
    /// and published. Otherwise a `stopped` snapshot is returned without
    /// being stored.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the cache or the store fails.
    pub async fn rebuild(&self, room_id: RoomId) -> Result<RoomSnapshot, AdsError> {
        match self.reservations.find_reserved_for_room(room_id).await? {
            Some(reservation) => {
                tracing::debug!(%room_id, reservation_id = %reservation.id, "rebuilding running snapshot");
                let snapshot = Self::running(&reservation, 0, None, None);
                self.write(snapshot).await
            }
            None => Ok(RoomSnapshot::stopped(room_id)),
        }
    }

    /// Stores a snapshot and publishes the stored version.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if the cache write fails.
    pub async fn write(&self, mut snapshot: RoomSnapshot) -> Result<RoomSnapshot, AdsError> {
        snapshot.updated_at = Utc::now();
        let stored = self.cache.put(snapshot, self.ttl).await?;
        let _ = self.event_bus.publish(stored.clone());
        tracing::debug!(
            room_id = %stored.room_id,
            version = stored.version,
            state = stored.state.as_str(),
            "snapshot written"
        );
        Ok(stored)
    }

    /// Stores and publishes a snapshot only if the room is still at
    /// `expected_version`. Returns `None` when a newer write exists.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if the cache write fails.
    pub async fn write_if_current(
        &self,
        mut snapshot: RoomSnapshot,
        expected_version: u64,
    ) -> Result<Option<RoomSnapshot>, AdsError> {
        snapshot.updated_at = Utc::now();
        let Some(stored) = self
            .cache
            .put_if_version(snapshot, expected_version, self.ttl)
            .await?
        else {
            return Ok(None);
        };
        let _ = self.event_bus.publish(stored.clone());
        tracing::debug!(
            room_id = %stored.room_id,
            version = stored.version,
            state = stored.state.as_str(),
            "snapshot written"
        );
        Ok(Some(stored))
    }

    /// Snapshots currently marked `running`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if the cache cannot be read.
    pub async fn list_running(&self) -> Result<Vec<RoomSnapshot>, AdsError> {
        self.cache.list_running().await
    }

    /// Builds a `running` snapshot for a playing reservation.
    #[must_use]
    pub fn running(
        reservation: &Reservation,
        participant_count: u32,
        min_participants: Option<u32>,
        last_event: Option<&str>,
    ) -> RoomSnapshot {
        RoomSnapshot {
            room_id: reservation.room_id,
            version: 0,
            state: SessionState::Running,
            session_id: Some(reservation.session_id),
            current: Some(ReservationSummary::from(reservation)),
            last_event: last_event.map(str::to_string),
            reason: None,
            participant_count,
            min_participants,
            updated_at: Utc::now(),
        }
    }

    /// Builds a `stopped` snapshot carrying the last session and reason.
    #[must_use]
    pub fn stopped(
        room_id: RoomId,
        session_id: Option<SessionId>,
        reason: &str,
        last_event: &str,
        participant_count: u32,
    ) -> RoomSnapshot {
        RoomSnapshot {
            session_id,
            last_event: Some(last_event.to_string()),
            reason: Some(reason.to_string()),
            participant_count,
            ..RoomSnapshot::stopped(room_id)
        }
    }
}
