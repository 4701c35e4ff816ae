//! Cross-instance coordination: locks, the snapshot cache, the webhook
//! retry queue and the watch ledger.
//!
//! Everything here is shared between engine instances in production
//! ([`redis_backend::RedisCoordinator`]) and process-local in tests and single-node
//! development ([`memory::MemoryCoordinator`]). In-process mutexes never
//! stand in for these: timers and workers may run on any instance.

pub mod memory;
pub mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ReservationId, RoomId, RoomSnapshot, UserId};
use crate::error::AdsError;

pub use memory::MemoryCoordinator;
pub use redis_backend::RedisCoordinator;

/// Lock key guarding session start in a room.
#[must_use]
pub fn start_lock_key(room_id: RoomId) -> String {
    format!("ads:lock:start:{room_id}")
}

/// Lock key guarding rotation scheduling in a room.
#[must_use]
pub fn rotation_lock_key(room_id: RoomId) -> String {
    format!("ads:lock:rotation:{room_id}")
}

/// Global lock held by the webhook retry worker for one tick.
pub const WEBHOOK_RETRY_LOCK: &str = "ads:lock:webhook-retry";

/// Global lock held by the daily distribution sweep.
pub const DISTRIBUTION_SWEEP_LOCK: &str = "ads:lock:distribution-sweep";

/// TTL'd mutual exclusion with owner tokens.
///
/// A lock is released only by the holder of the token it was acquired
/// with; an expired lock can be taken by anyone.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Takes `key` for `ttl` if it is free. Returns `false` when held.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AdsError>;

    /// Releases `key` if it is still held with `token`. Returns whether a
    /// lock was released.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn release(&self, key: &str, token: &str) -> Result<bool, AdsError>;
}

/// TTL'd store of per-room snapshots.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Reads the cached snapshot, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn get(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, AdsError>;

    /// Stores `snapshot` with the next version number for the room and
    /// returns what was stored. Versions keep increasing across expiry.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn put(&self, snapshot: RoomSnapshot, ttl: Duration) -> Result<RoomSnapshot, AdsError>;

    /// Like [`SnapshotCache::put`], but only if the room's current version
    /// is still `expected`. Returns `None` when another write got there
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn put_if_version(
        &self,
        snapshot: RoomSnapshot,
        expected: u64,
        ttl: Duration,
    ) -> Result<Option<RoomSnapshot>, AdsError>;

    /// Drops the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn delete(&self, room_id: RoomId) -> Result<(), AdsError>;

    /// All cached snapshots currently in the `running` state.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn list_running(&self) -> Result<Vec<RoomSnapshot>, AdsError>;
}

/// A pending webhook redelivery.
///
/// `attempt` is the number of the delivery this job will make; the id
/// stays the same across reschedules so the queue holds one entry per
/// logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    /// Queue entry identifier.
    pub id: Uuid,
    /// Delivery target.
    pub url: String,
    /// Event name for `X-Ads-Event`.
    pub event: String,
    /// Event body, re-signed on every attempt.
    pub payload: serde_json::Value,
    /// Stable per logical event.
    pub idempotency_key: String,
    /// Attempt number this job will make (2 for the first retry).
    pub attempt: u32,
    /// Attempts allowed in total, including the first delivery.
    pub max_attempts: u32,
    /// Not to be delivered before this instant.
    pub ready_at: DateTime<Utc>,
}

/// Time-ordered queue of webhook redeliveries.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Inserts a job, replacing any entry with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn enqueue(&self, job: &RetryJob) -> Result<(), AdsError>;

    /// Up to `limit` jobs whose `ready_at` is not after `now`, earliest
    /// first. Jobs stay queued until removed or replaced.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryJob>, AdsError>;

    /// Deletes a job.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn remove(&self, job_id: Uuid) -> Result<(), AdsError>;

    /// Number of queued jobs.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn len(&self) -> Result<usize, AdsError>;
}

/// Shared watch-time state: who is in a room, open join stamps per
/// reservation, and accumulated totals not yet flushed to `AdView` rows.
#[async_trait]
pub trait WatchLedger: Send + Sync {
    /// Marks a viewer present in a room.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn add_presence(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError>;

    /// Marks a viewer absent.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn remove_presence(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError>;

    /// Viewers currently present.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn presence(&self, room_id: RoomId) -> Result<Vec<UserId>, AdsError>;

    /// Records a join stamp unless one is already open. Returns `true` if
    /// this call set it.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn stamp(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, AdsError>;

    /// Removes and returns an open join stamp.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn take_stamp(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
    ) -> Result<Option<DateTime<Utc>>, AdsError>;

    /// Viewers with an open stamp on a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn open_stamps(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>, AdsError>;

    /// Adds to a viewer's running total and returns the new total.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn add_watched(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        ms: u64,
    ) -> Result<u64, AdsError>;

    /// Running totals for a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn totals(&self, reservation_id: ReservationId) -> Result<Vec<(UserId, u64)>, AdsError>;

    /// Remembers that a room has watch data for a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn track_reservation(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
    ) -> Result<(), AdsError>;

    /// Reservations with watch data in a room.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn tracked_reservations(&self, room_id: RoomId) -> Result<Vec<ReservationId>, AdsError>;

    /// Drops stamps and totals for a reservation and untracks it.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] on backend failure.
    async fn clear_reservation(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
    ) -> Result<(), AdsError>;
}
