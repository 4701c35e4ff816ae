//! Persistence layer: durable records behind async ports.
//!
//! Each port is a trait so the engine can run against PostgreSQL in
//! production ([`postgres::PostgresStore`]) and against
//! [`memory::MemoryStore`] in tests and local development. Both
//! implement the same atomic conditional updates: inventory decrements
//! never go below zero, reservation transitions only leave `reserved`, and
//! payout claims are a single read-modify-write.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AdId, AdView, Advertisement, Payout, PayoutClaim, PayoutReceipt, Reservation, ReservationId,
    Room, RoomId, SessionId, UserId,
};
use crate::error::AdsError;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Read access to rooms owned by the room layer.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Looks up a room.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, AdsError>;

    /// Lists rooms that ended at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn list_ended_since(&self, since: DateTime<Utc>) -> Result<Vec<RoomId>, AdsError>;
}

/// Advertisement campaigns.
#[async_trait]
pub trait AdCatalog: Send + Sync {
    /// Returns active campaigns with inventory, oldest first
    /// (`created_at`, then insertion order).
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn list_active(&self) -> Result<Vec<Advertisement>, AdsError>;

    /// Looks up one campaign regardless of status.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn get_ad(&self, ad_id: AdId) -> Result<Option<Advertisement>, AdsError>;

    /// Atomically decrements `rooms_remaining` if it is positive, marking
    /// the campaign `completed` when it reaches zero. Returns the updated
    /// campaign, or `None` when there was nothing left to decrement.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn consume_inventory(&self, ad_id: AdId) -> Result<Option<Advertisement>, AdsError>;
}

/// Ad-slot reservations.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Inserts a `reserved` row.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::Conflict`] if a `reserved` row already exists
    /// for the same (room, ad) or (room, session).
    async fn create(&self, reservation: &Reservation) -> Result<(), AdsError>;

    /// Looks up a reservation by ID.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError>;

    /// Returns the `reserved` row for (room, session), if any.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn find_reserved_for_session(
        &self,
        room_id: RoomId,
        session_id: SessionId,
    ) -> Result<Option<Reservation>, AdsError>;

    /// Returns the most recent `reserved` row in the room, if any.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn find_reserved_for_room(&self, room_id: RoomId)
    -> Result<Option<Reservation>, AdsError>;

    /// Campaigns already used in the room (`reserved` or `completed`).
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn used_ad_ids(&self, room_id: RoomId) -> Result<Vec<AdId>, AdsError>;

    /// `reserved → completed`. Returns the updated row, or `None` if the
    /// reservation was no longer `reserved`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn mark_completed(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError>;

    /// `reserved → canceled` for one reservation. Returns the updated row,
    /// or `None` if it was no longer `reserved`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn cancel(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError>;

    /// `reserved → canceled` for every reserved row in the room. Returns
    /// the canceled rows.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn cancel_reserved_in_room(&self, room_id: RoomId)
    -> Result<Vec<Reservation>, AdsError>;

    /// `reserved` rows whose `expires_at` is before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn list_stale_reserved(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<Reservation>, AdsError>;
}

/// Durable watch records.
#[async_trait]
pub trait AdViewStore: Send + Sync {
    /// Inserts or replaces views keyed by (reservation, user).
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn upsert_views(&self, views: &[AdView]) -> Result<(), AdsError>;

    /// All views recorded in a room.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn list_for_room(&self, room_id: RoomId) -> Result<Vec<AdView>, AdsError>;
}

/// Payout records and the viewers' earnings ledger.
#[async_trait]
pub trait PayoutStore: Send + Sync {
    /// Reads the payout record for a room.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn get_payout(&self, room_id: RoomId) -> Result<Option<Payout>, AdsError>;

    /// Claims a room for distribution in one read-modify-write:
    /// `completed` is returned as-is, `pending` means someone else owns
    /// the run, anything else (absent, `failed`, `skipped`) is reset to
    /// `pending` and handed to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn claim(&self, room_id: RoomId) -> Result<PayoutClaim, AdsError>;

    /// `pending → completed` with the audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn complete(&self, room_id: RoomId, receipt: &PayoutReceipt)
    -> Result<Payout, AdsError>;

    /// `pending → failed` with the error detail.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn fail(&self, room_id: RoomId, error: &str) -> Result<Payout, AdsError>;

    /// `pending → skipped` with the reason.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn skip(&self, room_id: RoomId, reason: &str) -> Result<Payout, AdsError>;

    /// Adds to each viewer's cumulative earnings.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] on store failure.
    async fn credit_earnings(&self, credits: &[(UserId, u128)]) -> Result<(), AdsError>;
}
