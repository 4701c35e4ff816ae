//! Watch-time tracker: per-viewer exposure for the playing reservation.
//!
//! Presence and open join stamps live in the shared [`WatchLedger`] so any
//! instance can close them. A stamp is set once per viewer and
//! reservation; closing it adds `clamp(now) - join` to the viewer's
//! running total. Totals become [`AdView`] rows on flush.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::coordination::WatchLedger;
use crate::domain::{AdView, Reservation, RoomId, UserId};
use crate::error::AdsError;
use crate::persistence::{AdViewStore, ReservationStore};

/// Accumulates watch time and persists it as [`AdView`] records.
#[derive(Clone)]
pub struct WatchTracker {
    ledger: Arc<dyn WatchLedger>,
    reservations: Arc<dyn ReservationStore>,
    views: Arc<dyn AdViewStore>,
}

impl fmt::Debug for WatchTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchTracker").finish_non_exhaustive()
    }
}

impl WatchTracker {
    /// Creates a new `WatchTracker`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn WatchLedger>,
        reservations: Arc<dyn ReservationStore>,
        views: Arc<dyn AdViewStore>,
    ) -> Self {
        Self {
            ledger,
            reservations,
            views,
        }
    }

    /// Records a viewer joining the room now.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger or store fails.
    pub async fn join(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError> {
        self.join_at(room_id, user_id, Utc::now()).await
    }

    /// Records a viewer joining at `now`. If a reservation is playing the
    /// viewer is stamped for it; a repeated join keeps the first stamp.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger or store fails.
    pub async fn join_at(
        &self,
        room_id: RoomId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), AdsError> {
        self.ledger.add_presence(room_id, user_id).await?;
        if let Some(reservation) = self.reservations.find_reserved_for_room(room_id).await?
            && !reservation.is_expired_at(now)
        {
            let stamped = self
                .ledger
                .stamp(reservation.id, user_id, reservation.clamp(now))
                .await?;
            tracing::debug!(%room_id, %user_id, reservation_id = %reservation.id, stamped, "viewer joined");
        }
        Ok(())
    }

    /// Records a viewer leaving the room now.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger or store fails.
    pub async fn leave(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError> {
        self.leave_at(room_id, user_id, Utc::now()).await
    }

    /// Records a viewer leaving at `now`, closing their stamp on the
    /// playing reservation.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger or store fails.
    pub async fn leave_at(
        &self,
        room_id: RoomId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), AdsError> {
        self.ledger.remove_presence(room_id, user_id).await?;
        if let Some(reservation) = self.reservations.find_reserved_for_room(room_id).await? {
            self.close_stamp(&reservation, user_id, now).await?;
        }
        Ok(())
    }

    /// Starts tracking a reservation: every viewer present in the room is
    /// stamped at the reservation start.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger fails.
    pub async fn start_reservation(&self, reservation: &Reservation) -> Result<usize, AdsError> {
        self.ledger
            .track_reservation(reservation.room_id, reservation.id)
            .await?;
        let mut stamped = 0;
        for user_id in self.ledger.presence(reservation.room_id).await? {
            if self
                .ledger
                .stamp(reservation.id, &user_id, reservation.reserved_at)
                .await?
            {
                stamped += 1;
            }
        }
        tracing::debug!(
            room_id = %reservation.room_id,
            reservation_id = %reservation.id,
            viewers = stamped,
            "watch tracking started"
        );
        Ok(stamped)
    }

    /// Closes every open stamp on `reservation` as of `now`.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger fails.
    pub async fn close_stamps_at(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<usize, AdsError> {
        let open = self.ledger.open_stamps(reservation.id).await?;
        let mut closed = 0;
        for (user_id, _) in open {
            if self.close_stamp(reservation, &user_id, now).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Ends tracking for a completed reservation: closes open stamps and
    /// writes its totals as [`AdView`] rows.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the ledger or store fails. Totals are
    /// kept in the ledger until the write succeeds.
    pub async fn finalize_reservation(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<usize, AdsError> {
        self.close_stamps_at(reservation, now).await?;
        self.persist(reservation).await
    }

    /// Flushes every reservation tracked for the room into [`AdView`] rows
    /// and discards the accumulators.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] on the first ledger or store failure.
    /// Reservations flushed before the failure stay flushed; the rest are
    /// retried on the next flush.
    pub async fn flush_room(&self, room_id: RoomId) -> Result<usize, AdsError> {
        self.flush_room_at(room_id, Utc::now()).await
    }

    /// [`WatchTracker::flush_room`] as of `now`.
    ///
    /// # Errors
    ///
    /// See [`WatchTracker::flush_room`].
    pub async fn flush_room_at(
        &self,
        room_id: RoomId,
        now: DateTime<Utc>,
    ) -> Result<usize, AdsError> {
        let mut written = 0;
        for reservation_id in self.ledger.tracked_reservations(room_id).await? {
            let Some(reservation) = self.reservations.get(reservation_id).await? else {
                tracing::warn!(%room_id, %reservation_id, "tracked reservation missing, discarding totals");
                self.ledger.clear_reservation(room_id, reservation_id).await?;
                continue;
            };
            self.close_stamps_at(&reservation, now).await?;
            written += self.persist(&reservation).await?;
        }
        tracing::info!(%room_id, views = written, "watch time flushed");
        Ok(written)
    }

    async fn close_stamp(
        &self,
        reservation: &Reservation,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, AdsError> {
        let Some(joined_at) = self.ledger.take_stamp(reservation.id, user_id).await? else {
            return Ok(false);
        };
        let elapsed = (reservation.clamp(now) - joined_at).num_milliseconds().max(0);
        let ms = u64::try_from(elapsed).unwrap_or(0);
        let total = self.ledger.add_watched(reservation.id, user_id, ms).await?;
        tracing::debug!(
            reservation_id = %reservation.id,
            %user_id,
            watched_ms = ms,
            total_ms = total,
            "watch stamp closed"
        );
        Ok(true)
    }

    async fn persist(&self, reservation: &Reservation) -> Result<usize, AdsError> {
        let views: Vec<AdView> = self
            .ledger
            .totals(reservation.id)
            .await?
            .into_iter()
            .filter(|(_, ms)| *ms > 0)
            .map(|(user_id, ms)| AdView::for_reservation(reservation, user_id, ms))
            .collect();

        if !views.is_empty() {
            self.views.upsert_views(&views).await?;
        }
        self.ledger
            .clear_reservation(reservation.room_id, reservation.id)
            .await?;
        Ok(views.len())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::domain::{AdId, SessionId};
    use crate::persistence::MemoryStore;

    struct Fixture {
        tracker: WatchTracker,
        store: Arc<MemoryStore>,
        room: RoomId,
        reservation: Reservation,
        start: DateTime<Utc>,
    }

    async fn fixture(duration_sec: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryCoordinator::new());
        let tracker = WatchTracker::new(
            ledger,
            Arc::clone(&store) as Arc<dyn ReservationStore>,
            Arc::clone(&store) as Arc<dyn AdViewStore>,
        );
        let room = RoomId::new();
        let start = Utc::now();
        let reservation = Reservation::new(
            AdId::new(),
            room,
            SessionId::new(),
            duration_sec,
            start,
            None,
        );
        Fixture {
            tracker,
            store,
            room,
            reservation,
            start,
        }
    }

    impl Fixture {
        async fn store_reservation(&self) {
            let Ok(()) = self.store.create(&self.reservation).await else {
                panic!("create should succeed");
            };
        }
    }

    async fn watched(store: &MemoryStore, room: RoomId, user: &str) -> Option<u64> {
        store
            .list_for_room(room)
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|v| v.user_id.as_str() == user)
            .map(|v| v.watched_ms)
    }

    #[tokio::test]
    async fn viewer_present_for_whole_slot_gets_full_duration() {
        let f = fixture(300).await;
        let alice = UserId::from("alice");
        // present before the slot exists: presence only
        let _ = f.tracker.join_at(f.room, &alice, f.start - Duration::seconds(30)).await;
        f.store_reservation().await;
        let Ok(stamped) = f.tracker.start_reservation(&f.reservation).await else {
            panic!("start should succeed");
        };
        assert_eq!(stamped, 1);

        let end = f.start + Duration::seconds(300);
        let Ok(rows) = f.tracker.finalize_reservation(&f.reservation, end).await else {
            panic!("finalize should succeed");
        };
        assert_eq!(rows, 1);
        assert_eq!(watched(&f.store, f.room, "alice").await, Some(300_000));
    }

    #[tokio::test]
    async fn churn_never_exceeds_duration() {
        let f = fixture(60).await;
        let bob = UserId::from("bob");
        f.store_reservation().await;
        let _ = f.tracker.start_reservation(&f.reservation).await;

        // joins twice, leaves, rejoins, then stays far past the slot end
        let _ = f.tracker.join_at(f.room, &bob, f.start + Duration::seconds(10)).await;
        let _ = f.tracker.join_at(f.room, &bob, f.start + Duration::seconds(20)).await;
        let _ = f.tracker.leave_at(f.room, &bob, f.start + Duration::seconds(40)).await;
        let _ = f.tracker.leave_at(f.room, &bob, f.start + Duration::seconds(45)).await;
        let _ = f.tracker.join_at(f.room, &bob, f.start + Duration::seconds(50)).await;

        let _ = f
            .tracker
            .finalize_reservation(&f.reservation, f.start + Duration::seconds(600))
            .await;
        // 30 s from the first stamp, 10 s after rejoining, capped at the end
        assert_eq!(watched(&f.store, f.room, "bob").await, Some(40_000));
    }

    #[tokio::test]
    async fn close_before_stamp_is_floored_at_zero() {
        let f = fixture(60).await;
        let carol = UserId::from("carol");
        f.store_reservation().await;
        let _ = f.tracker.join_at(f.room, &carol, f.start + Duration::seconds(30)).await;
        let Ok(closed) = f
            .tracker
            .close_stamps_at(&f.reservation, f.start + Duration::seconds(5))
            .await
        else {
            panic!("close should succeed");
        };
        assert_eq!(closed, 1);
        let _ = f.tracker.flush_room_at(f.room, f.start).await;
        assert_eq!(watched(&f.store, f.room, "carol").await, None);
    }

    #[tokio::test]
    async fn repeated_flush_is_idempotent() {
        let f = fixture(120).await;
        let dave = UserId::from("dave");
        f.store_reservation().await;
        let _ = f.tracker.join_at(f.room, &dave, f.start).await;
        let _ = f.tracker.start_reservation(&f.reservation).await;
        let _ = f
            .tracker
            .leave_at(f.room, &dave, f.start + Duration::seconds(90))
            .await;

        let Ok(first) = f.tracker.flush_room_at(f.room, f.start + Duration::seconds(100)).await else {
            panic!("flush should succeed");
        };
        let Ok(second) = f.tracker.flush_room_at(f.room, f.start + Duration::seconds(200)).await else {
            panic!("flush should succeed");
        };
        assert_eq!((first, second), (1, 0));
        assert_eq!(watched(&f.store, f.room, "dave").await, Some(90_000));
        assert_eq!(f.store.list_for_room(f.room).await.unwrap_or_default().len(), 1);
    }
}
