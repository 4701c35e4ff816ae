//! In-memory implementation of every persistence port.
//!
//! One `RwLock` around the whole state makes each port call atomic, which
//! is what the PostgreSQL implementation gets from conditional updates.
//! Used by tests and when `PERSISTENCE_ENABLED=false`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{AdCatalog, AdViewStore, PayoutStore, ReservationStore, RoomDirectory};
use crate::domain::{
    AdId, AdStatus, AdView, Advertisement, Payout, PayoutClaim, PayoutReceipt, PayoutStatus,
    Reservation, ReservationId, ReservationStatus, Room, RoomId, SessionId, UserId,
};
use crate::error::AdsError;

#[derive(Debug, Default)]
struct State {
    rooms: HashMap<RoomId, Room>,
    ads: HashMap<AdId, Advertisement>,
    next_seq: i64,
    reservations: HashMap<ReservationId, Reservation>,
    views: HashMap<(ReservationId, UserId), AdView>,
    payouts: HashMap<RoomId, Payout>,
    earnings: HashMap<UserId, u128>,
}

/// Process-local store implementing all persistence ports.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a room.
    pub async fn upsert_room(&self, room: Room) {
        self.state.write().await.rooms.insert(room.id, room);
    }

    /// Toggles ad serving for a room. Returns `false` if the room is unknown.
    pub async fn set_ads_enabled(&self, room_id: RoomId, enabled: bool) -> bool {
        let mut state = self.state.write().await;
        match state.rooms.get_mut(&room_id) {
            Some(room) => {
                room.ads_enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Marks a room as ended at `at`.
    pub async fn end_room(&self, room_id: RoomId, at: DateTime<Utc>) {
        if let Some(room) = self.state.write().await.rooms.get_mut(&room_id) {
            room.ended_at = Some(at);
        }
    }

    /// Inserts a campaign, assigning the next insertion sequence number.
    pub async fn insert_ad(&self, mut ad: Advertisement) -> AdId {
        let mut state = self.state.write().await;
        state.next_seq = state.next_seq.saturating_add(1);
        ad.seq = state.next_seq;
        let id = ad.id;
        state.ads.insert(id, ad);
        id
    }

    /// All reservations ever made in a room, oldest first.
    pub async fn reservations_in_room(&self, room_id: RoomId) -> Vec<Reservation> {
        let state = self.state.read().await;
        let mut rows: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.room_id == room_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.reserved_at);
        rows
    }

    /// Cumulative earnings of a viewer.
    pub async fn earnings_of(&self, user_id: &UserId) -> u128 {
        self.state
            .read()
            .await
            .earnings
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RoomDirectory for MemoryStore {
    async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, AdsError> {
        Ok(self.state.read().await.rooms.get(&room_id).cloned())
    }

    async fn list_ended_since(&self, since: DateTime<Utc>) -> Result<Vec<RoomId>, AdsError> {
        let state = self.state.read().await;
        Ok(state
            .rooms
            .values()
            .filter(|room| room.ended_at.is_some_and(|ended| ended >= since))
            .map(|room| room.id)
            .collect())
    }
}

#[async_trait]
impl AdCatalog for MemoryStore {
    async fn list_active(&self) -> Result<Vec<Advertisement>, AdsError> {
        let state = self.state.read().await;
        let mut ads: Vec<Advertisement> = state
            .ads
            .values()
            .filter(|ad| ad.has_inventory())
            .cloned()
            .collect();
        ads.sort_by_key(Advertisement::fifo_key);
        Ok(ads)
    }

    async fn get_ad(&self, ad_id: AdId) -> Result<Option<Advertisement>, AdsError> {
        Ok(self.state.read().await.ads.get(&ad_id).cloned())
    }

    async fn consume_inventory(&self, ad_id: AdId) -> Result<Option<Advertisement>, AdsError> {
        let mut state = self.state.write().await;
        let Some(ad) = state.ads.get_mut(&ad_id) else {
            return Ok(None);
        };
        if ad.rooms_remaining == 0 {
            return Ok(None);
        }
        ad.rooms_remaining -= 1;
        if ad.rooms_remaining == 0 {
            ad.status = AdStatus::Completed;
        }
        Ok(Some(ad.clone()))
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn create(&self, reservation: &Reservation) -> Result<(), AdsError> {
        let mut state = self.state.write().await;
        let clash = state.reservations.values().any(|r| {
            r.is_reserved()
                && r.room_id == reservation.room_id
                && (r.ad_id == reservation.ad_id || r.session_id == reservation.session_id)
        });
        if clash {
            return Err(AdsError::Conflict(format!(
                "room {} already has a reserved slot for this ad or session",
                reservation.room_id
            )));
        }
        state
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError> {
        Ok(self.state.read().await.reservations.get(&id).cloned())
    }

    async fn find_reserved_for_session(
        &self,
        room_id: RoomId,
        session_id: SessionId,
    ) -> Result<Option<Reservation>, AdsError> {
        let state = self.state.read().await;
        Ok(state
            .reservations
            .values()
            .find(|r| r.is_reserved() && r.room_id == room_id && r.session_id == session_id)
            .cloned())
    }

    async fn find_reserved_for_room(
        &self,
        room_id: RoomId,
    ) -> Result<Option<Reservation>, AdsError> {
        let state = self.state.read().await;
        Ok(state
            .reservations
            .values()
            .filter(|r| r.is_reserved() && r.room_id == room_id)
            .max_by_key(|r| r.reserved_at)
            .cloned())
    }

    async fn used_ad_ids(&self, room_id: RoomId) -> Result<Vec<AdId>, AdsError> {
        let state = self.state.read().await;
        let mut ids: Vec<AdId> = state
            .reservations
            .values()
            .filter(|r| r.room_id == room_id && r.status != ReservationStatus::Canceled)
            .map(|r| r.ad_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn mark_completed(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError> {
        Ok(transition(
            &mut *self.state.write().await,
            id,
            ReservationStatus::Completed,
        ))
    }

    async fn cancel(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError> {
        Ok(transition(
            &mut *self.state.write().await,
            id,
            ReservationStatus::Canceled,
        ))
    }

    async fn cancel_reserved_in_room(
        &self,
        room_id: RoomId,
    ) -> Result<Vec<Reservation>, AdsError> {
        let mut state = self.state.write().await;
        let mut canceled = Vec::new();
        for r in state.reservations.values_mut() {
            if r.room_id == room_id && r.is_reserved() {
                r.status = ReservationStatus::Canceled;
                canceled.push(r.clone());
            }
        }
        Ok(canceled)
    }

    async fn list_stale_reserved(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, AdsError> {
        let state = self.state.read().await;
        Ok(state
            .reservations
            .values()
            .filter(|r| r.is_reserved() && r.expires_at < cutoff)
            .cloned()
            .collect())
    }
}

/// Moves a reservation out of `reserved`; a no-op for any other state.
fn transition(state: &mut State, id: ReservationId, to: ReservationStatus) -> Option<Reservation> {
    let r = state.reservations.get_mut(&id)?;
    if !r.is_reserved() {
        return None;
    }
    r.status = to;
    Some(r.clone())
}

#[async_trait]
impl AdViewStore for MemoryStore {
    async fn upsert_views(&self, views: &[AdView]) -> Result<(), AdsError> {
        let mut state = self.state.write().await;
        for view in views {
            state
                .views
                .insert((view.reservation_id, view.user_id.clone()), view.clone());
        }
        Ok(())
    }

    async fn list_for_room(&self, room_id: RoomId) -> Result<Vec<AdView>, AdsError> {
        let state = self.state.read().await;
        let mut views: Vec<AdView> = state
            .views
            .values()
            .filter(|v| v.room_id == room_id)
            .cloned()
            .collect();
        views.sort_by(|a, b| {
            (a.started_at, &a.user_id).cmp(&(b.started_at, &b.user_id))
        });
        Ok(views)
    }
}

#[async_trait]
impl PayoutStore for MemoryStore {
    async fn get_payout(&self, room_id: RoomId) -> Result<Option<Payout>, AdsError> {
        Ok(self.state.read().await.payouts.get(&room_id).cloned())
    }

    async fn claim(&self, room_id: RoomId) -> Result<PayoutClaim, AdsError> {
        let mut state = self.state.write().await;
        match state.payouts.get_mut(&room_id) {
            Some(p) if p.status == PayoutStatus::Completed => {
                Ok(PayoutClaim::AlreadyCompleted(p.clone()))
            }
            Some(p) if p.status == PayoutStatus::Pending => Ok(PayoutClaim::InProgress(p.clone())),
            Some(p) => {
                p.status = PayoutStatus::Pending;
                p.error = None;
                p.skip_reason = None;
                p.attempts = p.attempts.saturating_add(1);
                p.updated_at = Utc::now();
                Ok(PayoutClaim::Claimed(p.clone()))
            }
            None => {
                let p = Payout::pending(room_id);
                state.payouts.insert(room_id, p.clone());
                Ok(PayoutClaim::Claimed(p))
            }
        }
    }

    async fn complete(
        &self,
        room_id: RoomId,
        receipt: &PayoutReceipt,
    ) -> Result<Payout, AdsError> {
        finish(
            &mut *self.state.write().await,
            room_id,
            PayoutStatus::Completed,
            |p| p.receipt = Some(receipt.clone()),
        )
    }

    async fn fail(&self, room_id: RoomId, error: &str) -> Result<Payout, AdsError> {
        finish(
            &mut *self.state.write().await,
            room_id,
            PayoutStatus::Failed,
            |p| p.error = Some(error.to_string()),
        )
    }

    async fn skip(&self, room_id: RoomId, reason: &str) -> Result<Payout, AdsError> {
        finish(
            &mut *self.state.write().await,
            room_id,
            PayoutStatus::Skipped,
            |p| p.skip_reason = Some(reason.to_string()),
        )
    }

    async fn credit_earnings(&self, credits: &[(UserId, u128)]) -> Result<(), AdsError> {
        let mut state = self.state.write().await;
        for (user, amount) in credits {
            let total = state.earnings.entry(user.clone()).or_insert(0);
            *total = total.saturating_add(*amount);
        }
        Ok(())
    }
}

/// Finalizes a `pending` payout. A `completed` record is never touched.
fn finish(
    state: &mut State,
    room_id: RoomId,
    to: PayoutStatus,
    apply: impl FnOnce(&mut Payout),
) -> Result<Payout, AdsError> {
    let p = state
        .payouts
        .get_mut(&room_id)
        .ok_or(AdsError::PayoutNotFound(room_id))?;
    if p.status != PayoutStatus::Pending {
        return Err(AdsError::Conflict(format!(
            "payout for room {room_id} is {} and cannot become {}",
            p.status.as_str(),
            to.as_str()
        )));
    }
    p.status = to;
    p.updated_at = Utc::now();
    apply(p);
    Ok(p.clone())
}
