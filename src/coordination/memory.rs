//! Process-local coordination backend.
//!
//! Expiry uses [`tokio::time::Instant`], so tests running on a paused
//! clock see locks and snapshots expire when time is advanced.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{LockManager, RetryJob, RetryQueue, SnapshotCache, WatchLedger};
use crate::domain::{ReservationId, RoomId, RoomSnapshot, UserId};
use crate::error::AdsError;

#[derive(Debug, Default)]
struct State {
    locks: HashMap<String, (String, Instant)>,
    snapshots: HashMap<RoomId, (RoomSnapshot, Instant)>,
    versions: HashMap<RoomId, u64>,
    /// Ordered by `(ready_at millis, id)`.
    queue: BTreeMap<(i64, Uuid), RetryJob>,
    presence: HashMap<RoomId, HashSet<UserId>>,
    stamps: HashMap<ReservationId, HashMap<UserId, DateTime<Utc>>>,
    totals: HashMap<ReservationId, HashMap<UserId, u64>>,
    tracked: HashMap<RoomId, HashSet<ReservationId>>,
}

/// In-memory implementation of every coordination port.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    state: Mutex<State>,
}

impl MemoryCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryCoordinator {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AdsError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = state.locks.get(key)
            && *expires > now
        {
            return Ok(false);
        }
        state
            .locks
            .insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, AdsError> {
        let mut state = self.state.lock().await;
        let held = matches!(state.locks.get(key), Some((owner, _)) if owner == token);
        if held {
            state.locks.remove(key);
        }
        Ok(held)
    }
}

#[async_trait]
impl SnapshotCache for MemoryCoordinator {
    async fn get(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, AdsError> {
        let mut state = self.state.lock().await;
        match state.snapshots.get(&room_id) {
            Some((snapshot, expires)) if *expires > Instant::now() => Ok(Some(snapshot.clone())),
            Some(_) => {
                state.snapshots.remove(&room_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        mut snapshot: RoomSnapshot,
        ttl: Duration,
    ) -> Result<RoomSnapshot, AdsError> {
        let mut state = self.state.lock().await;
        let version = state.versions.entry(snapshot.room_id).or_insert(0);
        *version = version.saturating_add(1);
        snapshot.version = *version;
        state
            .snapshots
            .insert(snapshot.room_id, (snapshot.clone(), Instant::now() + ttl));
        Ok(snapshot)
    }

    async fn put_if_version(
        &self,
        mut snapshot: RoomSnapshot,
        expected: u64,
        ttl: Duration,
    ) -> Result<Option<RoomSnapshot>, AdsError> {
        let mut state = self.state.lock().await;
        let version = state.versions.entry(snapshot.room_id).or_insert(0);
        if *version != expected {
            return Ok(None);
        }
        *version = expected.saturating_add(1);
        snapshot.version = *version;
        state
            .snapshots
            .insert(snapshot.room_id, (snapshot.clone(), Instant::now() + ttl));
        Ok(Some(snapshot))
    }

    async fn delete(&self, room_id: RoomId) -> Result<(), AdsError> {
        self.state.lock().await.snapshots.remove(&room_id);
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RoomSnapshot>, AdsError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .snapshots
            .values()
            .filter(|(snapshot, expires)| *expires > now && snapshot.is_running())
            .map(|(snapshot, _)| snapshot.clone())
            .collect())
    }
}

#[async_trait]
impl RetryQueue for MemoryCoordinator {
    async fn enqueue(&self, job: &RetryJob) -> Result<(), AdsError> {
        let mut state = self.state.lock().await;
        state.queue.retain(|(_, id), _| *id != job.id);
        state
            .queue
            .insert((job.ready_at.timestamp_millis(), job.id), job.clone());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryJob>, AdsError> {
        let state = self.state.lock().await;
        let cutoff = now.timestamp_millis();
        Ok(state
            .queue
            .iter()
            .take_while(|((ready, _), _)| *ready <= cutoff)
            .take(limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), AdsError> {
        self.state
            .lock()
            .await
            .queue
            .retain(|(_, id), _| *id != job_id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, AdsError> {
        Ok(self.state.lock().await.queue.len())
    }
}

#[async_trait]
impl WatchLedger for MemoryCoordinator {
    async fn add_presence(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError> {
        self.state
            .lock()
            .await
            .presence
            .entry(room_id)
            .or_default()
            .insert(user_id.clone());
        Ok(())
    }

    async fn remove_presence(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError> {
        let mut state = self.state.lock().await;
        if let Some(users) = state.presence.get_mut(&room_id) {
            users.remove(user_id);
            if users.is_empty() {
                state.presence.remove(&room_id);
            }
        }
        Ok(())
    }

    async fn presence(&self, room_id: RoomId) -> Result<Vec<UserId>, AdsError> {
        let state = self.state.lock().await;
        let mut users: Vec<UserId> = state
            .presence
            .get(&room_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        Ok(users)
    }

    async fn stamp(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, AdsError> {
        let mut state = self.state.lock().await;
        let stamps = state.stamps.entry(reservation_id).or_default();
        if stamps.contains_key(user_id) {
            return Ok(false);
        }
        stamps.insert(user_id.clone(), at);
        Ok(true)
    }

    async fn take_stamp(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
    ) -> Result<Option<DateTime<Utc>>, AdsError> {
        let mut state = self.state.lock().await;
        Ok(state
            .stamps
            .get_mut(&reservation_id)
            .and_then(|stamps| stamps.remove(user_id)))
    }

    async fn open_stamps(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>, AdsError> {
        let state = self.state.lock().await;
        Ok(state
            .stamps
            .get(&reservation_id)
            .map(|stamps| stamps.iter().map(|(u, at)| (u.clone(), *at)).collect())
            .unwrap_or_default())
    }

    async fn add_watched(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        ms: u64,
    ) -> Result<u64, AdsError> {
        let mut state = self.state.lock().await;
        let total = state
            .totals
            .entry(reservation_id)
            .or_default()
            .entry(user_id.clone())
            .or_insert(0);
        *total = total.saturating_add(ms);
        Ok(*total)
    }

    async fn totals(&self, reservation_id: ReservationId) -> Result<Vec<(UserId, u64)>, AdsError> {
        let state = self.state.lock().await;
        Ok(state
            .totals
            .get(&reservation_id)
            .map(|totals| totals.iter().map(|(u, ms)| (u.clone(), *ms)).collect())
            .unwrap_or_default())
    }

    async fn track_reservation(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
    ) -> Result<(), AdsError> {
        self.state
            .lock()
            .await
            .tracked
            .entry(room_id)
            .or_default()
            .insert(reservation_id);
        Ok(())
    }

    async fn tracked_reservations(&self, room_id: RoomId) -> Result<Vec<ReservationId>, AdsError> {
        let state = self.state.lock().await;
        Ok(state
            .tracked
            .get(&room_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn clear_reservation(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
    ) -> Result<(), AdsError> {
        let mut state = self.state.lock().await;
        state.stamps.remove(&reservation_id);
        state.totals.remove(&reservation_id);
        if let Some(ids) = state.tracked.get_mut(&room_id) {
            ids.remove(&reservation_id);
            if ids.is_empty() {
                state.tracked.remove(&room_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::SessionState;

    fn job(ready_at: DateTime<Utc>) -> RetryJob {
        RetryJob {
            id: Uuid::new_v4(),
            url: "http://hooks.test/ads".to_string(),
            event: "ads.session.started".to_string(),
            payload: serde_json::json!({}),
            idempotency_key: "k".to_string(),
            attempt: 2,
            max_attempts: 8,
            ready_at,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_until_ttl() {
        let c = MemoryCoordinator::new();
        let ttl = Duration::from_secs(5);
        assert!(matches!(c.try_acquire("k", "a", ttl).await, Ok(true)));
        assert!(matches!(c.try_acquire("k", "b", ttl).await, Ok(false)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(c.try_acquire("k", "b", ttl).await, Ok(true)));
    }

    #[tokio::test]
    async fn release_requires_owner_token() {
        let c = MemoryCoordinator::new();
        let ttl = Duration::from_secs(5);
        let _ = c.try_acquire("k", "a", ttl).await;
        assert!(matches!(c.release("k", "b").await, Ok(false)));
        assert!(matches!(c.release("k", "a").await, Ok(true)));
        assert!(matches!(c.try_acquire("k", "b", ttl).await, Ok(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_versions_survive_expiry() {
        let c = MemoryCoordinator::new();
        let room = RoomId::new();
        let ttl = Duration::from_secs(60);

        let Ok(first) = c.put(RoomSnapshot::stopped(room), ttl).await else {
            panic!("put should succeed");
        };
        assert_eq!(first.version, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(c.get(room).await, Ok(None)));

        let Ok(second) = c.put(RoomSnapshot::stopped(room), ttl).await else {
            panic!("put should succeed");
        };
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn conditional_put_rejects_stale_versions() {
        let c = MemoryCoordinator::new();
        let room = RoomId::new();
        let ttl = Duration::from_secs(60);
        let Ok(first) = c.put(RoomSnapshot::stopped(room), ttl).await else {
            panic!("put should succeed");
        };

        let Ok(Some(second)) = c
            .put_if_version(RoomSnapshot::stopped(room), first.version, ttl)
            .await
        else {
            panic!("current version should be accepted");
        };
        assert_eq!(second.version, 2);

        let mut running = RoomSnapshot::stopped(room);
        running.state = SessionState::Running;
        assert!(matches!(
            c.put_if_version(running, first.version, ttl).await,
            Ok(None)
        ));
        let Ok(Some(stored)) = c.get(room).await else {
            panic!("snapshot should be stored");
        };
        assert_eq!(stored.version, 2);
        assert!(!stored.is_running());
    }

    #[tokio::test]
    async fn list_running_skips_stopped_rooms() {
        let c = MemoryCoordinator::new();
        let ttl = Duration::from_secs(60);
        let mut running = RoomSnapshot::stopped(RoomId::new());
        running.state = SessionState::Running;
        let _ = c.put(running.clone(), ttl).await;
        let _ = c.put(RoomSnapshot::stopped(RoomId::new()), ttl).await;

        let rooms: Vec<RoomId> = c
            .list_running()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.room_id)
            .collect();
        assert_eq!(rooms, vec![running.room_id]);
    }

    #[tokio::test]
    async fn due_returns_ready_jobs_in_order() {
        let c = MemoryCoordinator::new();
        let now = Utc::now();
        let late = job(now + chrono::Duration::seconds(30));
        let early = job(now - chrono::Duration::seconds(2));
        let earlier = job(now - chrono::Duration::seconds(5));
        for j in [&late, &early, &earlier] {
            let _ = c.enqueue(j).await;
        }

        let ids: Vec<Uuid> = c
            .due(now, 10)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![earlier.id, early.id]);

        // rescheduling keeps a single entry per id
        let mut moved = early.clone();
        moved.ready_at = now + chrono::Duration::seconds(60);
        let _ = c.enqueue(&moved).await;
        assert!(matches!(c.len().await, Ok(3)));
        let _ = c.remove(moved.id).await;
        assert!(matches!(c.len().await, Ok(2)));
    }

    #[tokio::test]
    async fn stamps_are_set_once() {
        let c = MemoryCoordinator::new();
        let r = ReservationId::new();
        let user = UserId::from("ana");
        let t0 = Utc::now();

        assert!(matches!(c.stamp(r, &user, t0).await, Ok(true)));
        let later = t0 + chrono::Duration::seconds(10);
        assert!(matches!(c.stamp(r, &user, later).await, Ok(false)));
        assert!(matches!(c.take_stamp(r, &user).await, Ok(Some(at)) if at == t0));
        assert!(matches!(c.take_stamp(r, &user).await, Ok(None)));
    }

    #[tokio::test]
    async fn clear_reservation_drops_all_watch_state() {
        let c = MemoryCoordinator::new();
        let room = RoomId::new();
        let r = ReservationId::new();
        let user = UserId::from("ana");
        let _ = c.track_reservation(room, r).await;
        let _ = c.stamp(r, &user, Utc::now()).await;
        let _ = c.add_watched(r, &user, 1_500).await;
        assert!(matches!(c.add_watched(r, &user, 500).await, Ok(2_000)));

        let _ = c.clear_reservation(room, r).await;
        assert!(c.totals(r).await.unwrap_or_default().is_empty());
        assert!(c.open_stamps(r).await.unwrap_or_default().is_empty());
        assert!(c.tracked_reservations(room).await.unwrap_or_default().is_empty());
    }
}
