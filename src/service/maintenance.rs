//! Periodic maintenance: stale reservation reaping and the distribution
//! sweep for ended rooms that never got a successful payout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::{DistributionEngine, SessionManager};
use crate::coordination::{DISTRIBUTION_SWEEP_LOCK, LockManager};
use crate::domain::{PayoutStatus, RoomId};
use crate::error::AdsError;
use crate::persistence::{PayoutStore, RoomDirectory};

/// Stops sessions whose reservation outlived its expiry.
///
/// Covers rooms whose timer died with its process and was never picked
/// up by recovery.
#[derive(Debug, Clone)]
pub struct ReservationReaper {
    manager: SessionManager,
    interval: Duration,
    grace: chrono::Duration,
}

impl ReservationReaper {
    /// Creates a reaper running every minute with a five minute grace.
    #[must_use]
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            interval: Duration::from_secs(60),
            grace: chrono::Duration::minutes(5),
        }
    }

    /// Overrides the schedule.
    #[must_use]
    pub fn with_schedule(mut self, interval: Duration, grace: chrono::Duration) -> Self {
        self.interval = interval;
        self.grace = grace;
        self
    }

    /// Reaps reservations that expired more than the grace before `now`.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or the snapshot cache fails.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, AdsError> {
        let reaped = self.manager.reap_stale(now - self.grace).await?;
        if reaped > 0 {
            tracing::info!(reaped, "stale reservations reaped");
        }
        Ok(reaped)
    }

    /// Spawns the reaping loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick_at(Utc::now()).await {
                    tracing::error!(error = %e, "reaper tick failed");
                }
            }
        })
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another instance held the sweep lock.
    pub locked_out: bool,
    /// Rooms the engine ran for.
    pub triggered: usize,
    /// Runs that completed.
    pub completed: usize,
    /// Runs that were skipped.
    pub skipped: usize,
    /// Runs that failed.
    pub failed: usize,
}

/// Retries distribution for recently ended rooms with no payout or a
/// failed one.
pub struct DistributionSweep {
    engine: DistributionEngine,
    rooms: Arc<dyn RoomDirectory>,
    payouts: Arc<dyn PayoutStore>,
    locks: Arc<dyn LockManager>,
    owner: String,
    interval: Duration,
    lookback: chrono::Duration,
    lock_ttl: Duration,
}

impl fmt::Debug for DistributionSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionSweep")
            .field("owner", &self.owner)
            .field("interval", &self.interval)
            .field("lookback", &self.lookback)
            .finish_non_exhaustive()
    }
}

impl DistributionSweep {
    /// Creates a daily sweep over rooms ended in the last seven days.
    #[must_use]
    pub fn new(
        engine: DistributionEngine,
        rooms: Arc<dyn RoomDirectory>,
        payouts: Arc<dyn PayoutStore>,
        locks: Arc<dyn LockManager>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            rooms,
            payouts,
            locks,
            owner: owner.into(),
            interval: Duration::from_secs(24 * 60 * 60),
            lookback: chrono::Duration::days(7),
            lock_ttl: Duration::from_secs(60 * 60),
        }
    }

    /// Overrides the schedule.
    #[must_use]
    pub fn with_schedule(mut self, interval: Duration, lookback: chrono::Duration) -> Self {
        self.interval = interval;
        self.lookback = lookback;
        self
    }

    /// Runs one sweep as if the time were `now`.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if the lock or the room directory fails.
    /// Per-room failures are logged and counted.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<SweepReport, AdsError> {
        if !self
            .locks
            .try_acquire(DISTRIBUTION_SWEEP_LOCK, &self.owner, self.lock_ttl)
            .await?
        {
            return Ok(SweepReport {
                locked_out: true,
                ..SweepReport::default()
            });
        }

        let result = self.sweep(now).await;

        if let Err(e) = self.locks.release(DISTRIBUTION_SWEEP_LOCK, &self.owner).await {
            tracing::warn!(error = %e, "failed to release distribution sweep lock");
        }
        result
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AdsError> {
        let mut report = SweepReport::default();
        for room_id in self.rooms.list_ended_since(now - self.lookback).await? {
            match self.needs_payout(room_id).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(%room_id, error = %e, "payout lookup failed");
                    continue;
                }
            }

            report.triggered += 1;
            match self.engine.trigger(room_id).await {
                Ok(outcome) => match outcome.payout().status {
                    PayoutStatus::Completed => report.completed += 1,
                    PayoutStatus::Skipped => report.skipped += 1,
                    PayoutStatus::Failed => report.failed += 1,
                    PayoutStatus::Pending => {}
                },
                Err(e) => {
                    tracing::error!(%room_id, error = %e, "sweep distribution errored");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(
            triggered = report.triggered,
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            "distribution sweep finished"
        );
        Ok(report)
    }

    async fn needs_payout(&self, room_id: RoomId) -> Result<bool, AdsError> {
        Ok(match self.payouts.get_payout(room_id).await? {
            None => true,
            Some(payout) => payout.status == PayoutStatus::Failed,
        })
    }

    /// Spawns the sweep loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick_at(Utc::now()).await {
                    tracing::error!(error = %e, "distribution sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::domain::{Reservation, ReservationStatus, Room, SessionId, StopReason};
    use crate::persistence::ReservationStore;
    use crate::service::SnapshotService;
    use crate::service::distribution::tests::{Fixture, fixture};
    use crate::service::session_manager::tests::harness;

    #[tokio::test]
    async fn reaper_stops_orphaned_sessions() {
        let h = harness().await;
        let reserved_at = Utc::now() - chrono::Duration::hours(1);
        let reservation = Reservation::new(h.ad, h.room, SessionId::new(), 300, reserved_at, None);
        let Ok(()) = h.store.create(&reservation).await else {
            panic!("create should succeed");
        };
        let Ok(_) = h
            .manager
            .snapshots()
            .write(SnapshotService::running(&reservation, 2, Some(1), Some("ads.ad.started")))
            .await
        else {
            panic!("snapshot write should succeed");
        };

        let reaper = ReservationReaper::new(h.manager.clone());
        assert!(matches!(reaper.tick_at(Utc::now()).await, Ok(1)));

        let Ok(Some(stored)) = h.store.get(reservation.id).await else {
            panic!("reservation should exist");
        };
        assert_eq!(stored.status, ReservationStatus::Canceled);
        let Ok(snapshot) = h.manager.snapshots().get(h.room).await else {
            panic!("snapshot should exist");
        };
        assert!(!snapshot.is_running());
        assert_eq!(
            snapshot.reason.as_deref(),
            Some(StopReason::StaleReservation.as_str())
        );

        assert!(matches!(reaper.tick_at(Utc::now()).await, Ok(0)));
    }

    #[tokio::test]
    async fn reaper_leaves_rooms_with_live_timers() {
        let h = harness().await;
        let Ok(_) = h.manager.start(h.room, Some(2)).await else {
            panic!("start should succeed");
        };
        assert!(h.manager.has_local_timer(h.room));

        let reaper = ReservationReaper::new(h.manager.clone());
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(matches!(reaper.tick_at(later).await, Ok(0)));

        let Ok(snapshot) = h.manager.snapshots().get(h.room).await else {
            panic!("snapshot should exist");
        };
        assert!(snapshot.is_running());
    }

    async fn ended(f: &Fixture, room: RoomId, days_ago: i64) {
        f.store
            .upsert_room(Room {
                id: room,
                ads_enabled: true,
                ended_at: Some(Utc::now() - chrono::Duration::days(days_ago)),
            })
            .await;
    }

    fn sweep_for(f: &Fixture, locks: &Arc<MemoryCoordinator>) -> DistributionSweep {
        DistributionSweep::new(
            f.engine.clone(),
            Arc::clone(&f.store) as Arc<dyn RoomDirectory>,
            Arc::clone(&f.store) as Arc<dyn PayoutStore>,
            Arc::clone(locks) as Arc<dyn LockManager>,
            "node-a",
        )
    }

    #[tokio::test]
    async fn sweep_pays_recent_rooms_once() {
        let f = fixture(200).await;
        f.identity.insert("alice", "0xalice");
        f.watched(&["alice"]).await;
        ended(&f, f.room, 1).await;

        let old_room = RoomId::new();
        f.watched_in(old_room, &["alice"]).await;
        ended(&f, old_room, 10).await;

        let locks = Arc::new(MemoryCoordinator::new());
        let sweep = sweep_for(&f, &locks);

        let Ok(report) = sweep.tick_at(Utc::now()).await else {
            panic!("sweep should run");
        };
        assert_eq!(report.triggered, 1);
        assert_eq!(report.completed, 1);
        assert!(matches!(f.store.get_payout(old_room).await, Ok(None)));

        let Ok(again) = sweep.tick_at(Utc::now()).await else {
            panic!("sweep should run");
        };
        assert_eq!(again.triggered, 0);
    }

    #[tokio::test]
    async fn sweep_retries_failed_payouts() {
        let f = fixture(200).await;
        f.identity.insert("alice", "0xalice");
        f.watched(&["alice"]).await;
        ended(&f, f.room, 1).await;
        f.chain.set_fail_transfers(true);

        let locks = Arc::new(MemoryCoordinator::new());
        let sweep = sweep_for(&f, &locks);
        let Ok(first) = sweep.tick_at(Utc::now()).await else {
            panic!("sweep should run");
        };
        assert_eq!(first.failed, 1);

        f.chain.set_fail_transfers(false);
        let Ok(second) = sweep.tick_at(Utc::now()).await else {
            panic!("sweep should run");
        };
        assert_eq!(second.triggered, 1);
        assert_eq!(second.completed, 1);
    }

    #[tokio::test]
    async fn sweep_is_skipped_while_locked_elsewhere() {
        let f = fixture(200).await;
        let locks = Arc::new(MemoryCoordinator::new());
        assert!(matches!(
            locks
                .try_acquire(DISTRIBUTION_SWEEP_LOCK, "node-b", Duration::from_secs(60))
                .await,
            Ok(true)
        ));

        let sweep = sweep_for(&f, &locks);
        let Ok(report) = sweep.tick_at(Utc::now()).await else {
            panic!("sweep should run");
        };
        assert!(report.locked_out);
    }
}
