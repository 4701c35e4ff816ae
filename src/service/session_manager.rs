//! Ad session manager: the per-room state machine.
//!
//! `Stopped → start → Running → (expiry | stop) → Stopped`. A running
//! session always has exactly one `reserved` reservation; its rotation
//! timer fires at `expires_at`, completes it and allocates the next ad.
//!
//! Timers are local tasks tracked in a per-process map. The map is never
//! authoritative: cross-instance exclusion goes through the
//! [`LockManager`], and [`SessionManager::recover`] rebuilds timers from
//! the snapshot cache and reservation store after a restart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{SnapshotService, WatchTracker};
use crate::coordination::{LockManager, rotation_lock_key, start_lock_key};
use crate::domain::{
    AdId, AdsEvent, Advertisement, IdleReason, Reservation, ReservationId, RoomId, RoomSnapshot,
    SessionId, StartRejection, StopReason,
};
use crate::error::AdsError;
use crate::external::ConferencingProvider;
use crate::persistence::{AdCatalog, ReservationStore, RoomDirectory};
use crate::webhook::WebhookDispatcher;

/// Timing knobs for locks and rotation scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// TTL of the per-room start lock.
    pub start_lock_ttl: Duration,
    /// Added to the remaining slot time to form the rotation lock TTL.
    pub rotation_buffer: Duration,
    /// First backoff delay when the rotation lock is busy.
    pub backoff_base: Duration,
    /// Largest backoff delay.
    pub backoff_cap: Duration,
    /// Lock attempts before giving the room up to another instance.
    pub backoff_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            start_lock_ttl: Duration::from_secs(5),
            rotation_buffer: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            backoff_attempts: 6,
        }
    }
}

/// Storage, coordination and conferencing ports used by the manager.
#[derive(Clone)]
pub struct SessionPorts {
    /// Room settings.
    pub rooms: Arc<dyn RoomDirectory>,
    /// Advertisement catalog.
    pub catalog: Arc<dyn AdCatalog>,
    /// Reservation store.
    pub reservations: Arc<dyn ReservationStore>,
    /// Distributed locks.
    pub locks: Arc<dyn LockManager>,
    /// Live participant counts.
    pub conferencing: Arc<dyn ConferencingProvider>,
}

impl fmt::Debug for SessionPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPorts").finish_non_exhaustive()
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session opened and its first ad is playing.
    Started {
        /// New session.
        session_id: SessionId,
        /// First reservation.
        reservation: Reservation,
    },
    /// A session was already running; nothing changed.
    AlreadyRunning {
        /// The running session.
        session_id: SessionId,
    },
    /// Another caller holds the start lock and has not finished yet.
    Busy,
    /// The session could not start.
    Rejected {
        /// Why.
        reason: StartRejection,
    },
}

/// Result of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// This reservation is playing.
    Reserved(Reservation),
    /// Nothing could be allocated; the session went idle.
    Idle(IdleReason),
}

/// What an automatic evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// A session was started.
    Started(SessionId),
    /// The running session was stopped.
    Stopped(StopReason),
    /// Nothing to do.
    Unchanged,
}

/// Counts from a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running rooms whose timer was rescheduled.
    pub rescheduled: usize,
    /// Running snapshots found stale and stopped.
    pub discarded: usize,
}

enum Selection {
    Ad(Advertisement),
    Idle(IdleReason),
}

#[derive(Debug)]
struct RoomTimer {
    reservation_id: ReservationId,
    handle: JoinHandle<()>,
}

/// Allocates and rotates ads and owns the session lifecycle.
///
/// Cheap to clone; clones share the timer map.
#[derive(Clone)]
pub struct SessionManager {
    ports: SessionPorts,
    snapshots: SnapshotService,
    watch: WatchTracker,
    webhooks: Arc<WebhookDispatcher>,
    instance_id: Arc<str>,
    settings: SessionSettings,
    timers: Arc<Mutex<HashMap<RoomId, RoomTimer>>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("instance_id", &self.instance_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager for one engine instance.
    #[must_use]
    pub fn new(
        ports: SessionPorts,
        snapshots: SnapshotService,
        watch: WatchTracker,
        webhooks: Arc<WebhookDispatcher>,
        instance_id: impl Into<String>,
    ) -> Self {
        let instance_id: String = instance_id.into();
        Self {
            ports,
            snapshots,
            watch,
            webhooks,
            instance_id: Arc::from(instance_id),
            settings: SessionSettings::default(),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Overrides lock and backoff timings.
    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the snapshot service.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    /// Returns the watch tracker.
    #[must_use]
    pub fn watch(&self) -> &WatchTracker {
        &self.watch
    }

    /// Identifier used in lock tokens.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Opens a session in a room and allocates its first ad.
    ///
    /// `participant_count` overrides the conferencing provider's count.
    /// Concurrent starts collapse on a short per-room lock; a running
    /// session is returned as [`StartOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or coordination fails.
    pub async fn start(
        &self,
        room_id: RoomId,
        participant_count: Option<u32>,
    ) -> Result<StartOutcome, AdsError> {
        if let Some(reason) = self.check_room(room_id).await? {
            return Ok(StartOutcome::Rejected { reason });
        }
        if let Some(session_id) = running_session(&self.snapshots.get(room_id).await?) {
            return Ok(StartOutcome::AlreadyRunning { session_id });
        }

        let key = start_lock_key(room_id);
        let token = format!("{}:{}", self.instance_id, Uuid::new_v4());
        if !self
            .ports
            .locks
            .try_acquire(&key, &token, self.settings.start_lock_ttl)
            .await?
        {
            tracing::debug!(%room_id, "start lock held elsewhere");
            let current = self.snapshots.get(room_id).await?;
            return Ok(running_session(&current)
                .map_or(StartOutcome::Busy, |session_id| {
                    StartOutcome::AlreadyRunning { session_id }
                }));
        }

        let outcome = self.start_locked(room_id, participant_count).await;
        if let Err(e) = self.ports.locks.release(&key, &token).await {
            tracing::warn!(%room_id, error = %e, "failed to release start lock");
        }
        outcome
    }

    async fn start_locked(
        &self,
        room_id: RoomId,
        participant_count: Option<u32>,
    ) -> Result<StartOutcome, AdsError> {
        let snapshot = self.snapshots.get(room_id).await?;
        if let Some(session_id) = running_session(&snapshot) {
            return Ok(StartOutcome::AlreadyRunning { session_id });
        }

        let count = match participant_count {
            Some(count) => count,
            None => {
                self.participant_count(room_id, snapshot.participant_count)
                    .await
            }
        };
        if let Selection::Idle(reason) = self.select_ad(room_id, count).await? {
            tracing::debug!(%room_id, reason = reason.as_str(), "no eligible ads");
            return Ok(StartOutcome::Rejected {
                reason: StartRejection::NoEligibleAds,
            });
        }

        let session_id = SessionId::new();
        tracing::info!(%room_id, %session_id, participants = count, "ad session started");
        let _ = self
            .webhooks
            .emit(
                &AdsEvent::SessionStarted {
                    room_id,
                    session_id,
                    participant_count: count,
                },
                None,
            )
            .await;

        match self.allocate(room_id, session_id, count).await? {
            Allocation::Reserved(reservation) => Ok(StartOutcome::Started {
                session_id,
                reservation,
            }),
            Allocation::Idle(_) => Ok(StartOutcome::Rejected {
                reason: StartRejection::NoEligibleAds,
            }),
        }
    }

    /// Reserves the next ad for a session.
    ///
    /// Returns the session's existing reservation unchanged if one is
    /// already playing. If another writer reserves first, its reservation
    /// stands. With nothing eligible the session goes idle: a stopped
    /// snapshot is written and `ads.session.idle` is emitted.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or the snapshot write fails.
    pub async fn allocate(
        &self,
        room_id: RoomId,
        session_id: SessionId,
        participant_count: u32,
    ) -> Result<Allocation, AdsError> {
        self.reserve(room_id, session_id, participant_count, None)
            .await?
            .ok_or_else(|| AdsError::Conflict(format!("session {session_id} was superseded")))
    }

    /// Allocation shared by [`SessionManager::allocate`] and rotation.
    ///
    /// With a `guard`, the snapshot must still be at the guard's version
    /// when the new reservation is published. Otherwise the reservation is
    /// withdrawn and `None` is returned.
    async fn reserve(
        &self,
        room_id: RoomId,
        session_id: SessionId,
        participant_count: u32,
        guard: Option<&RoomSnapshot>,
    ) -> Result<Option<Allocation>, AdsError> {
        if let Some(existing) = self
            .ports
            .reservations
            .find_reserved_for_session(room_id, session_id)
            .await?
        {
            tracing::debug!(%room_id, %session_id, reservation_id = %existing.id, "reservation already allocated");
            return Ok(Some(Allocation::Reserved(existing)));
        }

        let selection = self.select_ad(room_id, participant_count).await?;
        if let Some(expected) = guard
            && self.superseded(expected).await?
        {
            tracing::info!(%room_id, %session_id, "session changed during rotation, not allocating");
            return Ok(None);
        }
        let ad = match selection {
            Selection::Ad(ad) => ad,
            Selection::Idle(reason) => {
                let idle = self
                    .go_idle(room_id, session_id, reason, participant_count, guard)
                    .await?;
                return Ok(idle.then_some(Allocation::Idle(reason)));
            }
        };

        let reservation = Reservation::new(
            ad.id,
            room_id,
            session_id,
            ad.duration_sec(),
            Utc::now(),
            ad.webhook_url.clone(),
        );
        match self.ports.reservations.create(&reservation).await {
            Ok(()) => {}
            Err(AdsError::Conflict(detail)) => {
                tracing::info!(%room_id, %session_id, %detail, "concurrent allocation, keeping existing reservation");
                return match self.ports.reservations.find_reserved_for_room(room_id).await? {
                    Some(existing) => Ok(Some(Allocation::Reserved(existing))),
                    None => Err(AdsError::Conflict(detail)),
                };
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            %room_id,
            %session_id,
            reservation_id = %reservation.id,
            ad_id = %ad.id,
            duration_sec = reservation.duration_sec,
            "ad reserved"
        );
        let running = SnapshotService::running(
            &reservation,
            participant_count,
            Some(ad.min_participants),
            Some("ads.ad.started"),
        );
        match guard {
            None => {
                self.snapshots.write(running).await?;
            }
            Some(expected) => {
                if self
                    .snapshots
                    .write_if_current(running, expected.version)
                    .await?
                    .is_none()
                {
                    tracing::info!(%room_id, %session_id, reservation_id = %reservation.id, "session stopped during rotation, withdrawing reservation");
                    self.ports.reservations.cancel(reservation.id).await?;
                    return Ok(None);
                }
            }
        }

        let _ = self
            .webhooks
            .emit(
                &AdsEvent::AdStarted {
                    room_id,
                    session_id,
                    reservation_id: reservation.id,
                    ad_id: ad.id,
                    duration_sec: reservation.duration_sec,
                    participant_count,
                    min_participants: ad.min_participants,
                },
                ad.webhook_url.as_deref(),
            )
            .await;

        if let Err(e) = self.watch.start_reservation(&reservation).await {
            tracing::warn!(%room_id, reservation_id = %reservation.id, error = %e, "watch tracking did not start");
        }
        self.schedule_rotation(&reservation);
        Ok(Some(Allocation::Reserved(reservation)))
    }

    /// True when the room's snapshot moved past `expected` or stopped.
    async fn superseded(&self, expected: &RoomSnapshot) -> Result<bool, AdsError> {
        let current = self.snapshots.get(expected.room_id).await?;
        Ok(current.version != expected.version || !current.is_running())
    }

    /// Completes an expired reservation and allocates the next ad.
    ///
    /// Returns `None` when the reservation was already closed or the
    /// session stopped meanwhile, including a stop that lands while the
    /// next ad is being chosen.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or the snapshot cache fails.
    pub async fn run_rotation(
        &self,
        reservation: &Reservation,
    ) -> Result<Option<Allocation>, AdsError> {
        let room_id = reservation.room_id;
        let Some(completed) = self
            .ports
            .reservations
            .mark_completed(reservation.id)
            .await?
        else {
            tracing::debug!(%room_id, reservation_id = %reservation.id, "reservation already closed, rotation skipped");
            return Ok(None);
        };

        match self.ports.catalog.consume_inventory(completed.ad_id).await {
            Ok(Some(ad)) => {
                tracing::info!(ad_id = %ad.id, rooms_remaining = ad.rooms_remaining, "inventory consumed");
            }
            Ok(None) => tracing::warn!(ad_id = %completed.ad_id, "inventory already exhausted"),
            Err(e) => tracing::error!(ad_id = %completed.ad_id, error = %e, "inventory decrement failed"),
        }

        if let Err(e) = self
            .watch
            .finalize_reservation(&completed, Utc::now())
            .await
        {
            tracing::warn!(%room_id, reservation_id = %completed.id, error = %e, "watch finalization failed");
        }

        let _ = self
            .webhooks
            .emit(
                &AdsEvent::AdCompleted {
                    room_id,
                    session_id: completed.session_id,
                    reservation_id: completed.id,
                    ad_id: completed.ad_id,
                    duration_sec: completed.duration_sec,
                },
                completed.webhook_url.as_deref(),
            )
            .await;

        let snapshot = self.snapshots.get(room_id).await?;
        if !snapshot.is_running_session(completed.session_id) {
            tracing::debug!(%room_id, session_id = %completed.session_id, "session no longer running");
            return Ok(None);
        }

        let count = self
            .participant_count(room_id, snapshot.participant_count)
            .await;
        self.reserve(room_id, completed.session_id, count, Some(&snapshot))
            .await
    }

    /// Stops the room's session.
    ///
    /// Cancels the playing reservation, closes its watch stamps, clears
    /// the local timer and emits `ads.session.stopped`. Watch time is
    /// flushed only for [`StopReason::RoomEnded`], which also always
    /// records a `room_ended` snapshot so later evaluations stay off.
    /// Otherwise stopping a stopped room returns its snapshot unchanged.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or the snapshot cache fails.
    pub async fn stop(&self, room_id: RoomId, reason: StopReason) -> Result<RoomSnapshot, AdsError> {
        let snapshot = self.snapshots.get(room_id).await?;
        self.cancel_timer(room_id);

        // Written before the cancel: a racing rotation either fails its
        // conditional snapshot write or finds its reservation canceled.
        let early = snapshot.is_running() || reason == StopReason::RoomEnded;
        let mut stored = if early {
            Some(self.write_stopped(&snapshot, reason, snapshot.session_id).await?)
        } else {
            None
        };

        let now = Utc::now();
        let canceled = self
            .ports
            .reservations
            .cancel_reserved_in_room(room_id)
            .await?;
        for reservation in &canceled {
            if let Err(e) = self.watch.close_stamps_at(reservation, now).await {
                tracing::warn!(%room_id, reservation_id = %reservation.id, error = %e, "failed to close watch stamps");
            }
            let token = self.rotation_token(reservation.id);
            if let Err(e) = self
                .ports
                .locks
                .release(&rotation_lock_key(room_id), &token)
                .await
            {
                tracing::warn!(%room_id, error = %e, "failed to release rotation lock");
            }
        }

        if stored.is_none() && !canceled.is_empty() {
            let session_id = canceled.first().map(|r| r.session_id);
            stored = Some(self.write_stopped(&snapshot, reason, session_id).await?);
        }

        let session_id =
            running_session(&snapshot).or_else(|| canceled.first().map(|r| r.session_id));
        if let Some(session_id) = session_id {
            tracing::info!(%room_id, %session_id, reason = reason.as_str(), "ad session stopped");
            let _ = self
                .webhooks
                .emit(
                    &AdsEvent::SessionStopped {
                        room_id,
                        session_id,
                        reason,
                    },
                    None,
                )
                .await;
        }

        if reason == StopReason::RoomEnded
            && let Err(e) = self.watch.flush_room(room_id).await
        {
            tracing::error!(%room_id, error = %e, "watch flush failed");
        }
        Ok(stored.unwrap_or(snapshot))
    }

    async fn write_stopped(
        &self,
        snapshot: &RoomSnapshot,
        reason: StopReason,
        session_id: Option<SessionId>,
    ) -> Result<RoomSnapshot, AdsError> {
        self.snapshots
            .write(SnapshotService::stopped(
                snapshot.room_id,
                session_id,
                reason.as_str(),
                "ads.session.stopped",
                snapshot.participant_count,
            ))
            .await
    }

    /// Starts or stops the session to match room settings.
    ///
    /// Called from participant join/leave and settings changes. Never
    /// fails: errors are logged and reported as [`Evaluation::Unchanged`].
    pub async fn evaluate_auto(&self, room_id: RoomId, participant_count: Option<u32>) -> Evaluation {
        match self.try_evaluate(room_id, participant_count).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::warn!(%room_id, error = %e, "ad auto-evaluation failed");
                Evaluation::Unchanged
            }
        }
    }

    async fn try_evaluate(
        &self,
        room_id: RoomId,
        participant_count: Option<u32>,
    ) -> Result<Evaluation, AdsError> {
        let Some(room) = self.ports.rooms.get_room(room_id).await? else {
            return Ok(Evaluation::Unchanged);
        };
        let snapshot = self.snapshots.get(room_id).await?;
        let running = snapshot.is_running();

        if !room.ads_enabled {
            if running {
                self.stop(room_id, StopReason::AdsDisabled).await?;
                return Ok(Evaluation::Stopped(StopReason::AdsDisabled));
            }
            return Ok(Evaluation::Unchanged);
        }
        if running || !room.is_live() {
            return Ok(Evaluation::Unchanged);
        }
        if snapshot.reason.as_deref() == Some(StopReason::RoomEnded.as_str()) {
            tracing::debug!(%room_id, "room already ended, not restarting ads");
            return Ok(Evaluation::Unchanged);
        }

        match self.start(room_id, participant_count).await? {
            StartOutcome::Started { session_id, .. } => Ok(Evaluation::Started(session_id)),
            _ => Ok(Evaluation::Unchanged),
        }
    }

    /// Revalidates every running snapshot after a restart.
    ///
    /// A snapshot backed by a live reservation of the same session gets its
    /// timer back with the remaining delay. Anything else is stopped with
    /// reason `stale_reservation`.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or the snapshot cache fails.
    pub async fn recover(&self) -> Result<RecoveryReport, AdsError> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for snapshot in self.snapshots.list_running().await? {
            let room_id = snapshot.room_id;
            if self.has_local_timer(room_id) {
                continue;
            }
            let reservation = match &snapshot.current {
                Some(current) => self.ports.reservations.get(current.reservation_id).await?,
                None => None,
            };

            match reservation {
                Some(r)
                    if r.is_reserved()
                        && snapshot.session_id == Some(r.session_id)
                        && !r.is_expired_at(now) =>
                {
                    tracing::info!(
                        %room_id,
                        reservation_id = %r.id,
                        remaining_ms = u64::try_from(r.remaining_at(now).as_millis()).unwrap_or(u64::MAX),
                        "rotation timer restored"
                    );
                    self.schedule_rotation(&r);
                    report.rescheduled += 1;
                }
                stale => {
                    tracing::warn!(%room_id, "discarding stale running snapshot");
                    self.discard_stale(
                        room_id,
                        snapshot.session_id,
                        stale,
                        snapshot.participant_count,
                        now,
                    )
                    .await?;
                    report.discarded += 1;
                }
            }
        }

        tracing::info!(
            rescheduled = report.rescheduled,
            discarded = report.discarded,
            "session recovery finished"
        );
        Ok(report)
    }

    /// Stops sessions whose reservation expired before `cutoff` and has no
    /// live timer in this process. Returns the number reaped.
    ///
    /// # Errors
    ///
    /// Returns an [`AdsError`] if storage or the snapshot cache fails.
    pub async fn reap_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, AdsError> {
        let now = Utc::now();
        let mut reaped = 0;
        for reservation in self.ports.reservations.list_stale_reserved(cutoff).await? {
            let room_id = reservation.room_id;
            if self.has_local_timer(room_id) {
                continue;
            }
            tracing::warn!(
                %room_id,
                reservation_id = %reservation.id,
                expired_at = %reservation.expires_at,
                "reaping stale reservation"
            );
            self.discard_stale(room_id, Some(reservation.session_id), Some(reservation), 0, now)
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn discard_stale(
        &self,
        room_id: RoomId,
        session_id: Option<SessionId>,
        reservation: Option<Reservation>,
        participant_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AdsError> {
        if let Some(r) = reservation.filter(Reservation::is_reserved)
            && let Some(canceled) = self.ports.reservations.cancel(r.id).await?
            && let Err(e) = self.watch.close_stamps_at(&canceled, now).await
        {
            tracing::warn!(%room_id, error = %e, "failed to close watch stamps");
        }
        self.snapshots
            .write(SnapshotService::stopped(
                room_id,
                session_id,
                StopReason::StaleReservation.as_str(),
                "ads.session.stopped",
                participant_count,
            ))
            .await?;
        if let Some(session_id) = session_id {
            let _ = self
                .webhooks
                .emit_legacy(&AdsEvent::SessionStopped {
                    room_id,
                    session_id,
                    reason: StopReason::StaleReservation,
                })
                .await;
        }
        Ok(())
    }

    /// Returns `true` if this process runs a live rotation timer for the room.
    #[must_use]
    pub fn has_local_timer(&self, room_id: RoomId) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    /// Schedules the rotation for `reservation` at its `expires_at`.
    ///
    /// Replaces any other timer for the room. Scheduling the reservation
    /// that already has a live timer is a no-op.
    pub fn schedule_rotation(&self, reservation: &Reservation) {
        let room_id = reservation.room_id;
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = timers.get(&room_id)
            && existing.reservation_id == reservation.id
            && !existing.handle.is_finished()
        {
            return;
        }

        let manager = self.clone();
        let owned = reservation.clone();
        let handle = tokio::spawn(async move { manager.drive_rotation(owned).await });
        if let Some(previous) = timers.insert(
            room_id,
            RoomTimer {
                reservation_id: reservation.id,
                handle,
            },
        ) {
            previous.handle.abort();
        }
        tracing::debug!(
            %room_id,
            reservation_id = %reservation.id,
            expires_at = %reservation.expires_at,
            "rotation scheduled"
        );
    }

    async fn drive_rotation(self, reservation: Reservation) {
        let room_id = reservation.room_id;
        let key = rotation_lock_key(room_id);
        let token = self.rotation_token(reservation.id);

        if !self.acquire_rotation_lock(&key, &token, &reservation).await {
            tracing::warn!(%room_id, reservation_id = %reservation.id, "rotation driven elsewhere, timer dropped");
            self.forget_timer(room_id, reservation.id);
            return;
        }

        tokio::time::sleep(reservation.remaining_at(Utc::now())).await;
        self.forget_timer(room_id, reservation.id);

        // completion is conditional, so only the wait needs the lock
        if let Err(e) = self.ports.locks.release(&key, &token).await {
            tracing::warn!(%room_id, error = %e, "failed to release rotation lock");
        }
        if let Err(e) = self.run_rotation(&reservation).await {
            tracing::error!(%room_id, reservation_id = %reservation.id, error = %e, "rotation failed");
        }
    }

    async fn acquire_rotation_lock(&self, key: &str, token: &str, reservation: &Reservation) -> bool {
        let mut delay = self.settings.backoff_base;
        for attempt in 1..=self.settings.backoff_attempts {
            let ttl = reservation.remaining_at(Utc::now()) + self.settings.rotation_buffer;
            match self.ports.locks.try_acquire(key, token, ttl).await {
                Ok(true) => return true,
                Ok(false) => tracing::debug!(room_id = %reservation.room_id, attempt, "rotation lock busy"),
                Err(e) => tracing::warn!(room_id = %reservation.room_id, attempt, error = %e, "rotation lock unavailable"),
            }
            if attempt < self.settings.backoff_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(self.settings.backoff_cap);
            }
        }
        false
    }

    fn forget_timer(&self, room_id: RoomId, reservation_id: ReservationId) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers
            .get(&room_id)
            .is_some_and(|timer| timer.reservation_id == reservation_id)
        {
            timers.remove(&room_id);
        }
    }

    fn cancel_timer(&self, room_id: RoomId) {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&room_id);
        if let Some(timer) = removed {
            timer.handle.abort();
            tracing::debug!(%room_id, reservation_id = %timer.reservation_id, "rotation timer cleared");
        }
    }

    fn rotation_token(&self, reservation_id: ReservationId) -> String {
        format!("{}:{reservation_id}", self.instance_id)
    }

    async fn check_room(&self, room_id: RoomId) -> Result<Option<StartRejection>, AdsError> {
        Ok(match self.ports.rooms.get_room(room_id).await? {
            None => Some(StartRejection::RoomNotFound),
            Some(room) if !room.is_live() => Some(StartRejection::RoomNotFound),
            Some(room) if !room.ads_enabled => Some(StartRejection::AdsDisabled),
            Some(_) => None,
        })
    }

    async fn participant_count(&self, room_id: RoomId, fallback: u32) -> u32 {
        match self
            .ports
            .conferencing
            .active_participant_count(room_id)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(%room_id, error = %e, fallback, "participant count unavailable");
                fallback
            }
        }
    }

    async fn select_ad(&self, room_id: RoomId, participant_count: u32) -> Result<Selection, AdsError> {
        let used: HashSet<AdId> = self
            .ports
            .reservations
            .used_ad_ids(room_id)
            .await?
            .into_iter()
            .collect();
        let mut candidates: Vec<Advertisement> = self
            .ports
            .catalog
            .list_active()
            .await?
            .into_iter()
            .filter(|ad| ad.has_inventory() && !used.contains(&ad.id))
            .collect();
        if candidates.is_empty() {
            return Ok(Selection::Idle(IdleReason::NoInventory));
        }
        candidates.sort_by_key(Advertisement::fifo_key);
        Ok(candidates
            .into_iter()
            .find(|ad| ad.accepts_audience(participant_count))
            .map_or(
                Selection::Idle(IdleReason::InsufficientParticipants),
                Selection::Ad,
            ))
    }

    /// Returns `false` when a guarded write lost to a newer snapshot.
    async fn go_idle(
        &self,
        room_id: RoomId,
        session_id: SessionId,
        reason: IdleReason,
        participant_count: u32,
        guard: Option<&RoomSnapshot>,
    ) -> Result<bool, AdsError> {
        let idle = SnapshotService::stopped(
            room_id,
            Some(session_id),
            reason.as_str(),
            "ads.session.idle",
            participant_count,
        );
        match guard {
            None => {
                self.snapshots.write(idle).await?;
            }
            Some(expected) => {
                if self
                    .snapshots
                    .write_if_current(idle, expected.version)
                    .await?
                    .is_none()
                {
                    tracing::debug!(%room_id, %session_id, "session stopped during rotation, not going idle");
                    return Ok(false);
                }
            }
        }
        tracing::info!(%room_id, %session_id, reason = reason.as_str(), "ad session idle");
        let _ = self
            .webhooks
            .emit(
                &AdsEvent::SessionIdle {
                    room_id,
                    session_id,
                    reason,
                    participant_count,
                },
                None,
            )
            .await;
        Ok(true)
    }
}

fn running_session(snapshot: &RoomSnapshot) -> Option<SessionId> {
    snapshot.session_id.filter(|_| snapshot.is_running())
}

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod tests {
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    use super::*;
    use crate::coordination::{MemoryCoordinator, RetryQueue, SnapshotCache, WatchLedger};
    use crate::domain::{AdStatus, EventBus, ReservationStatus, Room, SessionState};
    use crate::persistence::{AdViewStore, MemoryStore};
    use crate::service::snapshot_service::DEFAULT_SNAPSHOT_TTL;
    use crate::testing::StaticConferencing;
    use crate::webhook::signature::HEADER_EVENT;

    pub(crate) struct Harness {
        pub(crate) manager: SessionManager,
        pub(crate) store: Arc<MemoryStore>,
        pub(crate) coordinator: Arc<MemoryCoordinator>,
        pub(crate) conferencing: Arc<StaticConferencing>,
        pub(crate) room: RoomId,
        pub(crate) ad: AdId,
    }

    pub(crate) fn advertisement(minutes: u32, min_participants: u32, rooms: u32) -> Advertisement {
        Advertisement {
            id: AdId::new(),
            title: "Launch week".to_string(),
            image_ref: "img/launch.png".to_string(),
            minutes_per_room: minutes,
            total_rooms: rooms,
            rooms_remaining: rooms,
            min_participants,
            status: AdStatus::Active,
            webhook_url: None,
            created_at: Utc::now(),
            seq: 0,
        }
    }

    pub(crate) fn build_manager<C: ConferencingProvider + 'static>(
        store: &Arc<MemoryStore>,
        coordinator: &Arc<MemoryCoordinator>,
        conferencing: &Arc<C>,
        webhook_url: Option<String>,
        instance: &str,
    ) -> SessionManager {
        let snapshots = SnapshotService::new(
            Arc::clone(coordinator) as Arc<dyn SnapshotCache>,
            Arc::clone(store) as Arc<dyn ReservationStore>,
            EventBus::new(64),
            DEFAULT_SNAPSHOT_TTL,
        );
        let watch = WatchTracker::new(
            Arc::clone(coordinator) as Arc<dyn WatchLedger>,
            Arc::clone(store) as Arc<dyn ReservationStore>,
            Arc::clone(store) as Arc<dyn AdViewStore>,
        );
        let webhooks = Arc::new(WebhookDispatcher::new(
            reqwest::Client::new(),
            "secret",
            webhook_url,
            Arc::clone(coordinator) as Arc<dyn RetryQueue>,
        ));
        let ports = SessionPorts {
            rooms: Arc::clone(store) as Arc<dyn RoomDirectory>,
            catalog: Arc::clone(store) as Arc<dyn AdCatalog>,
            reservations: Arc::clone(store) as Arc<dyn ReservationStore>,
            locks: Arc::clone(coordinator) as Arc<dyn LockManager>,
            conferencing: Arc::clone(conferencing) as Arc<dyn ConferencingProvider>,
        };
        SessionManager::new(ports, snapshots, watch, webhooks, instance)
    }

    /// Conferencing double that holds the participant count call until
    /// released.
    #[derive(Debug, Default)]
    struct GatedConferencing {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ConferencingProvider for GatedConferencing {
        async fn active_participant_count(
            &self,
            _room_id: RoomId,
        ) -> Result<u32, crate::external::ExternalError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(2)
        }

        async fn end_room(
            &self,
            _room_id: RoomId,
            _reason: &str,
        ) -> Result<(), crate::external::ExternalError> {
            Ok(())
        }
    }

    pub(crate) async fn harness_with(
        ad: Advertisement,
        webhook_url: Option<String>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let conferencing = Arc::new(StaticConferencing::new(2));
        let room = RoomId::new();
        store
            .upsert_room(Room {
                id: room,
                ads_enabled: true,
                ended_at: None,
            })
            .await;
        let ad = store.insert_ad(ad).await;
        let manager = build_manager(&store, &coordinator, &conferencing, webhook_url, "node-a");
        Harness {
            manager,
            store,
            coordinator,
            conferencing,
            room,
            ad,
        }
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(advertisement(5, 1, 3), None).await
    }

    async fn record(
        State(events): State<Arc<Mutex<Vec<String>>>>,
        headers: HeaderMap,
    ) -> StatusCode {
        let name = headers
            .get(HEADER_EVENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name);
        StatusCode::NO_CONTENT
    }

    async fn recorder() -> (String, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hooks", post(record))
            .with_state(Arc::clone(&events));
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind recorder");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("recorder address");
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/hooks"), events)
    }

    async fn started(h: &Harness) -> (SessionId, Reservation) {
        match h.manager.start(h.room, Some(2)).await {
            Ok(StartOutcome::Started {
                session_id,
                reservation,
            }) => (session_id, reservation),
            other => panic!("expected a started session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_ad_plays_once_then_goes_idle() {
        let (url, events) = recorder().await;
        let h = harness_with(advertisement(5, 1, 3), Some(url)).await;

        let (session_id, reservation) = started(&h).await;
        assert_eq!(reservation.duration_sec, 300);
        assert_eq!(reservation.ad_id, h.ad);

        let Ok(Some(Allocation::Idle(reason))) = h.manager.run_rotation(&reservation).await else {
            panic!("rotation should go idle");
        };
        assert_eq!(reason, IdleReason::NoInventory);

        let Ok(Some(ad)) = h.store.get_ad(h.ad).await else {
            panic!("ad should exist");
        };
        assert_eq!(ad.rooms_remaining, 2);

        let Ok(snapshot) = h.manager.snapshots().get(h.room).await else {
            panic!("snapshot should load");
        };
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.session_id, Some(session_id));
        assert_eq!(snapshot.reason.as_deref(), Some("no_inventory"));
        assert_eq!(snapshot.last_event.as_deref(), Some("ads.session.idle"));

        let seen = events.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(
            seen,
            vec![
                "ads.session.started",
                "ads.ad.started",
                "ads.ad.completed",
                "ads.session.idle"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_timer_fires_at_expiry() {
        let h = harness().await;
        let (_, reservation) = started(&h).await;
        assert!(h.manager.has_local_timer(h.room));

        tokio::time::sleep(Duration::from_secs(301)).await;

        let rows = h.store.reservations_in_room(h.room).await;
        let [row] = rows.as_slice() else {
            panic!("expected one reservation");
        };
        assert_eq!(row.id, reservation.id);
        assert_eq!(row.status, ReservationStatus::Completed);
        assert!(!h.manager.has_local_timer(h.room));

        let Ok(snapshot) = h.manager.snapshots().get(h.room).await else {
            panic!("snapshot should load");
        };
        assert!(!snapshot.is_running());
        assert_eq!(snapshot.reason.as_deref(), Some("no_inventory"));
    }

    #[tokio::test]
    async fn rotation_moves_to_next_fifo_ad() {
        let h = harness().await;
        let second = h.store.insert_ad(advertisement(1, 1, 1)).await;
        let (session_id, first) = started(&h).await;
        assert_eq!(first.ad_id, h.ad);

        let Ok(Some(Allocation::Reserved(next))) = h.manager.run_rotation(&first).await else {
            panic!("rotation should reserve the next ad");
        };
        assert_eq!(next.ad_id, second);
        assert_eq!(next.session_id, session_id);
        assert_eq!(next.duration_sec, 60);
    }

    #[tokio::test]
    async fn allocation_is_idempotent_per_session() {
        let h = harness().await;
        let (session_id, reservation) = started(&h).await;

        let Ok(Allocation::Reserved(again)) = h.manager.allocate(h.room, session_id, 2).await else {
            panic!("allocate should return the existing reservation");
        };
        assert_eq!(again, reservation);
        assert_eq!(h.store.reservations_in_room(h.room).await.len(), 1);
    }

    #[tokio::test]
    async fn repeated_start_returns_running_session() {
        let h = harness().await;
        let (session_id, _) = started(&h).await;
        let Ok(StartOutcome::AlreadyRunning { session_id: again }) =
            h.manager.start(h.room, Some(2)).await
        else {
            panic!("second start should be idempotent");
        };
        assert_eq!(again, session_id);
    }

    #[tokio::test]
    async fn concurrent_starts_reserve_once() {
        let h = harness().await;
        let other = h.manager.clone();
        let (a, b) = tokio::join!(h.manager.start(h.room, Some(2)), other.start(h.room, Some(2)));
        let outcomes = [a, b];
        let started = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(StartOutcome::Started { .. })))
            .count();
        assert_eq!(started, 1);

        let reserved = h
            .store
            .reservations_in_room(h.room)
            .await
            .into_iter()
            .filter(Reservation::is_reserved)
            .count();
        assert_eq!(reserved, 1);
    }

    #[tokio::test]
    async fn start_rejections_are_typed() {
        let h = harness_with(advertisement(5, 10, 3), None).await;
        let Ok(StartOutcome::Rejected { reason }) = h.manager.start(h.room, Some(2)).await else {
            panic!("small audience should be rejected");
        };
        assert_eq!(reason, StartRejection::NoEligibleAds);

        let Ok(StartOutcome::Rejected { reason }) = h.manager.start(RoomId::new(), None).await else {
            panic!("unknown room should be rejected");
        };
        assert_eq!(reason, StartRejection::RoomNotFound);

        h.store.set_ads_enabled(h.room, false).await;
        let Ok(StartOutcome::Rejected { reason }) = h.manager.start(h.room, Some(50)).await else {
            panic!("disabled room should be rejected");
        };
        assert_eq!(reason, StartRejection::AdsDisabled);
    }

    #[tokio::test]
    async fn stop_cancels_and_frees_the_ad() {
        let h = harness().await;
        let (_, first) = started(&h).await;

        let Ok(snapshot) = h.manager.stop(h.room, StopReason::Manual).await else {
            panic!("stop should succeed");
        };
        assert!(!snapshot.is_running());
        assert_eq!(snapshot.reason.as_deref(), Some("manual"));
        assert!(!h.manager.has_local_timer(h.room));

        let Ok(Some(canceled)) = h.store.get(first.id).await else {
            panic!("reservation should exist");
        };
        assert_eq!(canceled.status, ReservationStatus::Canceled);

        // a canceled slot does not count as used
        let (_, second) = started(&h).await;
        assert_eq!(second.ad_id, h.ad);

        // a rotation for the canceled slot is a no-op
        assert!(matches!(h.manager.run_rotation(&first).await, Ok(None)));
    }

    #[tokio::test]
    async fn stop_on_stopped_room_is_a_no_op() {
        let h = harness().await;
        let Ok(snapshot) = h.manager.stop(h.room, StopReason::Manual).await else {
            panic!("stop should succeed");
        };
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.reason.is_none());
    }

    #[tokio::test]
    async fn stop_during_rotation_keeps_the_room_stopped() {
        let h = harness().await;
        let _ = h.store.insert_ad(advertisement(1, 1, 1)).await;
        let (_, first) = started(&h).await;

        let gate = Arc::new(GatedConferencing::default());
        let rotating = build_manager(&h.store, &h.coordinator, &gate, None, "node-b");
        let rotation = {
            let rotating = rotating.clone();
            let first = first.clone();
            tokio::spawn(async move { rotating.run_rotation(&first).await })
        };

        gate.entered.notified().await;
        let Ok(stopped) = h.manager.stop(h.room, StopReason::RoomEnded).await else {
            panic!("stop should succeed");
        };
        assert!(!stopped.is_running());
        gate.release.notify_one();

        let Ok(outcome) = rotation.await else {
            panic!("rotation task should not panic");
        };
        assert!(matches!(outcome, Ok(None)), "got {outcome:?}");

        let reserved: Vec<Reservation> = h
            .store
            .reservations_in_room(h.room)
            .await
            .into_iter()
            .filter(Reservation::is_reserved)
            .collect();
        assert!(reserved.is_empty(), "left reserved: {reserved:?}");
        assert!(!rotating.has_local_timer(h.room));

        let Ok(snapshot) = h.manager.snapshots().get(h.room).await else {
            panic!("snapshot should load");
        };
        assert!(!snapshot.is_running());
        assert_eq!(snapshot.reason.as_deref(), Some("room_ended"));
    }

    #[tokio::test]
    async fn ended_rooms_are_not_restarted_by_evaluation() {
        let h = harness().await;
        let _ = started(&h).await;
        let Ok(_) = h.manager.stop(h.room, StopReason::RoomEnded).await else {
            panic!("stop should succeed");
        };
        assert_eq!(h.manager.evaluate_auto(h.room, Some(2)).await, Evaluation::Unchanged);
        assert!(!h.manager.has_local_timer(h.room));

        // ended before any ad ever played
        let idle = harness().await;
        let Ok(snapshot) = idle.manager.stop(idle.room, StopReason::RoomEnded).await else {
            panic!("stop should succeed");
        };
        assert_eq!(snapshot.reason.as_deref(), Some("room_ended"));
        assert_eq!(idle.manager.evaluate_auto(idle.room, Some(2)).await, Evaluation::Unchanged);
        let Ok(after) = idle.manager.snapshots().get(idle.room).await else {
            panic!("snapshot should load");
        };
        assert!(!after.is_running());
    }

    #[tokio::test]
    async fn evaluate_follows_room_settings() {
        let h = harness().await;
        let Evaluation::Started(session_id) = h.manager.evaluate_auto(h.room, None).await else {
            panic!("enabled room with inventory should start");
        };

        h.store.set_ads_enabled(h.room, false).await;
        assert_eq!(
            h.manager.evaluate_auto(h.room, None).await,
            Evaluation::Stopped(StopReason::AdsDisabled)
        );
        let Ok(snapshot) = h.manager.snapshots().get(h.room).await else {
            panic!("snapshot should load");
        };
        assert_eq!(snapshot.session_id, Some(session_id));
        assert_eq!(snapshot.reason.as_deref(), Some("ads_disabled"));
    }

    #[tokio::test]
    async fn evaluate_swallows_collaborator_failures() {
        let h = harness().await;
        h.conferencing.set_failing(true);
        // count falls back to zero, below every threshold
        assert_eq!(
            h.manager.evaluate_auto(h.room, None).await,
            Evaluation::Unchanged
        );
        assert_eq!(
            h.manager.evaluate_auto(RoomId::new(), None).await,
            Evaluation::Unchanged
        );
    }

    #[tokio::test]
    async fn recovery_restores_live_timers_and_drops_stale_ones() {
        let h = harness().await;
        let (_, reservation) = started(&h).await;

        // a stale running snapshot pointing at a reservation that is gone
        let ghost_room = RoomId::new();
        let ghost = Reservation::new(h.ad, ghost_room, SessionId::new(), 60, Utc::now(), None);
        let _ = h
            .manager
            .snapshots()
            .write(SnapshotService::running(&ghost, 1, None, None))
            .await;

        let restarted = build_manager(&h.store, &h.coordinator, &h.conferencing, None, "node-b");
        let Ok(report) = restarted.recover().await else {
            panic!("recovery should succeed");
        };
        assert_eq!(report, RecoveryReport { rescheduled: 1, discarded: 1 });
        assert!(restarted.has_local_timer(reservation.room_id));
        assert!(!restarted.has_local_timer(ghost_room));

        let Ok(snapshot) = restarted.snapshots().get(ghost_room).await else {
            panic!("snapshot should load");
        };
        assert_eq!(snapshot.reason.as_deref(), Some("stale_reservation"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_timer_waits_only_for_the_remaining_time() {
        let h = harness().await;
        let reservation = Reservation::new(
            h.ad,
            h.room,
            SessionId::new(),
            300,
            Utc::now() - chrono::Duration::seconds(240),
            None,
        );
        let Ok(()) = h.store.create(&reservation).await else {
            panic!("reservation should be stored");
        };
        let _ = h
            .manager
            .snapshots()
            .write(SnapshotService::running(&reservation, 2, None, None))
            .await;

        let restarted = build_manager(&h.store, &h.coordinator, &h.conferencing, None, "node-b");
        let Ok(report) = restarted.recover().await else {
            panic!("recovery should succeed");
        };
        assert_eq!(report.rescheduled, 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        let Ok(Some(pending)) = h.store.get(reservation.id).await else {
            panic!("reservation should exist");
        };
        assert_eq!(pending.status, ReservationStatus::Reserved);
        assert!(restarted.has_local_timer(h.room));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let Ok(Some(done)) = h.store.get(reservation.id).await else {
            panic!("reservation should exist");
        };
        assert_eq!(done.status, ReservationStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_rotation_lock_gives_up_after_backoff() {
        let h = harness().await;
        let reservation = Reservation::new(h.ad, h.room, SessionId::new(), 60, Utc::now(), None);
        let lock = h
            .coordinator
            .try_acquire(&rotation_lock_key(h.room), "elsewhere", Duration::from_secs(3600))
            .await;
        assert!(matches!(lock, Ok(true)));

        h.manager.schedule_rotation(&reservation);
        assert!(h.manager.has_local_timer(h.room));
        // 0.5 + 1 + 2 + 4 + 8 s of backoff
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!h.manager.has_local_timer(h.room));
    }
}
