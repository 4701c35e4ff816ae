//! Shared application state injected into all Axum handlers, and the
//! wiring that builds it from configured backends.

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::coordination::{
    LockManager, MemoryCoordinator, RetryQueue, SnapshotCache, WatchLedger,
};
use crate::domain::EventBus;
use crate::external::{ChainClient, ConferencingProvider, IdentityResolver, SwapAggregator};
use crate::persistence::{
    AdCatalog, AdViewStore, MemoryStore, PayoutStore, ReservationStore, RoomDirectory,
};
use crate::service::{
    DistributionEngine, DistributionPorts, SessionManager, SessionPorts, SnapshotService,
    WatchTracker,
};
use crate::webhook::WebhookDispatcher;

/// Storage and coordination ports with the names of their backends.
#[derive(Clone)]
pub struct Backends {
    /// Room lookup.
    pub rooms: Arc<dyn RoomDirectory>,
    /// Advertisement catalog.
    pub catalog: Arc<dyn AdCatalog>,
    /// Reservations.
    pub reservations: Arc<dyn ReservationStore>,
    /// Watch records.
    pub views: Arc<dyn AdViewStore>,
    /// Payout records.
    pub payouts: Arc<dyn PayoutStore>,
    /// Distributed locks.
    pub locks: Arc<dyn LockManager>,
    /// Snapshot cache.
    pub snapshots: Arc<dyn SnapshotCache>,
    /// Webhook retry queue.
    pub retry_queue: Arc<dyn RetryQueue>,
    /// Presence and watch stamps.
    pub watch: Arc<dyn WatchLedger>,
    /// `"postgres"` or `"memory"`.
    pub persistence: &'static str,
    /// `"redis"` or `"memory"`.
    pub coordination: &'static str,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("persistence", &self.persistence)
            .field("coordination", &self.coordination)
            .finish_non_exhaustive()
    }
}

impl Backends {
    /// Splits one store and one coordinator into their ports.
    pub fn new<S, C>(
        store: &Arc<S>,
        coordinator: &Arc<C>,
        persistence: &'static str,
        coordination: &'static str,
    ) -> Self
    where
        S: RoomDirectory + AdCatalog + ReservationStore + AdViewStore + PayoutStore + 'static,
        C: LockManager + SnapshotCache + RetryQueue + WatchLedger + 'static,
    {
        Self {
            rooms: Arc::clone(store) as Arc<dyn RoomDirectory>,
            catalog: Arc::clone(store) as Arc<dyn AdCatalog>,
            reservations: Arc::clone(store) as Arc<dyn ReservationStore>,
            views: Arc::clone(store) as Arc<dyn AdViewStore>,
            payouts: Arc::clone(store) as Arc<dyn PayoutStore>,
            locks: Arc::clone(coordinator) as Arc<dyn LockManager>,
            snapshots: Arc::clone(coordinator) as Arc<dyn SnapshotCache>,
            retry_queue: Arc::clone(coordinator) as Arc<dyn RetryQueue>,
            watch: Arc::clone(coordinator) as Arc<dyn WatchLedger>,
            persistence,
            coordination,
        }
    }

    /// In-memory backends.
    #[must_use]
    pub fn in_memory(store: &Arc<MemoryStore>, coordinator: &Arc<MemoryCoordinator>) -> Self {
        Self::new(store, coordinator, "memory", "memory")
    }
}

/// Outbound collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Conferencing provider.
    pub conferencing: Arc<dyn ConferencingProvider>,
    /// Wallet lookup.
    pub identity: Arc<dyn IdentityResolver>,
    /// Swap routing.
    pub swap: Arc<dyn SwapAggregator>,
    /// Treasury signer.
    pub chain: Arc<dyn ChainClient>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Session state machine, snapshots and watch tracking.
    pub sessions: SessionManager,
    /// Revenue distribution.
    pub distribution: DistributionEngine,
    /// Webhook dispatcher shared with the retry worker.
    pub webhooks: Arc<WebhookDispatcher>,
    /// Storage and coordination ports.
    pub backends: Backends,
    /// Used to terminate media rooms on room end.
    pub conferencing: Arc<dyn ConferencingProvider>,
    /// Whether room end also terminates the media room.
    pub end_media_room: bool,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("sessions", &self.sessions)
            .field("backends", &self.backends)
            .field("end_media_room", &self.end_media_room)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires services over the given backends and collaborators.
    #[must_use]
    pub fn assemble(
        config: &EngineConfig,
        backends: Backends,
        collaborators: Collaborators,
        webhook_client: reqwest::Client,
    ) -> Self {
        let snapshots = SnapshotService::new(
            Arc::clone(&backends.snapshots),
            Arc::clone(&backends.reservations),
            EventBus::new(config.event_bus_capacity),
            config.snapshot_ttl,
        );
        let watch = WatchTracker::new(
            Arc::clone(&backends.watch),
            Arc::clone(&backends.reservations),
            Arc::clone(&backends.views),
        );
        let webhooks = Arc::new(
            WebhookDispatcher::new(
                webhook_client,
                config.webhook_secret.clone(),
                config.webhook_url.clone(),
                Arc::clone(&backends.retry_queue),
            )
            .with_policies(config.webhook_policy, config.legacy_webhook_policy),
        );

        let sessions = SessionManager::new(
            SessionPorts {
                rooms: Arc::clone(&backends.rooms),
                catalog: Arc::clone(&backends.catalog),
                reservations: Arc::clone(&backends.reservations),
                locks: Arc::clone(&backends.locks),
                conferencing: Arc::clone(&collaborators.conferencing),
            },
            snapshots,
            watch,
            Arc::clone(&webhooks),
            config.instance_id.as_str(),
        )
        .with_settings(config.session);

        let distribution = DistributionEngine::new(
            DistributionPorts {
                views: Arc::clone(&backends.views),
                catalog: Arc::clone(&backends.catalog),
                payouts: Arc::clone(&backends.payouts),
                identity: collaborators.identity,
                swap: collaborators.swap,
                chain: collaborators.chain,
            },
            config.pricing(),
            config.distribution.clone(),
        );

        Self {
            sessions,
            distribution,
            webhooks,
            backends,
            conferencing: collaborators.conferencing,
            end_media_room: config.end_media_room,
        }
    }
}
