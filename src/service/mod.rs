//! Service layer: business logic orchestration.
//!
//! [`SessionManager`] runs the per-room ad state machine on top of the
//! [`SnapshotService`] and [`WatchTracker`]. [`DistributionEngine`] pays
//! viewers once a room has ended, and the [`maintenance`] workers clean up
//! after crashed instances.

pub mod distribution;
pub mod maintenance;
pub mod session_manager;
pub mod snapshot_service;
pub mod watch_tracker;

pub use distribution::{
    DistributionEngine, DistributionOutcome, DistributionPorts, DistributionSettings,
};
pub use maintenance::{DistributionSweep, ReservationReaper, SweepReport};
pub use session_manager::{
    Allocation, Evaluation, RecoveryReport, SessionManager, SessionPorts, SessionSettings,
    StartOutcome,
};
pub use snapshot_service::{DEFAULT_SNAPSHOT_TTL, SnapshotService};
pub use watch_tracker::WatchTracker;
