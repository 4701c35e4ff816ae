//! # room-ads-engine
//!
//! In-room advertisement engine for live audio rooms.
//!
//! The engine rotates sponsored ads through a room while it is live,
//! publishes the current state of every room as a snapshot, records who
//! actually listened, notifies external systems through signed webhooks
//! and, once a room has ended, swaps the ad revenue into the reward
//! token and pays it out to the listeners in proportion to their watch
//! time.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)            Conferencing provider
//!     │                                        │
//!     ├── REST Handlers (api/)                 │
//!     ├── WS Handler (ws/)                     │
//!     │                                        │
//!     ├── SessionManager (service/) ◄──────────┘
//!     │     ├── SnapshotService ──► EventBus (domain/) ──► WS subscribers
//!     │     ├── WatchTracker
//!     │     └── WebhookDispatcher (webhook/) ──► RetryWorker
//!     │
//!     ├── DistributionEngine (service/)
//!     │     └── Identity, Swap, Chain (external/)
//!     │
//!     ├── ReservationReaper, DistributionSweep (service/maintenance)
//!     │
//!     ├── Persistence (persistence/): PostgreSQL or in-memory
//!     └── Coordination (coordination/): Redis or in-memory
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod external;
pub mod persistence;
pub mod service;
pub mod testing;
pub mod webhook;
pub mod ws;
