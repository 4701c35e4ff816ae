//! WebSocket layer: connection handling, message routing, subscriptions.
//!
//! The endpoint at `/ws` streams room snapshots. Clients subscribe by
//! room ID (or `"*"` for every room) and receive each new snapshot
//! version as it is written.

pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;
