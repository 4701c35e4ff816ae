//! Broadcast channel for snapshot updates.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Every snapshot
//! write publishes the new [`RoomSnapshot`] through the bus, and all
//! WebSocket connections subscribe to receive filtered updates.

use tokio::sync::broadcast;

use super::RoomSnapshot;

/// Broadcast bus for [`RoomSnapshot`] updates.
///
/// Backed by a `tokio::broadcast` channel with a configurable capacity
/// (default 10 000). When the ring buffer is full, the oldest updates are
/// dropped for lagging receivers; they catch up on the next write since
/// every message is a full snapshot.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoomSnapshot>,
}

impl EventBus {
    /// Creates a new `EventBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a snapshot to all subscribers.
    ///
    /// Returns the number of receivers that received it. With no active
    /// receivers the update is silently dropped.
    pub fn publish(&self, snapshot: RoomSnapshot) -> usize {
        self.sender.send(snapshot).unwrap_or(0)
    }

    /// Creates a new receiver for all future updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RoomSnapshot> {
        self.sender.subscribe()
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::RoomId;

    #[test]
    fn publish_without_receivers_returns_zero() {
        let bus = EventBus::new(100);
        assert_eq!(bus.publish(RoomSnapshot::stopped(RoomId::new())), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_snapshot() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        let room = RoomId::new();
        bus.publish(RoomSnapshot::stopped(room));

        let Ok(snapshot) = rx.recv().await else {
            panic!("expected to receive snapshot");
        };
        assert_eq!(snapshot.room_id, room);
    }

    #[test]
    fn receiver_count_tracks_subscribers() {
        let bus = EventBus::new(100);
        assert_eq!(bus.receiver_count(), 0);

        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        drop(rx1);
        assert_eq!(bus.receiver_count(), 1);
    }
}
