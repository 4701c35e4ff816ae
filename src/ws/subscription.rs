//! Per-connection subscription manager.
//!
//! Tracks which rooms a WebSocket client follows and filters snapshot
//! updates server-side.

use std::collections::HashSet;

use crate::domain::RoomId;

/// Parsed subscription targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    /// Explicit rooms.
    pub rooms: Vec<RoomId>,
    /// `"*"` was present.
    pub wildcard: bool,
    /// Entries that were neither a room ID nor `"*"`.
    pub invalid: Vec<String>,
}

impl RoomFilter {
    /// Splits raw IDs into rooms, the wildcard and rejects.
    #[must_use]
    pub fn parse(raw: &[String]) -> Self {
        let mut filter = Self::default();
        for s in raw {
            if s == "*" {
                filter.wildcard = true;
            } else if let Ok(room_id) = s.parse::<RoomId>() {
                filter.rooms.push(room_id);
            } else {
                filter.invalid.push(s.clone());
            }
        }
        filter
    }
}

/// Manages the set of room subscriptions for a single WebSocket connection.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// Subscribed rooms. Ignored while `subscribe_all` is set.
    room_ids: HashSet<RoomId>,
    /// Whether the client follows every room (wildcard `"*"`).
    subscribe_all: bool,
}

impl SubscriptionManager {
    /// Creates a new empty subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds rooms to the subscription set.
    pub fn subscribe(&mut self, filter: &RoomFilter) {
        if filter.wildcard {
            self.subscribe_all = true;
        }
        self.room_ids.extend(filter.rooms.iter().copied());
    }

    /// Removes rooms from the subscription set.
    pub fn unsubscribe(&mut self, filter: &RoomFilter) {
        if filter.wildcard {
            self.subscribe_all = false;
        }
        for id in &filter.rooms {
            self.room_ids.remove(id);
        }
    }

    /// Returns `true` if updates for the room should be forwarded.
    #[must_use]
    pub fn matches(&self, room_id: RoomId) -> bool {
        self.subscribe_all || self.room_ids.contains(&room_id)
    }

    /// Returns the number of explicitly subscribed rooms.
    #[must_use]
    pub fn count(&self) -> usize {
        self.room_ids.len()
    }

    /// Returns `true` if the wildcard subscription is active.
    #[must_use]
    pub fn is_subscribed_all(&self) -> bool {
        self.subscribe_all
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn filter(rooms: &[RoomId], wildcard: bool) -> RoomFilter {
        RoomFilter {
            rooms: rooms.to_vec(),
            wildcard,
            invalid: Vec::new(),
        }
    }

    #[test]
    fn empty_matches_nothing() {
        let mgr = SubscriptionManager::new();
        assert!(!mgr.matches(RoomId::new()));
    }

    #[test]
    fn subscribe_specific_room() {
        let mut mgr = SubscriptionManager::new();
        let id = RoomId::new();
        mgr.subscribe(&filter(&[id], false));
        assert!(mgr.matches(id));
        assert!(!mgr.matches(RoomId::new()));
    }

    #[test]
    fn wildcard_can_be_cleared() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(&filter(&[], true));
        assert!(mgr.matches(RoomId::new()));
        mgr.unsubscribe(&filter(&[], true));
        assert!(!mgr.is_subscribed_all());
        assert!(!mgr.matches(RoomId::new()));
    }

    #[test]
    fn unsubscribe_removes_room() {
        let mut mgr = SubscriptionManager::new();
        let id = RoomId::new();
        mgr.subscribe(&filter(&[id], false));
        mgr.unsubscribe(&filter(&[id], false));
        assert!(!mgr.matches(id));
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn parse_separates_rejects() {
        let id = RoomId::new();
        let parsed = RoomFilter::parse(&[id.to_string(), "*".to_string(), "lobby".to_string()]);
        assert_eq!(parsed.rooms, vec![id]);
        assert!(parsed.wildcard);
        assert_eq!(parsed.invalid, vec!["lobby".to_string()]);
    }
}
