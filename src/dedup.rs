//! Short-lived "seen" set over event signatures.
//!
//! Absorbs channel retransmits after a reconnect and echo-backs of locally
//! originated optimistic writes. The TTL stays short so a legitimate rapid
//! second event for the same entity (confirm then mark-present) is not
//! suppressed.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::clock::WallClock;
use crate::model::EventKey;

pub struct EventDeduplicator {
    ttl_ms: u64,
    capacity: usize,
    // Insertion order doubles as time order; an entry lives in `by_key`
    // exactly while it lives in `queue`.
    queue: VecDeque<(EventKey, WallClock)>,
    by_key: HashMap<EventKey, WallClock>,
}

impl EventDeduplicator {
    pub fn new(ttl_ms: u64, capacity: usize) -> Self {
        Self {
            ttl_ms,
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            by_key: HashMap::new(),
        }
    }

    /// True exactly once per TTL window per key. Expired entries are purged
    /// opportunistically here; no timer thread.
    pub fn should_process(&mut self, key: &EventKey, now: WallClock) -> bool {
        self.purge(now);

        if self.by_key.contains_key(key) {
            debug!(event = %key, "duplicate event dropped");
            return false;
        }

        while self.queue.len() >= self.capacity {
            if let Some((evicted, _)) = self.queue.pop_front() {
                self.by_key.remove(&evicted);
            }
        }

        self.queue.push_back((key.clone(), now));
        self.by_key.insert(key.clone(), now);
        true
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.by_key.clear();
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn purge(&mut self, now: WallClock) {
        while let Some((key, seen)) = self.queue.front() {
            if now.millis_since(*seen) < self.ttl_ms {
                break;
            }
            self.by_key.remove(key);
            self.queue.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, EventAction};

    fn key(id: &str) -> EventKey {
        EventKey {
            entity: EntityKind::Ticket,
            action: EventAction::Created,
            id: id.to_string(),
        }
    }

    #[test]
    fn processes_exactly_once_within_window() {
        let mut dedup = EventDeduplicator::new(5_000, 16);
        let now = WallClock(1_000);
        assert!(dedup.should_process(&key("7"), now));
        assert!(!dedup.should_process(&key("7"), now));
        assert!(!dedup.should_process(&key("7"), WallClock(4_999)));
    }

    #[test]
    fn reprocesses_after_ttl() {
        let mut dedup = EventDeduplicator::new(5_000, 16);
        assert!(dedup.should_process(&key("7"), WallClock(1_000)));
        assert!(dedup.should_process(&key("7"), WallClock(6_000)));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let mut dedup = EventDeduplicator::new(5_000, 16);
        let now = WallClock(0);
        assert!(dedup.should_process(&key("1"), now));
        assert!(dedup.should_process(&key("2"), now));
        let updated = EventKey {
            entity: EntityKind::Ticket,
            action: EventAction::Updated,
            id: "1".to_string(),
        };
        assert!(dedup.should_process(&updated, now));
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let mut dedup = EventDeduplicator::new(60_000, 2);
        let now = WallClock(0);
        assert!(dedup.should_process(&key("1"), now));
        assert!(dedup.should_process(&key("2"), now));
        assert!(dedup.should_process(&key("3"), now));
        assert_eq!(dedup.len(), 2);
        // Oldest was evicted, so it is processable again.
        assert!(dedup.should_process(&key("1"), now));
    }

    #[test]
    fn clear_resets_the_window() {
        let mut dedup = EventDeduplicator::new(5_000, 16);
        let now = WallClock(0);
        assert!(dedup.should_process(&key("7"), now));
        dedup.clear();
        assert!(dedup.is_empty());
        assert!(dedup.should_process(&key("7"), now));
    }
}
