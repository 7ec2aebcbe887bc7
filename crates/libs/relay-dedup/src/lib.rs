//! Recent-history dedup ring.
//!
//! The one place in the core that needs a true shared-mutex critical
//! section: it's O(1) and never held across an `.await`, so a plain
//! [`std::sync::Mutex`] is the right tool rather than anything
//! async-aware.

use relay_types::{ContentHash, DEDUP_CAPACITY};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Fresh,
    Duplicate,
}

struct Ring {
    order: VecDeque<ContentHash>,
    members: HashSet<ContentHash>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Ring { order: VecDeque::with_capacity(capacity), members: HashSet::with_capacity(capacity), capacity }
    }

    fn observe(&mut self, hash: ContentHash) -> Observation {
        if self.members.contains(&hash) {
            return Observation::Duplicate;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(hash);
        self.members.insert(hash);
        Observation::Fresh
    }
}

/// Suppresses a packet seen (on either egress or ingress) within the
/// recent window. Shared across tasks behind an `Arc`.
pub struct DedupRing {
    ring: Mutex<Ring>,
}

impl DedupRing {
    pub fn new() -> Self {
        Self::with_capacity(DEDUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        DedupRing { ring: Mutex::new(Ring::new(capacity)) }
    }

    /// Membership test precedes insertion: a `Fresh` return guarantees the
    /// hash was not present and is now present, atomically with respect to
    /// concurrent callers.
    pub fn observe(&self, hash: ContentHash) -> Observation {
        let mut ring = self.ring.lock().expect("dedup ring mutex poisoned");
        ring.observe(hash)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("dedup ring mutex poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn hash(byte: u8) -> ContentHash {
        ContentHash([byte; 16])
    }

    #[test]
    fn first_observation_is_fresh_second_is_duplicate() {
        let ring = DedupRing::new();
        assert_eq!(ring.observe(hash(1)), Observation::Fresh);
        assert_eq!(ring.observe(hash(1)), Observation::Duplicate);
    }

    #[test]
    fn eviction_is_fifo_once_full() {
        let ring = DedupRing::with_capacity(2);
        assert_eq!(ring.observe(hash(1)), Observation::Fresh);
        assert_eq!(ring.observe(hash(2)), Observation::Fresh);
        // Capacity 2 is full; inserting a third evicts hash(1).
        assert_eq!(ring.observe(hash(3)), Observation::Fresh);
        assert_eq!(ring.observe(hash(1)), Observation::Fresh);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn concurrent_observers_see_exactly_one_fresh() {
        let ring = Arc::new(DedupRing::new());
        let target = hash(42);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ring = ring.clone();
                thread::spawn(move || ring.observe(target))
            })
            .collect();
        let fresh_count = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread join"))
            .filter(|observation| *observation == Observation::Fresh)
            .count();
        assert_eq!(fresh_count, 1);
    }
}
