//! Deadline queue with per-key deduplication.
//!
//! Each key carries a single `not_before` deadline; re-enqueueing an
//! existing key keeps the **earliest** deadline. The heap is pruned lazily:
//! superseded entries are dropped when they surface at the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

/// A deduplicating deadline queue.
///
/// Not thread-safe on its own; the goal-state driver wraps it in a mutex.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    /// Authoritative deadline per key.
    deadlines: HashMap<K, Instant>,
    /// Min-heap of (deadline, key); may contain superseded entries.
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K> Default for DeadlineQueue<K>
where
    K: Clone + Eq + Hash + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DeadlineQueue<K>
where
    K: Clone + Eq + Hash + Ord,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Enqueues `key` to surface at `not_before`; the earliest deadline wins
    /// when the key is already queued.
    ///
    /// Returns true when the effective deadline changed.
    pub fn enqueue(&mut self, key: K, not_before: Instant) -> bool {
        match self.deadlines.get(&key) {
            Some(&existing) if existing <= not_before => false,
            _ => {
                self.deadlines.insert(key.clone(), not_before);
                self.heap.push(Reverse((not_before, key)));
                true
            }
        }
    }

    /// Removes and returns a key whose deadline has passed, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        self.prune();
        let Reverse((deadline, _)) = self.heap.peek()?;
        if *deadline > now {
            return None;
        }
        let Reverse((_, key)) = self.heap.pop()?;
        self.deadlines.remove(&key);
        Some(key)
    }

    /// The earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Number of queued keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Returns true when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Drops everything, e.g. on leader loss.
    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.heap.clear();
    }

    /// Drops heap entries that no longer match the authoritative deadline.
    fn prune(&mut self) {
        while let Some(Reverse((deadline, key))) = self.heap.peek() {
            match self.deadlines.get(key) {
                Some(live) if live == deadline => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earliest_deadline_wins() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();

        assert!(queue.enqueue("a", now + Duration::from_secs(10)));
        assert!(queue.enqueue("a", now + Duration::from_secs(1)));
        // Later deadline for a queued key is ignored.
        assert!(!queue.enqueue("a", now + Duration::from_secs(20)));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn pop_respects_not_before() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();

        queue.enqueue("later", now + Duration::from_secs(60));
        queue.enqueue("due", now);

        assert_eq!(queue.pop_due(now), Some("due"));
        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_orders_by_deadline() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();

        queue.enqueue("second", now + Duration::from_millis(2));
        queue.enqueue("first", now + Duration::from_millis(1));
        queue.enqueue("third", now + Duration::from_millis(3));

        let later = now + Duration::from_secs(1);
        assert_eq!(queue.pop_due(later), Some("first"));
        assert_eq!(queue.pop_due(later), Some("second"));
        assert_eq!(queue.pop_due(later), Some("third"));
        assert!(queue.is_empty());
    }

    #[test]
    fn superseded_entries_are_pruned() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();

        queue.enqueue("a", now + Duration::from_secs(10));
        queue.enqueue("a", now);

        assert_eq!(queue.pop_due(now), Some("a"));
        // The stale 10s entry must not resurface.
        assert_eq!(queue.pop_due(now + Duration::from_secs(60)), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.enqueue("a", now);
        queue.enqueue("b", now);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_due(now), None);
    }
}
