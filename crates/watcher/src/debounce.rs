//! Per-key debouncing
//!
//! Absorbs the bursts of raw notifications a single logical write produces.
//! Scheduling a key that is already pending replaces both the item and the
//! deadline, so only the latest item for a key is ever released.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Default debounce window
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Pending<T> {
    deadline: Instant,
    item: T,
}

/// Pending items keyed by `K`, each with its own deadline
#[derive(Debug)]
pub struct Debouncer<K, T> {
    pending: HashMap<K, Pending<T>>,
    delay: Duration,
}

impl<K, T> Debouncer<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule with the default delay, cancelling any pending item for `key`
    pub fn schedule(&mut self, key: K, item: T) {
        self.schedule_at(key, item, Instant::now());
    }

    /// Schedule relative to `now`
    pub fn schedule_at(&mut self, key: K, item: T, now: Instant) {
        self.schedule_after(key, item, now, self.delay);
    }

    /// Schedule with an explicit delay
    pub fn schedule_after(&mut self, key: K, item: T, now: Instant, delay: Duration) {
        self.pending.insert(
            key,
            Pending {
                deadline: now + delay,
                item,
            },
        );
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Drop a pending item without releasing it
    pub fn cancel(&mut self, key: &K) -> Option<T> {
        self.pending.remove(key).map(|p| p.item)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Release every item whose deadline has passed, earliest first
    pub fn take_ready(&mut self, now: Instant) -> Vec<T> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut ready: Vec<Pending<T>> = due
            .iter()
            .filter_map(|k| self.pending.remove(k))
            .collect();
        ready.sort_by_key(|p| p.deadline);
        ready.into_iter().map(|p| p.item).collect()
    }

    /// Cancel everything
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_rapid_schedules_coalesce() {
        let mut debouncer = Debouncer::new(100 * MS);
        let start = Instant::now();

        for i in 0..5u32 {
            debouncer.schedule_at("change:file_1", i, start + i * 10 * MS);
        }

        // 100ms after the first write, the window restarted on every write
        assert!(debouncer.take_ready(start + 100 * MS).is_empty());
        assert_eq!(debouncer.pending_count(), 1);

        let ready = debouncer.take_ready(start + 140 * MS);
        assert_eq!(ready, vec![4]);
        assert!(!debouncer.has_pending());
    }

    #[test]
    fn test_keys_are_independent() {
        let mut debouncer = Debouncer::new(50 * MS);
        let start = Instant::now();

        debouncer.schedule_at("add:a", "a", start);
        debouncer.schedule_at("change:b", "b", start + 30 * MS);

        assert_eq!(debouncer.next_deadline(), Some(start + 50 * MS));
        assert_eq!(debouncer.take_ready(start + 55 * MS), vec!["a"]);
        assert!(debouncer.is_pending(&"change:b"));
        assert_eq!(debouncer.take_ready(start + 80 * MS), vec!["b"]);
    }

    #[test]
    fn test_release_order_follows_deadlines() {
        let mut debouncer = Debouncer::new(10 * MS);
        let start = Instant::now();

        debouncer.schedule_at(3, "third", start + 2 * MS);
        debouncer.schedule_at(1, "first", start);
        debouncer.schedule_at(2, "second", start + MS);

        assert_eq!(
            debouncer.take_ready(start + 20 * MS),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn test_cancel() {
        let mut debouncer = Debouncer::new(10 * MS);
        let start = Instant::now();
        debouncer.schedule_at("a", 1, start);
        debouncer.schedule_at("b", 2, start);

        assert_eq!(debouncer.cancel(&"a"), Some(1));
        debouncer.cancel_all();
        assert!(debouncer.take_ready(start + 20 * MS).is_empty());
        assert_eq!(debouncer.next_deadline(), None);
    }
}
