//! A bounded, time-based deduplication set.
//!
//! Used by the webhook receiver (provider event ids, 24 h retention) and the
//! order updater (per-activity keys). Entries expire after the configured
//! retention; expired entries are pruned opportunistically on insert so no
//! background task is needed.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Prune at most once per this many inserts.
const PRUNE_EVERY: usize = 1024;

/// Concurrent first-seen set with per-entry expiry.
#[derive(Debug)]
pub struct DedupSet {
    seen: DashMap<String, Instant>,
    retention: Duration,
    inserts: AtomicUsize,
}

impl DedupSet {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            retention,
            inserts: AtomicUsize::new(0),
        }
    }

    /// Record `key`; returns `true` if this is the first (non-expired)
    /// sighting.
    ///
    /// Concurrent callers racing on the same key observe exactly one `true`:
    /// the entry API locks the shard for the duration of the check-and-set.
    pub fn insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let fresh = match self.seen.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) > self.retention {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };
        if self.inserts.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }
        fresh
    }

    /// Whether `key` has been seen within the retention window.
    pub fn contains(&self, key: &str) -> bool {
        match self.seen.get(key) {
            Some(entry) => entry.elapsed() <= self.retention,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&self, now: Instant) {
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) <= self.retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_insert_wins() {
        let set = DedupSet::new(Duration::from_secs(60));
        assert!(set.insert("whevt_1"));
        assert!(!set.insert("whevt_1"));
        assert!(set.insert("whevt_2"));
        assert!(set.contains("whevt_1"));
        assert!(!set.contains("whevt_3"));
    }

    #[test]
    fn entries_expire_after_retention() {
        let set = DedupSet::new(Duration::from_millis(10));
        assert!(set.insert("whevt_1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(!set.contains("whevt_1"));
        assert!(set.insert("whevt_1"));
    }

    #[test]
    fn concurrent_inserts_admit_exactly_one() {
        let set = Arc::new(DedupSet::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let set = Arc::clone(&set);
            handles.push(std::thread::spawn(move || set.insert("same-key")));
        }
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked"))
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(admitted, 1);
    }
}
