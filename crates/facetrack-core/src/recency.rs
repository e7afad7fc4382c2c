//! Bounded, time-expiring set of recently seen identities.
//!
//! Presence of an id means a visit was recorded for it within the TTL, so
//! the next sighting must not write to the store again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: usize = 500;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct Entry {
    expires_at: Instant,
    /// Insertion stamp; the smallest live stamp is the eviction victim.
    stamp: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_stamp: u64,
}

impl Inner {
    fn remove(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            self.order.remove(&entry.stamp);
        }
    }

    fn prune_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.remove(&id);
        }
    }
}

/// LRU + TTL cache of identity ids. Safe to share between threads.
pub struct RecencyCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl RecencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries are plain data; a panic mid-update cannot leave them torn.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True if `id` was inserted less than one TTL ago.
    pub fn contains(&self, id: &str) -> bool {
        self.contains_at(id, Instant::now())
    }

    pub(crate) fn contains_at(&self, id: &str, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.entries.get(id).map(|e| e.expires_at > now) {
            Some(true) => true,
            Some(false) => {
                inner.remove(id);
                false
            }
            None => false,
        }
    }

    /// Insert `id`, or refresh its TTL and recency if already present.
    pub fn insert(&self, id: &str) {
        self.insert_at(id, Instant::now());
    }

    pub(crate) fn insert_at(&self, id: &str, now: Instant) {
        let mut inner = self.lock();
        inner.remove(id);
        inner.prune_expired(now);

        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            tracing::trace!(id = %oldest, "recency cache full; evicting oldest entry");
            inner.entries.remove(&oldest);
        }

        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        inner.order.insert(stamp, id.to_string());
        inner.entries.insert(
            id.to_string(),
            Entry {
                expires_at: now + self.ttl,
                stamp,
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the live entries with their remaining TTL, oldest first.
    pub fn snapshot(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .order
            .values()
            .filter_map(|id| {
                let entry = inner.entries.get(id)?;
                (entry.expires_at > now).then(|| (id.clone(), entry.expires_at - now))
            })
            .collect()
    }
}

impl Default for RecencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
