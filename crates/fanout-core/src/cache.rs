// ── TTL cache ──
//
// Last-known values per key. An entry is absent once its age exceeds the
// ttl and stale once it exceeds half of it. Expired entries are evicted
// lazily on `get`/`lookup`; nothing sweeps proactively.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }

    fn is_absent(&self, now: Instant) -> bool {
        self.age(now) > self.ttl
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.age(now) > self.ttl / 2
    }
}

/// Result of a staleness-aware read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Fresh(V),
    /// Still servable, but the caller should refresh it.
    Stale(V),
    Missing,
}

impl<V> Lookup<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Fresh(v) | Self::Stale(v) => Some(v),
            Self::Missing => None,
        }
    }
}

#[derive(Debug)]
pub struct DataCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, CacheEntry<V>>,
}

impl<K, V> Default for DataCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> DataCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, or `None` once the entry has outlived its ttl.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key).into_value()
    }

    pub fn lookup(&self, key: &K) -> Lookup<V> {
        let now = Instant::now();
        {
            let Some(entry) = self.entries.get(key) else {
                return Lookup::Missing;
            };
            if !entry.is_absent(now) {
                return if entry.is_stale(now) {
                    Lookup::Stale(entry.value.clone())
                } else {
                    Lookup::Fresh(entry.value.clone())
                };
            }
        }
        // Re-check under the write lock: a concurrent `set` may have landed.
        self.entries.remove_if(key, |_, e| e.is_absent(now));
        Lookup::Missing
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Whether the entry is past half its ttl. Missing and expired keys
    /// report stale. Never evicts.
    pub fn is_stale(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_none_or(|e| e.is_stale(now))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Remove `key` only while its stored value satisfies `pred`.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> bool {
        self.entries.remove_if(key, |_, e| pred(&e.value)).is_some()
    }

    /// Drop every key matching `pred`.
    pub fn remove_where(&self, mut pred: impl FnMut(&K) -> bool) {
        self.entries.retain(|k, _| !pred(k));
    }

    /// Stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
