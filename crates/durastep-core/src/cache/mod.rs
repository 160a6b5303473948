//! Step cache: memoizes keyed step outcomes for the lifetime of a run (or
//! longer, when the cache is shared across runs).
//!
//! Concurrent steps that share a key are last-write-wins; there is no per-key
//! locking.

pub mod encoding;

use std::time::{Duration, Instant};

use dashmap::DashMap;

use durastep_types::step::CacheEntry;

/// Storage for keyed step outcomes.
pub trait StepCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store an entry. `ttl` overrides any cache-wide TTL.
    fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>);

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn delete(&self, key: &str) -> bool;

    fn clear(&self);
}

#[derive(Debug, Clone)]
struct Stored {
    entry: CacheEntry,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process [`StepCache`] backed by a `DashMap`, with optional expiry.
#[derive(Debug, Default)]
pub struct InMemoryStepCache {
    entries: DashMap<String, Stored>,
    default_ttl: Option<Duration>,
}

impl InMemoryStepCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry expires after `ttl` unless `set` passes its own.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: Some(ttl),
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unexpired keys in arbitrary order.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect()
    }
}

impl StepCache for InMemoryStepCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let stored = self.entries.get(key)?;
        if stored.is_expired(now) {
            drop(stored);
            self.entries.remove(key);
            return None;
        }
        Some(stored.entry.clone())
    }

    fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>) {
        let expires_at = ttl.or(self.default_ttl).map(|d| Instant::now() + d);
        self.entries
            .insert(key.to_string(), Stored { entry, expires_at });
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}
