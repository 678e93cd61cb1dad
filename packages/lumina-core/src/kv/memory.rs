//! In-process fallback cache for degraded (substrate-less) operation.
//!
//! Backs the KV adapter's string operations when Redis is unavailable or was
//! never configured. Bounded LRU with per-entry TTL. Sessions and counters
//! stored here are invisible to other relay processes, which is the accepted
//! degradation.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::protocol_constants::LOCAL_CACHE_CAPACITY;
use crate::utils::normalize_key;

struct LocalEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Bounded in-process key/value cache with per-entry TTL.
///
/// Keys are normalized (trim + lowercase + whitespace collapse) so that
/// lookups derived from user input are stable.
pub(crate) struct LocalCache {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl LocalCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOCAL_CACHE_CAPACITY).expect("capacity is nonzero"),
            )),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        let key = normalize_key(key);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.expired() => {
                entries.pop(&key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub(crate) fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let key = normalize_key(key);
        self.entries.lock().put(
            key,
            LocalEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    /// Increments a counter key, applying `ttl` only when the counter hits 1.
    pub(crate) fn incr(&self, key: &str, ttl: Option<Duration>) -> u64 {
        let key = normalize_key(key);
        let mut entries = self.entries.lock();
        let current = match entries.get(&key) {
            Some(entry) if !entry.expired() => entry.value.parse::<u64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        let expires_at = if next == 1 {
            ttl.map(|d| Instant::now() + d)
        } else {
            entries.peek(&key).and_then(|e| e.expires_at)
        };
        entries.put(
            key,
            LocalEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        next
    }

    /// Refreshes the TTL on an existing key. Returns false if the key is
    /// absent or already expired.
    pub(crate) fn expire(&self, key: &str, ttl: Duration) -> bool {
        let key = normalize_key(key);
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) if !entry.expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
