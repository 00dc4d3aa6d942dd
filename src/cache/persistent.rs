//! Persistent cache tier
//!
//! Wraps a [`KeyValueStore`] with TTL metadata. Every entry is stored under
//! `<storage_prefix><cache key>` as `{ data, timestamp, ttl }`. Keys on the
//! permanent allow-list never expire and are never evicted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::Error;
use crate::clock::{Clock, Timestamp, duration_millis};
use crate::config::CacheConfig;
use crate::storage::KeyValueStore;

/// Entry layout in the durable store
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    data: Value,
    timestamp: Timestamp,
    /// TTL in force when the entry was written (milliseconds)
    ttl: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: Timestamp) -> bool {
        is_stale(now, self.timestamp, i64::try_from(self.ttl).unwrap_or(i64::MAX))
    }
}

/// `true` once more than `ttl_ms` has elapsed since `written_at`
pub(crate) fn is_stale(now: Timestamp, written_at: Timestamp, ttl_ms: i64) -> bool {
    now.saturating_sub(written_at) > ttl_ms
}

/// A fresh value read from the persistent tier
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHit {
    /// Cached value
    pub value: Value,
    /// When the value was written (epoch millis)
    pub written_at: Timestamp,
}

/// Result of a write
#[derive(Debug, Default, Clone)]
pub struct WriteOutcome {
    /// Whether the value reached durable storage
    pub stored: bool,
    /// Cache keys deleted by the eviction passes this write triggered
    pub evicted: Vec<String>,
}

/// TTL-aware cache over a durable key-value store
pub struct PersistentCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    permanent_keys: HashSet<String>,
    max_entries: usize,
}

impl PersistentCache {
    /// Create a cache tier over `store`
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            store,
            clock,
            prefix: config.storage_prefix.clone(),
            permanent_keys: config.permanent_keys.iter().cloned().collect(),
            max_entries: config.max_entries,
        }
    }

    /// Whether `key` is on the permanent allow-list
    #[must_use]
    pub fn is_permanent(&self, key: &str) -> bool {
        self.permanent_keys.contains(key)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Read `key` if it is younger than `ttl`
    ///
    /// The TTL is the caller's, not the one recorded at write time. A stale
    /// or unparseable non-permanent entry is deleted as a side effect.
    pub fn get(&self, key: &str, ttl: Duration) -> Option<StoredHit> {
        self.read(key, ttl, true)
    }

    /// Read `key` if it is younger than `ttl`, leaving stale entries in place
    ///
    /// A later read with a more relaxed TTL can still find what this one
    /// rejected.
    pub fn peek(&self, key: &str, ttl: Duration) -> Option<StoredHit> {
        self.read(key, ttl, false)
    }

    fn read(&self, key: &str, ttl: Duration, evict: bool) -> Option<StoredHit> {
        let storage_key = self.storage_key(key);
        let raw = self.store.get_item(&storage_key)?;
        let permanent = self.is_permanent(key);

        let entry: StoredEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable cache entry");
                if !permanent {
                    self.store.remove_item(&storage_key);
                }
                return None;
            }
        };

        if !permanent && is_stale(self.clock.now(), entry.timestamp, duration_millis(ttl)) {
            if evict {
                debug!(key = %key, "Persistent cache entry expired");
                self.store.remove_item(&storage_key);
            }
            return None;
        }

        Some(StoredHit {
            value: entry.data,
            written_at: entry.timestamp,
        })
    }

    /// Write `value` under `key`
    ///
    /// A quota failure triggers one expired-entry eviction pass and a single
    /// retry. A second failure is logged and the value is simply not cached.
    /// Every successful write is followed by a cleanup pass.
    pub fn set(&self, key: &str, value: &Value, ttl: Duration) -> WriteOutcome {
        let entry = StoredEntry {
            data: value.clone(),
            timestamp: self.clock.now(),
            ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache entry");
                return WriteOutcome::default();
            }
        };

        let storage_key = self.storage_key(key);
        let mut evicted = Vec::new();

        match self.store.set_item(&storage_key, &raw) {
            Ok(()) => {}
            Err(Error::QuotaExceeded(reason)) => {
                debug!(key = %key, %reason, "Storage full, evicting expired entries");
                evicted = self.sweep(false);
                if let Err(e) = self.store.set_item(&storage_key, &raw) {
                    warn!(key = %key, error = %e, "Cache write failed after eviction");
                    return WriteOutcome {
                        stored: false,
                        evicted,
                    };
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache write failed");
                return WriteOutcome::default();
            }
        }

        evicted.extend(self.cleanup());
        WriteOutcome {
            stored: true,
            evicted,
        }
    }

    /// Delete `key`
    pub fn delete(&self, key: &str) {
        self.store.remove_item(&self.storage_key(key));
    }

    /// Cache keys (without the storage prefix) that start with `prefix`
    #[must_use]
    pub fn list_keys(&self, prefix: &str) -> Vec<String> {
        self.store
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    /// Delete every cached entry, permanent ones included. Returns the count.
    pub fn clear(&self) -> usize {
        let keys = self.list_keys("");
        for key in &keys {
            self.delete(key);
        }
        keys.len()
    }

    /// Drop expired and corrupt entries, then the oldest entries beyond
    /// `max_entries`. Permanent keys are never touched.
    pub fn cleanup(&self) -> Vec<String> {
        self.sweep(true)
    }

    fn sweep(&self, enforce_capacity: bool) -> Vec<String> {
        let now = self.clock.now();
        let mut evicted = Vec::new();
        let mut live: Vec<(Timestamp, String)> = Vec::new();

        for key in self.list_keys("") {
            if self.is_permanent(&key) {
                continue;
            }
            let Some(raw) = self.store.get_item(&self.storage_key(&key)) else {
                continue;
            };
            match serde_json::from_str::<StoredEntry>(&raw) {
                Ok(entry) if !entry.is_expired(now) => live.push((entry.timestamp, key)),
                Ok(_) | Err(_) => {
                    self.delete(&key);
                    evicted.push(key);
                }
            }
        }

        if enforce_capacity && live.len() > self.max_entries {
            live.sort();
            let excess = live.len() - self.max_entries;
            for (_, key) in live.drain(..excess) {
                self.delete(&key);
                evicted.push(key);
            }
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted cache entries");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            ..CacheConfig::default()
        }
    }

    fn cache_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>, max: usize) -> PersistentCache {
        PersistentCache::new(store, clock, &config(max))
    }

    #[test]
    fn test_ttl_boundary_deletes_stale_entry() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock), 50);
        let ttl = Duration::from_millis(5000);

        assert!(cache.set("/todo?{}", &json!([1]), ttl).stored);

        clock.set(4999);
        assert_eq!(cache.get("/todo?{}", ttl).unwrap().value, json!([1]));

        clock.set(5001);
        assert!(cache.get("/todo?{}", ttl).is_none());
        assert!(store.get_item("hijot-api-cache-/todo?{}").is_none());
    }

    #[test]
    fn test_peek_leaves_stale_entry() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock), 50);
        let ttl = Duration::from_secs(60);

        cache.set("/todo?{}", &json!([1]), ttl);
        clock.advance(Duration::from_secs(90));

        assert!(cache.peek("/todo?{}", ttl).is_none());
        assert!(store.get_item("hijot-api-cache-/todo?{}").is_some());
        assert_eq!(cache.peek("/todo?{}", ttl * 2).unwrap().value, json!([1]));
    }

    #[test]
    fn test_caller_ttl_overrides_written_ttl() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, Arc::clone(&clock), 50);

        cache.set("k", &json!(1), Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));
        // A more relaxed read TTL still finds the entry.
        assert!(cache.get("k", Duration::from_secs(10)).is_some());
    }

    #[test]
    fn test_permanent_key_never_expires() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, Arc::clone(&clock), 50);

        cache.set("/todo/stats?{}", &json!({"pending": 2}), Duration::from_millis(1));
        clock.advance(Duration::from_secs(365 * 24 * 3600));

        let hit = cache.get("/todo/stats?{}", Duration::from_millis(1)).unwrap();
        assert_eq!(hit.value, json!({"pending": 2}));
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, Arc::clone(&clock), 3);
        let ttl = Duration::from_secs(60);

        let mut evicted = Vec::new();
        for key in ["a", "b", "c", "d"] {
            evicted.extend(cache.set(key, &json!(key), ttl).evicted);
            clock.advance(Duration::from_millis(10));
        }

        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(cache.get("a", ttl).is_none());
        for key in ["b", "c", "d"] {
            assert!(cache.get(key, ttl).is_some(), "{key} should remain");
        }
    }

    #[test]
    fn test_permanent_entries_do_not_count_toward_capacity() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, Arc::clone(&clock), 1);
        let ttl = Duration::from_secs(60);

        cache.set("/config?{}", &json!({}), ttl);
        clock.advance(Duration::from_millis(1));
        cache.set("x", &json!(1), ttl);

        assert!(cache.get("/config?{}", ttl).is_some());
        assert!(cache.get("x", ttl).is_some());
    }

    #[test]
    fn test_cleanup_removes_corrupt_entries() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        store.set_item("hijot-api-cache-broken", "not json").unwrap();
        store.set_item("unrelated", "kept").unwrap();
        let cache = cache_with(Arc::clone(&store), clock, 50);

        let evicted = cache.cleanup();

        assert_eq!(evicted, vec!["broken".to_string()]);
        assert_eq!(store.get_item("unrelated").as_deref(), Some("kept"));
    }

    #[test]
    fn test_quota_failure_evicts_expired_then_retries() {
        let store = Arc::new(MemoryStore::with_quota(100));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock), 50);

        assert!(cache.set("/a?{}", &json!("x"), Duration::from_secs(1)).stored);
        clock.set(2000);

        let outcome = cache.set("/b?{}", &json!("x"), Duration::from_secs(1));
        assert!(outcome.stored);
        assert!(outcome.evicted.contains(&"/a?{}".to_string()));
        assert!(cache.get("/b?{}", Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_second_quota_failure_is_not_fatal() {
        let store = Arc::new(MemoryStore::with_quota(30));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, clock, 50);

        let outcome = cache.set("/big?{}", &json!("payload"), Duration::from_secs(60));
        assert!(!outcome.stored);
        assert!(cache.get("/big?{}", Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_list_keys_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        store.set_item("hijot-reminded-ids", "[]").unwrap();
        let cache = cache_with(Arc::clone(&store), clock, 50);
        let ttl = Duration::from_secs(60);

        cache.set("/todo?{}", &json!([]), ttl);
        cache.set("/todo/stats?{}", &json!({}), ttl);
        cache.set("/config?{}", &json!({}), ttl);

        let mut todo_keys = cache.list_keys("/todo");
        todo_keys.sort();
        assert_eq!(todo_keys, vec!["/todo/stats?{}", "/todo?{}"]);

        assert_eq!(cache.clear(), 3);
        assert!(cache.list_keys("").is_empty());
        assert_eq!(store.get_item("hijot-reminded-ids").as_deref(), Some("[]"));
    }
}
