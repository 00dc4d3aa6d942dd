//! Two-tier response caching with TTL
//!
//! [`ResponseCache`] keeps a fast in-memory tier in front of the durable
//! [`PersistentCache`]. Entries are keyed by `endpoint?canonical_params`
//! where the parameters are serialized as JSON with object keys sorted, so
//! equivalent parameter objects always land on the same entry.
//!
//! The memory tier stores no TTL of its own: freshness is judged against
//! the TTL the caller passes at read time.

mod persistent;
pub mod request;

pub use persistent::{PersistentCache, StoredHit, WriteOutcome};
pub use request::{CachedRequest, CachedRequestOptions, CachedResponse, Fetch, PreloadRequest, PreloadResult, Refresh};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{Clock, Timestamp, duration_millis};
use crate::config::CacheConfig;
use crate::storage::KeyValueStore;

use persistent::is_stale;

/// Response cache facade over the memory and persistent tiers
pub struct ResponseCache {
    /// Memory tier keyed by cache key
    memory: DashMap<String, MemoryEntry>,
    /// Durable tier
    persistent: PersistentCache,
    clock: Arc<dyn Clock>,
    /// Cache statistics
    stats: CacheStats,
}

/// A memory-tier entry
struct MemoryEntry {
    value: Value,
    written_at: Timestamp,
}

/// Cache statistics tracked atomically
#[derive(Debug)]
pub struct CacheStats {
    /// Reads served by either tier
    pub hits: AtomicU64,
    /// Reads that found nothing fresh
    pub misses: AtomicU64,
    /// Entries dropped from the memory tier (stale or evicted)
    pub evictions: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl ResponseCache {
    /// Create a cache over `store`
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            memory: DashMap::new(),
            persistent: PersistentCache::new(store, Arc::clone(&clock), config),
            clock,
            stats: CacheStats::new(),
        }
    }

    /// Read a fresh value for `(endpoint, params)`
    ///
    /// Returns `None` when neither tier holds a value younger than `ttl`,
    /// or when the cached value does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &Value, ttl: Duration) -> Option<T> {
        let key = Self::build_key(endpoint, params);
        Self::decode(&key, self.lookup(&key, ttl, true)?)
    }

    /// Like [`ResponseCache::get`], but an entry older than `ttl` stays in
    /// both tiers for a later, more relaxed read
    pub fn peek<T: DeserializeOwned>(&self, endpoint: &str, params: &Value, ttl: Duration) -> Option<T> {
        let key = Self::build_key(endpoint, params);
        Self::decode(&key, self.lookup(&key, ttl, false)?)
    }

    /// Read the raw JSON value stored under a full cache key
    pub fn get_value(&self, key: &str, ttl: Duration) -> Option<Value> {
        self.lookup(key, ttl, true)
    }

    fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    fn lookup(&self, key: &str, ttl: Duration, evict: bool) -> Option<Value> {
        let permanent = self.persistent.is_permanent(key);

        if let Some(entry) = self.memory.get(key) {
            if permanent || !is_stale(self.clock.now(), entry.written_at, duration_millis(ttl)) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            if evict {
                self.memory.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let hit = if evict {
            self.persistent.get(key, ttl)
        } else {
            self.persistent.peek(key, ttl)
        };
        if let Some(hit) = hit {
            debug!(key = %key, "Cache hit (persistent tier)");
            self.memory.insert(
                key.to_string(),
                MemoryEntry {
                    value: hit.value.clone(),
                    written_at: hit.written_at,
                },
            );
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit.value);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` for `(endpoint, params)` in both tiers
    pub fn set<T: Serialize + ?Sized>(&self, endpoint: &str, params: &Value, value: &T, ttl: Duration) {
        let key = Self::build_key(endpoint, params);
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode value for cache");
                return;
            }
        };

        self.memory.insert(
            key.clone(),
            MemoryEntry {
                value: value.clone(),
                written_at: self.clock.now(),
            },
        );

        let outcome = self.persistent.set(&key, &value, ttl);
        for evicted in outcome.evicted.iter().filter(|k| **k != key) {
            if self.memory.remove(evicted).is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove one entry from both tiers
    pub fn clear(&self, endpoint: &str, params: &Value) {
        let key = Self::build_key(endpoint, params);
        self.memory.remove(&key);
        self.persistent.delete(&key);
    }

    /// Remove every entry from both tiers. Returns the persistent count.
    pub fn clear_all(&self) -> usize {
        self.memory.clear();
        self.persistent.clear()
    }

    /// Keys currently held by the persistent tier
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.persistent.list_keys("");
        keys.sort();
        keys
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            size: self.memory.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Build a cache key from endpoint and parameters
    ///
    /// The key format is `{endpoint}?{canonical_params}`; `Null` params are
    /// treated as the empty object.
    #[must_use]
    pub fn build_key(endpoint: &str, params: &Value) -> String {
        format!("{endpoint}?{}", canonical_json(params))
    }
}

/// Serialize JSON with object keys sorted at every depth
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Null => out.push_str("{}"),
        other => write_canonical(other, &mut out),
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total memory-tier evictions
    pub evictions: u64,
    /// Current number of memory-tier entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        cache: ResponseCache,
    }

    fn fixture(max_entries: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            max_entries,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            &config,
        );
        Fixture { store, clock, cache }
    }

    #[test]
    fn test_round_trip() {
        let f = fixture(50);
        let value = json!({"name": "test", "value": 123, "tags": [1, 2]});
        let ttl = Duration::from_secs(60);

        f.cache.set("/api/test", &json!({"id": 1}), &value, ttl);
        let cached: Value = f.cache.get("/api/test", &json!({"id": 1}), ttl).unwrap();

        assert_eq!(cached, value);
    }

    #[test]
    fn test_miss_returns_none() {
        let f = fixture(50);
        let cached: Option<Value> = f.cache.get("/api/nonexistent", &json!({}), Duration::from_secs(60));
        assert!(cached.is_none());
        assert_eq!(f.cache.stats().misses, 1);
    }

    #[test]
    fn test_params_are_independent_entries() {
        let f = fixture(50);
        let ttl = Duration::from_secs(60);
        f.cache.set("/api/test", &json!({"id": 1}), &json!(1), ttl);
        f.cache.set("/api/test", &json!({"id": 2}), &json!(2), ttl);

        assert_eq!(f.cache.get::<i64>("/api/test", &json!({"id": 1}), ttl), Some(1));
        assert_eq!(f.cache.get::<i64>("/api/test", &json!({"id": 2}), ttl), Some(2));
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = ResponseCache::build_key("/todo", &json!({"page": 1, "pageSize": 20, "f": {"y": 1, "x": 2}}));
        let b = ResponseCache::build_key("/todo", &json!({"f": {"x": 2, "y": 1}, "pageSize": 20, "page": 1}));
        assert_eq!(a, b);
        assert_eq!(a, r#"/todo?{"f":{"x":2,"y":1},"page":1,"pageSize":20}"#);
    }

    #[test]
    fn test_empty_params_key_matches_permanent_list() {
        assert_eq!(ResponseCache::build_key("/todo/stats", &json!({})), "/todo/stats?{}");
        assert_eq!(ResponseCache::build_key("/config", &Value::Null), "/config?{}");
    }

    #[test]
    fn test_ttl_boundary_across_tiers() {
        let f = fixture(50);
        let ttl = Duration::from_millis(5000);
        f.cache.set("/todo", &json!({}), &json!(["a"]), ttl);

        f.clock.set(4999);
        assert_eq!(f.cache.get::<Value>("/todo", &json!({}), ttl), Some(json!(["a"])));

        f.clock.set(5001);
        assert_eq!(f.cache.get::<Value>("/todo", &json!({}), ttl), None);
        assert!(f.store.get_item("hijot-api-cache-/todo?{}").is_none());
    }

    #[test]
    fn test_peek_keeps_entry_for_relaxed_read() {
        let f = fixture(50);
        let ttl = Duration::from_secs(60);
        f.cache.set("/todo", &json!({}), &json!(["a"]), ttl);
        f.clock.advance(Duration::from_secs(90));

        assert_eq!(f.cache.peek::<Value>("/todo", &json!({}), ttl), None);
        assert!(f.store.get_item("hijot-api-cache-/todo?{}").is_some());
        assert_eq!(f.cache.stats().size, 1);

        assert_eq!(f.cache.get::<Value>("/todo", &json!({}), ttl * 2), Some(json!(["a"])));
        assert_eq!(f.cache.get::<Value>("/todo", &json!({}), ttl), None);
        assert_eq!(f.cache.get::<Value>("/todo", &json!({}), ttl * 2), None);
    }

    #[test]
    fn test_memory_tier_populated_from_persistent() {
        let f = fixture(50);
        let ttl = Duration::from_secs(60);
        f.cache.set("/todo", &json!({}), &json!([1]), ttl);

        // Fresh facade over the same store simulates a restart.
        let restarted = ResponseCache::new(
            Arc::clone(&f.store) as Arc<dyn KeyValueStore>,
            Arc::clone(&f.clock) as Arc<dyn Clock>,
            &CacheConfig::default(),
        );
        assert_eq!(restarted.stats().size, 0);
        assert_eq!(restarted.get::<Value>("/todo", &json!({}), ttl), Some(json!([1])));
        assert_eq!(restarted.stats().size, 1);

        // Read-through keeps the original write time.
        f.clock.advance(Duration::from_secs(61));
        assert_eq!(restarted.get::<Value>("/todo", &json!({}), ttl), None);
    }

    #[test]
    fn test_permanent_key_survives_any_elapsed_time() {
        let f = fixture(50);
        f.cache.set("/todo/stats", &json!({}), &json!({"overdue": 1, "pending": 3}), Duration::from_millis(10));

        f.clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert_eq!(
            f.cache.get::<Value>("/todo/stats", &json!({}), Duration::from_millis(10)),
            Some(json!({"overdue": 1, "pending": 3}))
        );
    }

    #[test]
    fn test_eviction_is_visible_through_facade() {
        let f = fixture(3);
        let ttl = Duration::from_secs(60);
        for (i, endpoint) in ["/k1", "/k2", "/k3", "/k4"].iter().enumerate() {
            f.cache.set(endpoint, &json!({}), &json!(i), ttl);
            f.clock.advance(Duration::from_millis(5));
        }

        assert_eq!(f.cache.get::<Value>("/k1", &json!({}), ttl), None);
        for endpoint in ["/k2", "/k3", "/k4"] {
            assert!(f.cache.get::<Value>(endpoint, &json!({}), ttl).is_some());
        }
    }

    #[test]
    fn test_clear_and_clear_all() {
        let f = fixture(50);
        let ttl = Duration::from_secs(60);
        f.cache.set("/api/test1", &json!({}), &json!(1), ttl);
        f.cache.set("/api/test2", &json!({}), &json!(2), ttl);
        f.cache.set("/api/test3", &json!({"id": 1}), &json!(3), ttl);

        f.cache.clear("/api/test1", &json!({}));
        assert_eq!(f.cache.get::<i64>("/api/test1", &json!({}), ttl), None);
        assert_eq!(f.cache.get::<i64>("/api/test2", &json!({}), ttl), Some(2));

        assert_eq!(f.cache.clear_all(), 2);
        assert_eq!(f.cache.get::<i64>("/api/test2", &json!({}), ttl), None);
        assert!(f.cache.keys().is_empty());
    }

    #[test]
    fn test_shape_mismatch_is_a_miss() {
        let f = fixture(50);
        let ttl = Duration::from_secs(60);
        f.cache.set("/api/test", &json!({}), &json!("text"), ttl);
        assert_eq!(f.cache.get::<Vec<i64>>("/api/test", &json!({}), ttl), None);
    }

    #[test]
    fn test_hit_rate() {
        let f = fixture(50);
        let ttl = Duration::from_secs(60);
        f.cache.set("/a", &json!({}), &json!(1), ttl);
        f.cache.set("/b", &json!({}), &json!(2), ttl);

        f.cache.get::<i64>("/a", &json!({}), ttl);
        f.cache.get::<i64>("/b", &json!({}), ttl);
        f.cache.get::<i64>("/c", &json!({}), ttl);

        let stats = f.cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.666).abs() < 0.01);
    }
}
