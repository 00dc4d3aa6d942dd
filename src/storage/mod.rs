//! Durable, synchronous string-keyed storage
//!
//! The persistent cache tier, the local notified set and the notification
//! preference all live in one [`KeyValueStore`], separated by key prefix.
//! Writes are size-accounted against an optional byte quota so a full store
//! fails with [`Error::QuotaExceeded`] instead of growing without bound.

mod file;

pub use file::FileStore;

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{Error, Result};

/// Synchronous string key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get_item(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// Fails with [`Error::QuotaExceeded`] when the write would exceed the
    /// store's capacity.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing an absent key is a no-op
    fn remove_item(&self, key: &str);

    /// Snapshot of every key currently stored
    fn keys(&self) -> Vec<String>;
}

/// Bytes a key-value pair occupies for quota accounting
fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// Reject a write that would push `items` past `quota` bytes
fn check_quota(
    items: &BTreeMap<String, String>,
    key: &str,
    value: &str,
    quota: Option<usize>,
) -> Result<()> {
    let Some(quota) = quota else {
        return Ok(());
    };

    let used: usize = items
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| entry_size(k, v))
        .sum();
    let needed = used + entry_size(key, value);

    if needed > quota {
        return Err(Error::QuotaExceeded(format!(
            "writing {key} needs {needed} bytes, quota is {quota}"
        )));
    }
    Ok(())
}

/// In-memory store, optionally quota-bounded
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that holds at most `quota_bytes` of keys plus values
    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.write();
        check_quota(&items, key, value, self.quota_bytes)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.items.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }
}
