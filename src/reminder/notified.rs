//! Which tasks have already been reminded
//!
//! A task counts as notified when the backend says so **or** its id is in the
//! local set. The local set is written before the backend is asked to update
//! its flag, so a failed remote write never causes a second reminder.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::TaskSource;
use crate::storage::KeyValueStore;
use crate::task::{Task, TaskId};

/// Durable set of reminded task ids, stored as a JSON array
pub struct LocalNotifiedSet {
    ids: BTreeSet<TaskId>,
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl LocalNotifiedSet {
    /// Load the set stored under `key`; unreadable data yields an empty set
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let ids = match store.get_item(&key) {
            Some(raw) => match serde_json::from_str::<Vec<TaskId>>(&raw) {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to load reminded ids");
                    BTreeSet::new()
                }
            },
            None => BTreeSet::new(),
        };
        debug!(key = %key, count = ids.len(), "Loaded reminded ids");

        Self { ids, store, key }
    }

    /// Whether `id` has been reminded locally
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    /// Add `id` and persist; returns false if it was already present
    pub fn insert(&mut self, id: TaskId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.persist();
        true
    }

    /// Drop every id not in `keep`; persists only if something was removed
    pub fn prune(&mut self, keep: &HashSet<TaskId>) -> bool {
        let before = self.ids.len();
        self.ids.retain(|id| keep.contains(id));
        let removed = before - self.ids.len();
        if removed == 0 {
            return false;
        }
        debug!(removed, "Pruned reminded ids");
        self.persist();
        true
    }

    /// Number of ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn persist(&self) {
        let result = serde_json::to_string(&self.ids)
            .map_err(crate::Error::from)
            .and_then(|raw| self.store.set_item(&self.key, &raw));
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "Failed to save reminded ids");
        }
    }
}

/// Combines the remote flag with the local set
pub struct ReminderStateTracker {
    local: LocalNotifiedSet,
    source: Arc<dyn TaskSource>,
}

impl ReminderStateTracker {
    /// Tracker over `local`, updating flags through `source`
    pub fn new(local: LocalNotifiedSet, source: Arc<dyn TaskSource>) -> Self {
        Self { local, source }
    }

    /// Remote flag OR local membership
    #[must_use]
    pub fn is_notified(&self, task: &Task) -> bool {
        task.notified_remote || self.local.contains(task.id)
    }

    /// Record `id` locally, then update the remote flag in the background
    ///
    /// The local set is persisted before this returns. The returned handle
    /// completes when the remote attempt does; its failure is only logged.
    pub fn mark_notified(&mut self, id: TaskId) -> JoinHandle<()> {
        self.local.insert(id);

        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            if let Err(e) = source.mark_notified(id).await {
                warn!(task_id = id, error = %e, "Failed to mark task reminded remotely");
            }
        })
    }

    /// Forget local ids of tasks no longer pending
    pub fn prune_stale(&mut self, current_pending_ids: &HashSet<TaskId>) -> bool {
        self.local.prune(current_pending_ids)
    }

    /// The local set
    #[must_use]
    pub fn local(&self) -> &LocalNotifiedSet {
        &self.local
    }
}
