//! Cache-assisted task list
//!
//! The cached list gives the scheduler something to arm against before the
//! first fetch returns. A failed fetch falls back to the same entry read with
//! a longer TTL.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::Result;
use crate::api::TaskSource;
use crate::cache::{CachedResponse, ResponseCache};
use crate::config::ReminderConfig;
use crate::task::{Task, TaskStatus};

/// Task list fetched through the response cache
pub struct TaskFeed {
    source: Arc<dyn TaskSource>,
    cache: Arc<ResponseCache>,
    key: String,
    ttl: Duration,
    stale_ttl: Duration,
    use_cache: bool,
}

impl TaskFeed {
    /// Feed over `source`, cached under the configured task list key
    pub fn new(source: Arc<dyn TaskSource>, cache: Arc<ResponseCache>, config: &ReminderConfig, use_cache: bool) -> Self {
        Self {
            source,
            cache,
            key: config.task_list_key.clone(),
            ttl: config.task_list_ttl,
            stale_ttl: config.stale_task_list_ttl,
            use_cache,
        }
    }

    fn params() -> Value {
        json!({})
    }

    /// Fresh cached list, if any
    ///
    /// An older list is left in the cache for the stale fallback in
    /// [`TaskFeed::fetch`].
    #[must_use]
    pub fn cached(&self) -> Option<Vec<Task>> {
        if !self.use_cache {
            return None;
        }
        let tasks = self.cache.peek::<Vec<Task>>(&self.key, &Self::params(), self.ttl)?;
        debug!(count = tasks.len(), "Using cached task list");
        Some(visible(tasks))
    }

    /// Fetch the current list, falling back to a stale cached copy
    ///
    /// # Errors
    ///
    /// Returns the fetch error when no cached copy within the stale TTL
    /// exists.
    pub async fn fetch(&self) -> Result<CachedResponse<Vec<Task>>> {
        match self.source.list_tasks().await {
            Ok(tasks) => {
                let tasks = visible(tasks);
                if self.use_cache {
                    self.cache.set(&self.key, &Self::params(), &tasks, self.ttl);
                }
                Ok(CachedResponse {
                    data: tasks,
                    from_cache: false,
                    expired: false,
                })
            }
            Err(e) => {
                if self.use_cache {
                    if let Some(tasks) = self.cache.get::<Vec<Task>>(&self.key, &Self::params(), self.stale_ttl) {
                        warn!(error = %e, count = tasks.len(), "Task fetch failed, using stale cached list");
                        return Ok(CachedResponse {
                            data: visible(tasks),
                            from_cache: true,
                            expired: true,
                        });
                    }
                }
                Err(e)
            }
        }
    }
}

fn visible(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.retain(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Done));
    tasks
}
