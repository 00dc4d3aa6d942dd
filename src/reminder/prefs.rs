//! Desktop notification preference
//!
//! The host pushes the whole application config on `config-updated`. It is
//! stored as-is and only `systemNotification` is read here.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::KeyValueStore;

/// Persisted notification preference
pub struct NotificationPrefs {
    system_notification: bool,
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl NotificationPrefs {
    /// Load from the config stored under `key` (disabled when absent)
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let mut prefs = Self {
            system_notification: false,
            store,
            key,
        };

        if let Some(raw) = prefs.store.get_item(&prefs.key) {
            match serde_json::from_str::<Value>(&raw) {
                Ok(config) => prefs.apply(&config),
                Err(e) => warn!(key = %prefs.key, error = %e, "Failed to load stored config"),
            }
        }
        prefs
    }

    /// Whether system notifications are requested on fire
    #[must_use]
    pub fn system_notification(&self) -> bool {
        self.system_notification
    }

    /// Apply and persist a `config-updated` payload; `null` is ignored
    pub fn update(&mut self, config: &Value) {
        if config.is_null() {
            return;
        }
        if let Err(e) = self.store.set_item(&self.key, &config.to_string()) {
            warn!(key = %self.key, error = %e, "Failed to save config");
        }
        self.apply(config);
    }

    fn apply(&mut self, config: &Value) {
        self.system_notification = config
            .get("systemNotification")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        debug!(enabled = self.system_notification, "System notifications");
    }
}
