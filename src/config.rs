//! Configuration management

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// REST collaborator
    pub api: ApiConfig,
    /// Durable local storage
    pub storage: StorageConfig,
    /// Response cache
    pub cache: CacheConfig,
    /// Reminder scheduler
    pub reminder: ReminderConfig,
}

/// REST collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL including the global `/api` prefix
    pub base_url: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Page size used when walking the paginated task list
    pub page_size: u32,
    /// Extra HTTP headers sent with every request
    pub headers: HashMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            timeout: Duration::from_secs(10),
            page_size: 100,
            headers: HashMap::new(),
        }
    }
}

/// Durable local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `storage.json`
    pub dir: PathBuf,
    /// Maximum bytes of keys plus values (0 = unbounded)
    pub quota_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir: base.join("hijot"),
            quota_bytes: 5 * 1024 * 1024, // 5MB
        }
    }
}

impl StorageConfig {
    /// Quota as an option, `None` meaning unbounded
    #[must_use]
    pub fn quota(&self) -> Option<usize> {
        (self.quota_bytes > 0).then_some(self.quota_bytes)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching
    pub enabled: bool,
    /// Default TTL for cached responses
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Maximum number of non-permanent entries kept in durable storage
    pub max_entries: usize,
    /// Prefix namespacing cache entries in durable storage
    pub storage_prefix: String,
    /// Cache keys that never expire and are never evicted
    pub permanent_keys: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(5 * 60),
            max_entries: 50,
            storage_prefix: "hijot-api-cache-".to_string(),
            permanent_keys: vec!["/todo/stats?{}".to_string(), "/config?{}".to_string()],
        }
    }
}

/// Reminder scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    /// Interval of the overdue sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Cache endpoint holding the last task list
    pub task_list_key: String,
    /// Freshness of the cached task list used for the fast initial view
    #[serde(with = "humantime_serde")]
    pub task_list_ttl: Duration,
    /// Relaxed TTL used when the task fetch fails
    #[serde(with = "humantime_serde")]
    pub stale_task_list_ttl: Duration,
    /// Storage key of the local notified set
    pub notified_ids_key: String,
    /// Storage key of the persisted app config (notification preference)
    pub preferences_key: String,
    /// Title of system notification requests
    pub notification_title: String,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            task_list_key: "/todo/all".to_string(),
            task_list_ttl: Duration::from_secs(2 * 60),
            stale_task_list_ttl: Duration::from_secs(10 * 60),
            notified_ids_key: "hijot-reminded-ids".to_string(),
            preferences_key: "hijot-config".to_string(),
            notification_title: "⏰ Todo reminder".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // HIJOT_API__BASE_URL -> api.base_url
        figment = figment.merge(Env::prefixed("HIJOT_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in the API base URL and headers
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.api.base_url = Self::expand_string(&re, &self.api.base_url);
        for value in self.api.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Human-readable serde format for [`Duration`]
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds when sub-second, seconds otherwise
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize "100ms", "30s", "5m", "2h" or bare seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a human-readable duration
    ///
    /// # Errors
    ///
    /// Returns the parse error when the numeric part is not an integer.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
