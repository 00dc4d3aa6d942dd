//! File-backed key-value store
//!
//! Persists the whole map as one JSON document, rewritten through a temp file
//! and rename after every mutation so a crash never leaves a torn file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{KeyValueStore, check_quota};
use crate::{Error, Result};

/// File name of the store inside its directory
const STORE_FILE: &str = "storage.json";

/// Durable key-value store kept in `<dir>/storage.json`
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl FileStore {
    /// Open (or create) the store in `dir`
    ///
    /// An unreadable or corrupt store file is logged and replaced by an
    /// empty store; it never prevents startup.
    pub fn open(dir: &Path, quota_bytes: Option<usize>) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Storage(format!("Failed to create storage dir: {e}")))?;
        }

        let path = dir.join(STORE_FILE);
        let items = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                    Ok(items) => {
                        debug!(path = %path.display(), keys = items.len(), "Loaded storage");
                        items
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Corrupt storage file, starting empty");
                        BTreeMap::new()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read storage file");
                    BTreeMap::new()
                }
            }
        } else {
            info!(path = %path.display(), "Creating new storage");
            BTreeMap::new()
        };

        Ok(Self {
            path,
            items: Mutex::new(items),
            quota_bytes,
        })
    }

    /// Location of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_string(items)?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, content)
            .map_err(|e| Error::Storage(format!("Failed to write storage file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }

        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Storage(format!("Failed to replace storage file: {e}")))
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock();
        check_quota(&items, key, value, self.quota_bytes)?;

        let previous = items.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&items) {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => items.insert(key.to_string(), old),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let mut items = self.items.lock();
        if items.remove(key).is_some() {
            if let Err(e) = self.flush(&items) {
                warn!(key = %key, error = %e, "Failed to persist removal");
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        self.items.lock().keys().cloned().collect()
    }
}
