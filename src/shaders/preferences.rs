// SPDX-License-Identifier: GPL-3.0-only

//! Preference storage for filter settings
//!
//! Filters only read preferences; the host writes them. Stores use interior
//! mutability so a single store can be shared behind an `Arc`.

use crate::constants::app;
use crate::errors::ConfigError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Key/value store for integer preferences
pub trait PreferenceStore: Send + Sync {
    fn integer(&self, key: &str) -> Option<i64>;

    fn set_integer(&self, key: &str, value: i64) -> Result<(), ConfigError>;

    fn contains(&self, key: &str) -> bool {
        self.integer(key).is_some()
    }
}

/// In-process store, used by tests and when no config dir is available
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn integer(&self, key: &str) -> Option<i64> {
        self.values.lock().ok()?.get(key).copied()
    }

    fn set_integer(&self, key: &str, value: i64) -> Result<(), ConfigError> {
        self.values
            .lock()
            .map_err(|_| ConfigError::Io("preference store poisoned".to_string()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// Preferences persisted as a JSON object
#[derive(Debug)]
pub struct JsonPreferenceStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonPreferenceStore {
    /// Open (or start) the store at `path`.
    ///
    /// A missing file is an empty store; an unreadable one is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "Opened preference store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Store in the user's config directory
    pub fn open_default() -> Result<Self, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Self::open(dir.join(app::CONFIG_DIR_NAME).join(app::PREFERENCES_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file to pick up changes made by another process.
    ///
    /// A missing file keeps the current values.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let values: BTreeMap<String, Value> = serde_json::from_str(&contents)?;
        *self
            .values
            .lock()
            .map_err(|_| ConfigError::Io("preference store poisoned".to_string()))? = values;
        Ok(())
    }

    fn save(&self, values: &BTreeMap<String, Value>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn integer(&self, key: &str) -> Option<i64> {
        let values = self.values.lock().ok()?;
        match values.get(key)? {
            Value::Number(n) => n.as_i64(),
            other => {
                warn!(key, value = %other, "Preference is not an integer");
                None
            }
        }
    }

    fn set_integer(&self, key: &str, value: i64) -> Result<(), ConfigError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| ConfigError::Io("preference store poisoned".to_string()))?;
        values.insert(key.to_string(), Value::from(value));
        self.save(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryPreferenceStore::new();
        assert!(!store.contains("a"));
        store.set_integer("a", 3).unwrap();
        assert_eq!(store.integer("a"), Some(3));
    }

    #[test]
    fn test_json_store_persists() {
        let dir = std::env::temp_dir().join(format!("daltocam-prefs-{}", std::process::id()));
        let path = dir.join("preferences.json");
        let _ = std::fs::remove_file(&path);

        let store = JsonPreferenceStore::open(&path).unwrap();
        assert_eq!(store.integer("SimVisionType"), None);
        store.set_integer("SimVisionType", 4).unwrap();

        let reopened = JsonPreferenceStore::open(&path).unwrap();
        assert_eq!(reopened.integer("SimVisionType"), Some(4));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_json_store_reload_sees_other_writers() {
        let dir =
            std::env::temp_dir().join(format!("daltocam-prefs-reload-{}", std::process::id()));
        let path = dir.join("preferences.json");
        let _ = std::fs::remove_file(&path);

        let reader = JsonPreferenceStore::open(&path).unwrap();
        reader.reload().unwrap();
        assert_eq!(reader.integer("SimulationKey"), None);

        let writer = JsonPreferenceStore::open(&path).unwrap();
        writer.set_integer("SimulationKey", 0).unwrap();
        assert_eq!(reader.integer("SimulationKey"), None);

        reader.reload().unwrap();
        assert_eq!(reader.integer("SimulationKey"), Some(0));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = std::env::temp_dir().join(format!("daltocam-prefs-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("preferences.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonPreferenceStore::open(&path),
            Err(ConfigError::Parse(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
