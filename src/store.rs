//! Persisted key-value state.
//!
//! Values are JSON documents keyed by a short name. `JsonFileStore` keeps one
//! pretty-printed file per key under a data directory; `MemoryStore` keeps
//! them in a map and can be told to fail for exercising degraded paths.

use crate::error::{TrackerError, TrackerResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const CALIBRATION_KEY: &str = "calibration";
pub const SYNC_OFFSET_KEY: &str = "sync_offset";
pub const DEVICES_KEY: &str = "devices";

pub trait KeyValueStore: Send + Sync {
    /// Raw JSON for `key`, `None` if nothing was ever stored.
    fn get(&self, key: &str) -> TrackerResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> TrackerResult<()>;
    fn remove(&self, key: &str) -> TrackerResult<()>;
}

pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> TrackerResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> TrackerResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    store.set(key, &json)
}

/// One `<key>.json` file per record.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl AsRef<Path>) -> TrackerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> TrackerResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> TrackerResult<()> {
        // Write-then-rename so a crash never leaves a truncated record
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> TrackerResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a persistence error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> TrackerResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TrackerError::Persistence("storage unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn values(&self) -> TrackerResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| TrackerError::Internal("Failed to acquire store lock".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> TrackerResult<Option<String>> {
        self.check()?;
        Ok(self.values()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> TrackerResult<()> {
        self.check()?;
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> TrackerResult<()> {
        self.check()?;
        self.values()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vertical_tracker_{}_{}_{}",
            name,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = temp_dir("roundtrip");
        let store = JsonFileStore::open(&dir).unwrap();

        assert_eq!(store.get("missing").unwrap(), None);

        save_json(&store, SYNC_OFFSET_KEY, &2.5f64).unwrap();
        let loaded: Option<f64> = load_json(&store, SYNC_OFFSET_KEY).unwrap();
        assert_eq!(loaded, Some(2.5));

        store.remove(SYNC_OFFSET_KEY).unwrap();
        store.remove(SYNC_OFFSET_KEY).unwrap();
        assert_eq!(store.get(SYNC_OFFSET_KEY).unwrap(), None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_store_corrupt_record_is_persistence_error() {
        let dir = temp_dir("corrupt");
        let store = JsonFileStore::open(&dir).unwrap();
        store.set(CALIBRATION_KEY, "{not json").unwrap();

        let result: TrackerResult<Option<f64>> = load_json(&store, CALIBRATION_KEY);
        assert!(matches!(result, Err(TrackerError::Persistence(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set("k", "1").unwrap();

        store.set_failing(true);
        assert!(store.get("k").unwrap_err().is_persistence());
        assert!(store.set("k", "2").is_err());

        store.set_failing(false);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("1"));
    }
}
