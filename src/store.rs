//! Durable key-value storage: every mutation commits synchronously so a
//! process kill immediately after a successful call never loses state
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Flat string key-value store with synchronous commit.
///
/// Implementations must make `put`/`remove` durable before returning; callers
/// rely on that for crash consistency. Single get/put calls are atomic;
/// compound read-modify-write sequences are serialized by the caller.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

// ============================================================================
// File Store
// ============================================================================

/// JSON file-backed store. Writes go to a temp file then rename into place,
/// so readers never observe a torn file.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read(&path)
                .with_context(|| format!("Failed to read store: {}", path.display()))?;
            sonic_rs::from_slice(&raw)
                .with_context(|| format!("Failed to parse store: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(FileStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn save_locked(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create store dir: {}", parent.display()))?;
            }
        }
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries).context("Failed to serialize store")?;
        std::fs::write(&temp_path, json)
            .with_context(|| format!("Failed to write temp store: {}", temp_path.display()))?;
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename store: {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_string());
        self.save_locked(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(key).is_some() {
            self.save_locked(&entries)?;
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-memory store for tests and embedders that supply their own durability
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.json");
        {
            let store = FileStore::open(&path)?;
            store.put("a", "1")?;
            store.put("bundle.x", "{\"id\":\"x\"}")?;
        }
        let store = FileStore::open(&path)?;
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.keys_with_prefix("bundle."), vec!["bundle.x"]);
        Ok(())
    }

    #[test]
    fn test_file_store_no_temp_left_behind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path)?;
        store.put("k", "v")?;
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_file_store_parses_existing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"device_id": "abc", "bundle.y": "{}"}"#)?;
        let store = FileStore::open(&path)?;
        assert_eq!(store.get("device_id").as_deref(), Some("abc"));
        assert_eq!(store.keys_with_prefix("bundle."), vec!["bundle.y"]);
        Ok(())
    }

    #[test]
    fn test_remove_missing_is_noop() -> Result<()> {
        let store = MemoryStore::new();
        store.remove("ghost")?;
        assert!(store.get("ghost").is_none());
        Ok(())
    }
}
