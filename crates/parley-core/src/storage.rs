use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Durable local peer id.
pub const KEY_LOCAL_ID: &str = "peer_id";
/// Durable counterpart peer id.
pub const KEY_REMOTE_ID: &str = "other_peer_id";
/// Serialized message log shared by every conversation on the device.
pub const KEY_MESSAGES: &str = "messages";

/// Key-value persistence port backing identity and the message log.
///
/// Single writer; no cross-process locking.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// In-process store, lost on drop.
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
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

/// Store backed by a single JSON object file, rewritten on every `set`.
pub struct FileStore {
    entries: Mutex<BTreeMap<String, String>>,
    file_path: PathBuf,
}

impl FileStore {
    pub fn open(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("store.json");
        let entries = Self::load(&file_path);
        Self {
            entries: Mutex::new(entries),
            file_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("store file {} is unreadable, starting empty: {e}", path.display());
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn flush(&self, entries: &BTreeMap<String, String>) {
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize store: {e}"),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get(KEY_LOCAL_ID), None);
        store.set(KEY_LOCAL_ID, "alice");
        assert_eq!(store.get(KEY_LOCAL_ID).as_deref(), Some("alice"));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = FileStore::open(path);
            store.set(KEY_LOCAL_ID, "alice");
            store.set(KEY_REMOTE_ID, "bob");
        }
        let store = FileStore::open(path);
        assert_eq!(store.get(KEY_LOCAL_ID).as_deref(), Some("alice"));
        assert_eq!(store.get(KEY_REMOTE_ID).as_deref(), Some("bob"));
    }

    #[test]
    fn file_store_flushes_every_write() {
        let dir = temp_dir();
        let store = FileStore::open(dir.path().to_str().unwrap());
        store.set(KEY_MESSAGES, "[]");
        let on_disk = fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.contains("\"messages\""));
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = temp_dir();
        fs::write(dir.path().join("store.json"), "not json!!!").unwrap();
        let store = FileStore::open(dir.path().to_str().unwrap());
        assert_eq!(store.get(KEY_LOCAL_ID), None);
    }
}
