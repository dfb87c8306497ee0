use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Key/value map that writes a full JSON snapshot to disk on every mutation.
///
/// Readers only take the read lock and never touch the disk. Writers are
/// serialized by a separate writer mutex that stays held from the in-memory
/// mutation until the snapshot has been renamed into place, so two writers can
/// never interleave between snapshotting and writing. The map lock itself is
/// downgraded to a read lock while serializing, which lets readers proceed.
///
/// Every mutation rewrites the whole file, which is fine while the stores stay
/// small (processed items are pruned, the rest grow slowly) but is linear in
/// store size.
pub struct PersistentStore<V> {
    name: String,
    path: Option<PathBuf>,
    data: RwLock<HashMap<String, V>>,
    writer: Mutex<()>,
}

impl<V> PersistentStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open a store backed by `path`, loading whatever snapshot is there.
    ///
    /// A missing or blank file yields an empty store. A file that does not
    /// parse is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("store")
            .to_string();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!(
                        "Failed to create data directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let data = Self::load(&path)?;
        tracing::debug!(store = %name, entries = data.len(), path = %path.display(), "Loaded store");

        Ok(Self {
            name,
            path: Some(path),
            data: RwLock::new(data),
            writer: Mutex::new(()),
        })
    }

    /// A store that never touches the disk.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            data: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    fn load(path: &Path) -> Result<HashMap<String, V>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::Storage(format!("Failed to read store '{}': {}", path.display(), e))
        })?;

        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let data = serde_json::from_str(&content)?;
        Ok(data)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or overwrite `key`, then persist the whole map.
    ///
    /// On a persistence failure the in-memory value is kept and the error is
    /// returned so the caller can decide whether to log or abort.
    pub fn store(&self, key: impl Into<String>, value: V) -> Result<()> {
        let key = key.into();
        self.write_through(|data| {
            data.insert(key, value);
        })
    }

    pub fn retrieve(&self, key: &str) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Remove `key` and persist. Returns whether the key was present.
    pub fn erase(&self, key: &str) -> Result<bool> {
        self.write_through(|data| data.remove(key).is_some())
    }

    /// Remove every entry matching `predicate` with a single persist.
    pub fn erase_where<F>(&self, mut predicate: F) -> Result<usize>
    where
        F: FnMut(&str, &V) -> bool,
    {
        let _writer = self.writer.lock();
        let removed = {
            let mut data = self.data.write();
            let before = data.len();
            data.retain(|k, v| !predicate(k, v));
            before - data.len()
        };

        // Nothing changed, no need to rewrite the snapshot.
        if removed == 0 {
            return Ok(0);
        }

        let snapshot = serde_json::to_vec(&*self.data.read())?;
        self.persist(&snapshot)?;
        Ok(removed)
    }

    /// Point-in-time copy of the keys.
    pub fn keys(&self) -> HashSet<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn write_through<R>(&self, apply: impl FnOnce(&mut HashMap<String, V>) -> R) -> Result<R> {
        let _writer = self.writer.lock();

        let mut data = self.data.write();
        let out = apply(&mut data);
        let data = RwLockWriteGuard::downgrade(data);
        let snapshot = serde_json::to_vec(&*data)?;
        drop(data);

        self.persist(&snapshot)?;
        Ok(out)
    }

    /// Caller must hold `self.writer`.
    fn persist(&self, snapshot: &[u8]) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // Write to a temporary file first, then rename over the target
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| {
            Error::Storage(format!(
                "Failed to create temp file for '{}': {}",
                path.display(),
                e
            ))
        })?;
        temp.write_all(snapshot)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| {
                Error::Storage(format!("Failed to write store '{}': {}", path.display(), e))
            })?;
        temp.persist(path).map_err(|e| {
            Error::Storage(format!(
                "Failed to replace store '{}': {}",
                path.display(),
                e.error
            ))
        })?;

        tracing::trace!(store = %self.name, bytes = snapshot.len(), "Persisted store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_store_retrieve_erase() {
        let store: PersistentStore<u32> = PersistentStore::in_memory("numbers");

        store.store("a", 1).unwrap();
        assert_eq!(store.retrieve("a"), Some(1));

        store.store("a", 2).unwrap();
        assert_eq!(store.retrieve("a"), Some(2));

        assert!(store.erase("a").unwrap());
        assert_eq!(store.retrieve("a"), None);
        assert!(!store.erase("a").unwrap());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        let now = Utc::now();

        {
            let store: PersistentStore<DateTime<Utc>> = PersistentStore::open(&path).unwrap();
            store.store("t3_abc", now).unwrap();
            store.store("t3_def", now).unwrap();
            store.erase("t3_def").unwrap();
        }

        let reopened: PersistentStore<DateTime<Utc>> = PersistentStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.retrieve("t3_abc"), Some(now));
    }

    #[test]
    fn test_presence_entries_are_null_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("forwarded_urls.json");

        let store: PersistentStore<()> = PersistentStore::open(&path).unwrap();
        store.store("https://i.example.com/x.jpg", ()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "https://i.example.com/x.jpg": null }));
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store: PersistentStore<()> =
            PersistentStore::open(temp_dir.path().join("nested/dir/none.json")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.name(), "none");
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        fs::write(&path, "{\"t3_abc\": ").unwrap();

        let result: Result<PersistentStore<()>> = PersistentStore::open(&path);
        match result {
            Err(err @ Error::Serialization(_)) => assert!(err.is_fatal()),
            Err(other) => panic!("Expected Serialization error, got {other}"),
            Ok(_) => panic!("Expected corrupt store to fail to open"),
        }
    }

    #[test]
    fn test_erase_where_persists_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("numbers.json");
        let store: PersistentStore<u32> = PersistentStore::open(&path).unwrap();
        for i in 0..10 {
            store.store(format!("k{i}"), i).unwrap();
        }

        let removed = store.erase_where(|_, v| *v % 2 == 0).unwrap();
        assert_eq!(removed, 5);

        let reopened: PersistentStore<u32> = PersistentStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 5);
        assert!(reopened.keys().iter().all(|k| reopened.retrieve(k).unwrap() % 2 == 1));
    }

    #[test]
    fn test_failed_persist_keeps_value() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("data");
        let store: PersistentStore<u32> = PersistentStore::open(dir.join("numbers.json")).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        let result = store.store("a", 1);

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.retrieve("a"), Some(1));
    }

    #[test]
    fn test_concurrent_writers_leave_complete_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("concurrent.json");
        let store: Arc<PersistentStore<usize>> = Arc::new(PersistentStore::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.store(format!("{t}-{i}"), i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened: PersistentStore<usize> = PersistentStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 200);
        assert_eq!(reopened.keys(), store.keys());
    }
}
