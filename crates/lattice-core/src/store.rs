//! Persisted previous-execution state
//!
//! Snapshots survive across invocations on the same machine. The sled
//! store keeps one JSON value per task under `build\0task`.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

use crate::identity::TaskReference;
use crate::snapshot::TaskSnapshot;

/// Key-value store of the last recorded snapshot per task
pub trait SnapshotStore: Send + Sync {
    fn load(&self, task: &TaskReference) -> Result<Option<TaskSnapshot>>;
    fn store(&self, task: &TaskReference, snapshot: &TaskSnapshot) -> Result<()>;
    fn remove(&self, task: &TaskReference) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// On-disk store backed by sled
pub struct SledSnapshotStore {
    path: PathBuf,
    db: sled::Db,
}

impl SledSnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let db = sled::open(&path)?;
        debug!(path = ?path, entries = db.len(), "opened snapshot store");
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the store on disk
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn load(&self, task: &TaskReference) -> Result<Option<TaskSnapshot>> {
        match self.db.get(task.storage_key())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn store(&self, task: &TaskReference, snapshot: &TaskSnapshot) -> Result<()> {
        let data = serde_json::to_vec(snapshot)?;
        self.db.insert(task.storage_key(), data)?;
        self.db.flush()?;
        debug!(task = %task, "stored task snapshot");
        Ok(())
    }

    fn remove(&self, task: &TaskReference) -> Result<()> {
        if self.db.remove(task.storage_key())?.is_some() {
            self.db.flush()?;
            debug!(task = %task, "removed task snapshot");
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let count = self.db.len();
        self.db.clear()?;
        self.db.flush()?;
        info!(removed = count, "cleared snapshot store");
        Ok(())
    }

    fn len(&self) -> usize {
        self.db.len()
    }
}

/// In-memory store, lost when the process exits
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    map: RwLock<HashMap<TaskReference, TaskSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, task: &TaskReference) -> Result<Option<TaskSnapshot>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(task).cloned())
    }

    fn store(&self, task: &TaskReference, snapshot: &TaskSnapshot) -> Result<()> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(task.clone(), snapshot.clone());
        Ok(())
    }

    fn remove(&self, task: &TaskReference) -> Result<()> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(task);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.map.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ContentHash, NormalizedSnapshot};
    use tempfile::TempDir;

    fn sample() -> TaskSnapshot {
        TaskSnapshot::new(
            vec![NormalizedSnapshot::new("src/lib.rs", ContentHash("abc".into()))],
            vec![NormalizedSnapshot::new("build/lib.jar", ContentHash("def".into()))],
        )
    }

    #[test]
    fn test_sled_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let task = TaskReference::parse("lib:jar").unwrap();

        {
            let store = SledSnapshotStore::open(dir.path()).unwrap();
            assert!(store.load(&task).unwrap().is_none());
            store.store(&task, &sample()).unwrap();
        }

        let store = SledSnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.load(&task).unwrap(), Some(sample()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.path(), dir.path());
        assert!(store.size_on_disk().unwrap() > 0);

        store.remove(&task).unwrap();
        assert!(store.load(&task).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemorySnapshotStore::new();
        store.store(&TaskReference::parse("a:x").unwrap(), &sample()).unwrap();
        store.store(&TaskReference::parse("b:y").unwrap(), &sample()).unwrap();
        assert_eq!(store.len(), 2);
        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
