//! Data directory layout.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK              # Advisory lock, one owner at a time
//! ├─ records.log       # Local record store
//! ├─ queue.log         # Sync queue and dead letters
//! └─ conflicts.log     # Pending conflicts
//! ```
//!
//! The store and queue have a single owner. The LOCK file makes a second
//! process (or a second orchestrator in this one) fail fast instead of
//! interleaving appends.

use crate::conflict::ConflictStore;
use crate::error::{CoreError, CoreResult};
use crate::queue::SyncQueue;
use crate::store::LocalRecordStore;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tether_storage::FileBackend;

const LOCK_FILE: &str = "LOCK";
const RECORDS_FILE: &str = "records.log";
const QUEUE_FILE: &str = "queue.log";
const CONFLICTS_FILE: &str = "conflicts.log";

/// An exclusively locked data directory.
///
/// The lock is released when this value is dropped.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens a data directory, creating it if asked to.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDirectory` if the path is missing (and
    /// `create_if_missing` is false) or not a directory, and
    /// `DirectoryLocked` if another owner holds the lock.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::InvalidDirectory(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::InvalidDirectory(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DirectoryLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The directory root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the record log.
    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.path.join(RECORDS_FILE)
    }

    /// Path of the queue log.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.path.join(QUEUE_FILE)
    }

    /// Path of the conflict log.
    #[must_use]
    pub fn conflicts_path(&self) -> PathBuf {
        self.path.join(CONFLICTS_FILE)
    }

    /// Opens the record store kept in this directory.
    pub fn open_store(&self) -> CoreResult<LocalRecordStore> {
        LocalRecordStore::open(Box::new(FileBackend::open(&self.records_path())?))
    }

    /// Opens the sync queue kept in this directory.
    pub fn open_queue(&self) -> CoreResult<SyncQueue> {
        SyncQueue::open(Box::new(FileBackend::open(&self.queue_path())?))
    }

    /// Opens the conflict store kept in this directory.
    pub fn open_conflicts(&self) -> CoreResult<ConflictStore> {
        ConflictStore::open(Box::new(FileBackend::open(&self.conflicts_path())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn second_owner_is_refused() {
        let root = tempdir().unwrap();
        let path = root.path().join("data");

        let dir = DataDir::open(&path, true).unwrap();
        assert!(matches!(
            DataDir::open(&path, true),
            Err(CoreError::DirectoryLocked)
        ));

        drop(dir);
        DataDir::open(&path, false).unwrap();
    }

    #[test]
    fn missing_directory_without_create() {
        let root = tempdir().unwrap();
        let err = DataDir::open(&root.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDirectory(_)));
    }

    #[test]
    fn components_persist_in_their_files() {
        let root = tempdir().unwrap();
        let key = crate::EntityKey::new("profile", "1");
        {
            let dir = DataDir::open(root.path(), true).unwrap();
            dir.open_store().unwrap().put(&key, json!({"n": 1})).unwrap();
        }

        let dir = DataDir::open(root.path(), false).unwrap();
        assert!(dir.records_path().exists());
        assert_eq!(dir.open_store().unwrap().get(&key).unwrap().payload, json!({"n": 1}));
        assert!(dir.open_queue().unwrap().is_empty());
        assert!(dir.open_conflicts().unwrap().is_empty());
    }
}
