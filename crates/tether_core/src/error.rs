//! Error types for tether core.

use crate::types::{ConflictId, EntityKey, EntryId, SyncState};
use std::io;
use tether_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the record store, queue or conflict store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The persistence backend rejected a write for lack of space.
    ///
    /// The caller should evict synced records and retry, or surface the
    /// condition to the user.
    #[error("storage full: {0}")]
    StorageFull(StorageError),

    /// Any other storage backend error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// I/O error outside a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An event could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// An event could not be deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// A log frame is malformed.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Offset of the bad frame.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// A log frame failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Offset of the bad frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// No live record with this key.
    #[error("record not found: {key}")]
    RecordNotFound {
        /// The missing key.
        key: EntityKey,
    },

    /// No queue entry with this ID.
    #[error("queue entry not found: {entry_id}")]
    EntryNotFound {
        /// The missing entry.
        entry_id: EntryId,
    },

    /// No pending conflict with this ID.
    #[error("conflict not found: {conflict_id}")]
    ConflictNotFound {
        /// The missing conflict.
        conflict_id: ConflictId,
    },

    /// The record cannot move between these states.
    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        /// Record key.
        key: EntityKey,
        /// Current state.
        from: SyncState,
        /// Requested state.
        to: SyncState,
    },

    /// Another process owns the data directory.
    #[error("data directory is locked by another process")]
    DirectoryLocked,

    /// The data directory is missing or not a directory.
    #[error("invalid data directory: {0}")]
    InvalidDirectory(String),
}

impl CoreError {
    /// Returns true if the error means the backend is out of space.
    pub fn is_storage_full(&self) -> bool {
        matches!(self, CoreError::StorageFull(_))
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        if err.is_full() {
            CoreError::StorageFull(err)
        } else {
            CoreError::Storage(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_storage_maps_to_storage_full() {
        let err: CoreError = StorageError::Full {
            requested: 10,
            capacity: 4,
        }
        .into();
        assert!(err.is_storage_full());

        let err: CoreError = StorageError::ReadPastEnd {
            offset: 0,
            len: 1,
            size: 0,
        }
        .into();
        assert!(!err.is_storage_full());
    }

    #[test]
    fn display_names_the_key() {
        let err = CoreError::RecordNotFound {
            key: EntityKey::new("profile", "42"),
        };
        assert_eq!(err.to_string(), "record not found: profile/42");
    }
}
