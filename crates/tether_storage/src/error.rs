//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The write would exceed the configured capacity.
    #[error("storage full: {requested} bytes requested, capacity {capacity} bytes")]
    Full {
        /// Total size the write would have produced.
        requested: u64,
        /// Configured capacity.
        capacity: u64,
    },
}

impl StorageError {
    /// Returns true if the backend rejected a write for lack of space.
    pub fn is_full(&self) -> bool {
        match self {
            StorageError::Full { .. } => true,
            StorageError::Io(err) => err.kind() == io::ErrorKind::StorageFull,
            StorageError::ReadPastEnd { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_classification() {
        let err = StorageError::Full {
            requested: 20,
            capacity: 10,
        };
        assert!(err.is_full());
        assert!(err.to_string().contains("capacity 10"));

        let io_full = StorageError::Io(io::Error::from(io::ErrorKind::StorageFull));
        assert!(io_full.is_full());

        let other = StorageError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(!other.is_full());
    }
}
