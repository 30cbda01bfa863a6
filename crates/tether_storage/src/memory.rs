//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory storage backend.
///
/// Suitable for tests and for sessions that do not need to survive a
/// restart. A capacity can be set to exercise storage-exhaustion paths.
///
/// # Example
///
/// ```rust
/// use tether_storage::{InMemoryBackend, StorageBackend, StorageError};
///
/// let mut backend = InMemoryBackend::with_capacity(4);
/// backend.append(b"abcd").unwrap();
/// assert!(matches!(backend.append(b"e"), Err(StorageError::Full { .. })));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
    capacity: Option<u64>,
}

impl InMemoryBackend {
    /// Creates a new unbounded backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that rejects writes beyond `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    /// Creates a backend with pre-existing content.
    ///
    /// Useful for replaying a log captured from another backend.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            capacity: None,
        }
    }

    /// Returns a copy of the content.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn check_capacity(&self, total: u64) -> StorageResult<()> {
        match self.capacity {
            Some(capacity) if total > capacity => Err(StorageError::Full {
                requested: total,
                capacity,
            }),
            _ => Ok(()),
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        self.check_capacity(offset + new_data.len() as u64)?;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn rewrite(&mut self, new_data: &[u8]) -> StorageResult<()> {
        self.check_capacity(new_data.len() as u64)?;
        *self.data.write() = new_data.to_vec();
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}
