//! Storage backend trait definition.

use crate::error::StorageResult;

/// A byte store holding one durable log.
///
/// Backends are **opaque byte stores**. The log layer above owns framing,
/// checksums and the meaning of every byte.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `rewrite` replaces the whole content in one step; readers observe either
///   the old or the new content, never a mix
/// - An append that would exceed `capacity()` fails with `StorageError::Full`
///   and leaves the content untouched
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `ReadPastEnd` if the range extends beyond the current size,
    /// or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset where it was written.
    ///
    /// # Errors
    ///
    /// Returns `Full` when the capacity would be exceeded, or an I/O error.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Replaces the entire content with `data`.
    ///
    /// Used by log compaction.
    ///
    /// # Errors
    ///
    /// Returns `Full` when `data` alone exceeds the capacity, or an I/O error.
    fn rewrite(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Flushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs data and metadata to durable media.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Returns the configured capacity, if any.
    fn capacity(&self) -> Option<u64>;
}
