//! # tether core
//!
//! The locally persisted half of tether's offline-first sync engine.
//!
//! This crate provides:
//! - [`LocalRecordStore`] - entities keyed by `(collection, id)`, each tagged
//!   with a [`SyncState`]
//! - [`SyncQueue`] - the ordered log of outbound mutations, with retry
//!   scheduling and a dead-letter set
//! - [`ConflictStore`] - conflicts awaiting a manual decision
//! - [`DataDir`] - the on-disk layout and its single-owner lock
//!
//! Every component persists through an [`EventLog`] on top of a
//! [`tether_storage::StorageBackend`], so the same code runs against a file
//! or an in-memory fake.
//!
//! ## Key Invariants
//!
//! - A `Synced` record has `local_version == remote_version`
//! - Tombstoned records are never returned by normal reads
//! - Queue entries for one entity keep their enqueue order
//! - An entry's idempotency key never changes across retries

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod dir;
mod error;
mod log;
mod queue;
mod record;
mod store;
mod types;

pub use conflict::{
    ConflictRecord, ConflictStatus, ConflictStore, ConflictStrategy, ResolutionKind,
};
pub use dir::DataDir;
pub use error::{CoreError, CoreResult};
pub use log::{EventLog, LogKind};
pub use queue::{DeadLetter, DeadLetterReason, NewEntry, Reissue, SyncQueue, SyncQueueEntry};
pub use record::LocalRecord;
pub use store::{overlay, Confirmation, LocalRecordStore, WriteOutcome};
pub use types::{
    ConflictId, EntityKey, EntryId, IdempotencyKey, Payload, SyncState, Timestamp, Verb,
};
