//! # tether storage
//!
//! Byte-store backends underneath tether's durable logs.
//!
//! The record store, sync queue and conflict store each persist an
//! append-only event log. This crate provides the place those logs live.
//! Backends are **opaque**: they never interpret what they hold.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral sessions
//! - [`FileBackend`] - Durable storage on the local file system
//!
//! Both accept an optional capacity. An append that would exceed it fails with
//! [`StorageError::Full`] so callers can evict and retry.
//!
//! ## Example
//!
//! ```rust
//! use tether_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"queued").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"queued");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
