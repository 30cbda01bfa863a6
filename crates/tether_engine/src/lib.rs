//! # tether engine
//!
//! Drives an offline-first client's local changes to a remote authority.
//!
//! This crate provides:
//! - [`SyncOrchestrator`] - owns the local state, mirrors writes into the
//!   queue and runs drain cycles on connectivity edges, timer ticks and
//!   explicit requests
//! - [`QueueProcessor`] - transmits queue entries with retry, backoff and
//!   dead-lettering
//! - [`ConflictResolver`] - per-collection `ClientWins`, `ServerWins`,
//!   `Merge` and `Manual` strategies
//! - [`RemoteAuthority`] and [`Connectivity`] - the boundaries to the
//!   outside world, with in-memory implementations for tests
//!
//! ## Key Invariants
//!
//! - At most one drain cycle runs at a time
//! - Entries for one entity are transmitted one at a time, in order
//! - A retried entry always carries its original idempotency key
//! - A conflict is never dropped without a resolution
//!
//! ## Example
//!
//! ```rust,ignore
//! let remote = Arc::new(MemoryRemote::new());
//! let connectivity = Arc::new(ManualConnectivity::new(false));
//! let sync = SyncOrchestrator::in_memory(SyncConfig::default(), remote, connectivity.clone())?;
//!
//! sync.put("profile", "42", json!({"name": "C"}))?;
//! connectivity.set_online(true); // drains the queue
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod error;
mod locks;
mod orchestrator;
mod processor;
mod remote;
mod resolver;
mod status;

pub use config::{RetryConfig, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityCallback, ManualConnectivity};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{PeriodicHandle, SyncOrchestrator, TriggerOutcome};
pub use processor::{DrainReport, QueueProcessor, ResolutionChoice};
pub use remote::{AppliedWrite, ApplyOutcome, ApplyRequest, Fault, MemoryRemote, RemoteAuthority};
pub use resolver::{merge_objects, ConflictResolver, MergeError, MergeFn, Resolution};
pub use status::{OrchestratorState, StatusListener, Subscription, SyncStatus};
