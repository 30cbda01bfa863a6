//! Error types for the sync engine.

use tether_core::{ConflictId, CoreError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote authority failed internally (5xx-equivalent).
    #[error("server error: {0}")]
    ServerError(String),

    /// The remote call did not finish within the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// Connectivity dropped while a request was being made.
    #[error("not connected to remote authority")]
    NotConnected,

    /// A sync was requested while connectivity is down.
    #[error("offline: sync unavailable until connectivity returns")]
    Offline,

    /// Local store, queue or conflict store error.
    #[error("local storage error: {0}")]
    Core(#[from] CoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A resolution was supplied for a conflict that is not pending.
    #[error("no pending conflict {0}")]
    UnknownConflict(ConflictId),

    /// The remote authority answered with something the engine cannot use.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::ServerError(_) | SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if the local store ran out of space.
    pub fn is_storage_full(&self) -> bool {
        matches!(self, SyncError::Core(e) if e.is_storage_full())
    }
}
