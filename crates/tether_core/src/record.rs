//! The locally held entity.

use crate::types::{EntityKey, Payload, SyncState, Timestamp};
use serde::{Deserialize, Serialize};

/// An entity as held by the local record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Collection and id.
    pub key: EntityKey,
    /// The entity itself.
    pub payload: Payload,
    /// Synchronization state.
    pub sync_state: SyncState,
    /// Bumped on every local write; equals `remote_version` once synced.
    pub local_version: u64,
    /// Last version observed from the remote authority.
    pub remote_version: Option<u64>,
    /// Time of the last change to this record.
    pub updated_at: Timestamp,
}

impl LocalRecord {
    /// The record's collection.
    pub fn collection(&self) -> &str {
        &self.key.collection
    }

    /// The record's id.
    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Returns true for a pending delete.
    pub fn is_tombstoned(&self) -> bool {
        self.sync_state.is_tombstoned()
    }

    /// Returns true if the record is confirmed by the remote authority.
    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    /// Checks the `Synced => local_version == remote_version` invariant.
    pub fn is_consistent(&self) -> bool {
        !self.is_synced() || self.remote_version == Some(self.local_version)
    }

    /// The next local version for a write on top of this record.
    pub(crate) fn next_version(&self) -> u64 {
        self.local_version.max(self.remote_version.unwrap_or(0)) + 1
    }
}
