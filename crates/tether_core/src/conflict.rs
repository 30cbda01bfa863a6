//! Conflict records and the durable store of pending ones.

use crate::error::{CoreError, CoreResult};
use crate::log::{EventLog, LogKind};
use crate::types::{ConflictId, EntityKey, EntryId, Payload, Timestamp, Verb};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tether_storage::{InMemoryBackend, StorageBackend};
use tracing::info;

/// How a conflict on a collection is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Keep the local payload and resend it on top of the remote version.
    ClientWins,
    /// Take the remote payload and drop the local change.
    ServerWins,
    /// Combine both payloads with a merge function.
    Merge,
    /// Park the conflict until the application decides.
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClientWins => "client-wins",
            Self::ServerWins => "server-wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// The decision that settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionKind {
    /// The local payload was kept.
    KeepLocal,
    /// The remote payload was accepted.
    AcceptRemote,
    /// A merged payload was produced.
    Merged,
    /// The application supplied its own payload.
    Custom,
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    /// Waiting for a decision.
    Pending,
    /// Decided.
    Resolved(ResolutionKind),
}

/// A detected divergence between the local and remote copies of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict ID.
    pub id: ConflictId,
    /// The entity in conflict.
    pub key: EntityKey,
    /// Queue entry whose transmission was refused.
    pub entry_id: EntryId,
    /// Operation that was refused.
    pub verb: Verb,
    /// Local payload at detection time. `None` for a delete.
    pub local_payload: Option<Payload>,
    /// Local version at detection time.
    pub local_version: u64,
    /// Remote version the client last observed.
    pub base_version: Option<u64>,
    /// Remote payload. `None` if the remote copy is deleted.
    pub remote_payload: Option<Payload>,
    /// Current remote version.
    pub remote_version: u64,
    /// Strategy configured for the collection.
    pub strategy: ConflictStrategy,
    /// Current status.
    pub status: ConflictStatus,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
}

impl ConflictRecord {
    /// Returns true while the conflict awaits a decision.
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ConflictEvent {
    Record(ConflictRecord),
    Resolve { id: ConflictId, kind: ResolutionKind },
}

/// Durable set of pending conflicts.
///
/// Only unresolved conflicts are kept; resolving one removes it, so both
/// payloads remain retrievable exactly until the decision is made.
pub struct ConflictStore {
    log: EventLog<ConflictEvent>,
    pending: RwLock<BTreeMap<Timestamp, Vec<ConflictRecord>>>,
}

impl ConflictStore {
    /// Opens a conflict store over `backend`, replaying its log.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let log = EventLog::new(backend, LogKind::Conflicts);
        let mut pending: BTreeMap<Timestamp, Vec<ConflictRecord>> = BTreeMap::new();
        for event in log.replay()? {
            match event {
                ConflictEvent::Record(record) => {
                    pending.entry(record.detected_at).or_default().push(record);
                }
                ConflictEvent::Resolve { id, .. } => {
                    Self::take(&mut pending, id);
                }
            }
        }
        Ok(Self {
            log,
            pending: RwLock::new(pending),
        })
    }

    /// Creates an empty conflict store that lives in memory.
    pub fn in_memory() -> Self {
        Self {
            log: EventLog::new(Box::new(InMemoryBackend::new()), LogKind::Conflicts),
            pending: RwLock::new(BTreeMap::new()),
        }
    }

    /// Persists a new pending conflict.
    pub fn record(&self, record: ConflictRecord) -> CoreResult<ConflictRecord> {
        let mut pending = self.pending.write();
        self.log.append(&ConflictEvent::Record(record.clone()))?;
        info!(
            conflict = %record.id,
            key = %record.key,
            local_version = record.local_version,
            remote_version = record.remote_version,
            "conflict awaiting decision"
        );
        pending
            .entry(record.detected_at)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    /// Looks up a pending conflict.
    pub fn get(&self, id: ConflictId) -> Option<ConflictRecord> {
        self.pending
            .read()
            .values()
            .flatten()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Every pending conflict, oldest first.
    pub fn pending(&self) -> Vec<ConflictRecord> {
        self.pending.read().values().flatten().cloned().collect()
    }

    /// Pending conflicts for one entity, oldest first.
    pub fn pending_for(&self, key: &EntityKey) -> Vec<ConflictRecord> {
        self.pending
            .read()
            .values()
            .flatten()
            .filter(|c| &c.key == key)
            .cloned()
            .collect()
    }

    /// Returns true if `key` has a pending conflict.
    pub fn has_pending(&self, key: &EntityKey) -> bool {
        self.pending.read().values().flatten().any(|c| &c.key == key)
    }

    /// Number of pending conflicts.
    pub fn len(&self) -> usize {
        self.pending.read().values().map(Vec::len).sum()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Settles a pending conflict and returns it with its final status.
    pub fn resolve(&self, id: ConflictId, kind: ResolutionKind) -> CoreResult<ConflictRecord> {
        let mut pending = self.pending.write();
        if !pending.values().flatten().any(|c| c.id == id) {
            return Err(CoreError::ConflictNotFound { conflict_id: id });
        }
        self.log.append(&ConflictEvent::Resolve { id, kind })?;

        let mut record =
            Self::take(&mut pending, id).ok_or(CoreError::ConflictNotFound { conflict_id: id })?;
        record.status = ConflictStatus::Resolved(kind);
        info!(conflict = %id, key = %record.key, resolution = ?kind, "conflict resolved");
        Ok(record)
    }

    /// Rewrites the log to contain only pending conflicts.
    pub fn compact(&self) -> CoreResult<()> {
        let pending = self.pending.read();
        Self::rewrite(&self.log, &pending)
    }

    /// Compacts the log if resolved conflicts dominate it.
    ///
    /// Returns true if the log was rewritten.
    pub fn compact_if_bloated(&self) -> CoreResult<bool> {
        let pending = self.pending.read();
        let live = pending.values().map(Vec::len).sum();
        if !self.log.is_bloated(live) {
            return Ok(false);
        }
        Self::rewrite(&self.log, &pending)?;
        Ok(true)
    }

    /// Size of the conflict log in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.log.size()
    }

    fn rewrite(
        log: &EventLog<ConflictEvent>,
        pending: &BTreeMap<Timestamp, Vec<ConflictRecord>>,
    ) -> CoreResult<()> {
        let events: Vec<ConflictEvent> = pending
            .values()
            .flatten()
            .cloned()
            .map(ConflictEvent::Record)
            .collect();
        log.rewrite(&events)
    }

    fn take(
        pending: &mut BTreeMap<Timestamp, Vec<ConflictRecord>>,
        id: ConflictId,
    ) -> Option<ConflictRecord> {
        let (&at, bucket) = pending
            .iter_mut()
            .find(|(_, bucket)| bucket.iter().any(|c| c.id == id))?;
        let index = bucket.iter().position(|c| c.id == id)?;
        let record = bucket.remove(index);
        if bucket.is_empty() {
            pending.remove(&at);
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tether_storage::FileBackend;

    fn conflict(id: &str) -> ConflictRecord {
        ConflictRecord {
            id: ConflictId::new(),
            key: EntityKey::new("profile", id),
            entry_id: EntryId(1),
            verb: Verb::Update,
            local_payload: Some(json!({"name": "local"})),
            local_version: 3,
            base_version: Some(1),
            remote_payload: Some(json!({"name": "remote"})),
            remote_version: 2,
            strategy: ConflictStrategy::Manual,
            status: ConflictStatus::Pending,
            detected_at: Timestamp::now(),
        }
    }

    #[test]
    fn pending_conflicts_keep_both_payloads() {
        let store = ConflictStore::in_memory();
        let record = store.record(conflict("1")).unwrap();
        store.record(conflict("2")).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.has_pending(&record.key));
        let fetched = store.get(record.id).unwrap();
        assert_eq!(fetched.local_payload, Some(json!({"name": "local"})));
        assert_eq!(fetched.remote_payload, Some(json!({"name": "remote"})));
        assert!(fetched.is_pending());
    }

    #[test]
    fn resolving_removes_the_conflict() {
        let store = ConflictStore::in_memory();
        let record = store.record(conflict("1")).unwrap();

        let resolved = store.resolve(record.id, ResolutionKind::KeepLocal).unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved(ResolutionKind::KeepLocal));
        assert!(store.is_empty());
        assert!(!store.has_pending(&record.key));
        assert!(matches!(
            store.resolve(record.id, ResolutionKind::KeepLocal),
            Err(CoreError::ConflictNotFound { .. })
        ));
    }

    #[test]
    fn resolved_conflicts_are_compacted_away() {
        let store = ConflictStore::in_memory();
        let kept = store.record(conflict("kept")).unwrap();
        assert!(!store.compact_if_bloated().unwrap());

        for n in 0..200 {
            let record = store.record(conflict(&n.to_string())).unwrap();
            store.resolve(record.id, ResolutionKind::AcceptRemote).unwrap();
        }
        let before = store.log_size().unwrap();
        assert!(store.compact_if_bloated().unwrap());
        assert!(store.log_size().unwrap() < before);
        assert_eq!(store.pending(), vec![kept]);
        assert!(!store.compact_if_bloated().unwrap());
    }

    #[test]
    fn conflicts_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conflicts.log");

        let (kept, gone) = {
            let store = ConflictStore::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
            let kept = store.record(conflict("1")).unwrap();
            let gone = store.record(conflict("2")).unwrap();
            store.resolve(gone.id, ResolutionKind::AcceptRemote).unwrap();
            (kept, gone)
        };

        let store = ConflictStore::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert_eq!(store.pending(), vec![kept.clone()]);
        assert!(store.get(gone.id).is_none());

        store.compact().unwrap();
        let store = ConflictStore::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert_eq!(store.pending_for(&kept.key).len(), 1);
    }
}
