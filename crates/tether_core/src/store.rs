//! Local record store.
//!
//! Holds every entity the client knows about, keyed by `(collection, id)`,
//! and answers reads immediately regardless of sync state. All mutations are
//! appended to the record log before they become visible, and the write lock
//! is held across the append, so concurrent writers to the same key are
//! serialized and a failed append leaves memory untouched.
//!
//! Removing a record does not forget its last remote version. Writing the
//! key again starts from that version, so a re-created entity is sent on top
//! of the remote tombstone rather than as a blind create.

use crate::error::{CoreError, CoreResult};
use crate::log::{EventLog, LogKind};
use crate::record::LocalRecord;
use crate::types::{EntityKey, Payload, SyncState, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_storage::{InMemoryBackend, StorageBackend};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
enum RecordEvent {
    Upsert(LocalRecord),
    Purge {
        key: EntityKey,
        remote_version: Option<u64>,
    },
}

struct Slot {
    record: LocalRecord,
    /// Access clock value at the last read or write; drives LRU eviction.
    last_access: AtomicU64,
}

/// Result of a local write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// The record after the write.
    pub record: LocalRecord,
    /// True if no live record existed before (absent or tombstoned).
    pub created: bool,
}

/// Result of reconciling a confirmed remote apply with the local record.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// The record now matches the remote authority.
    Synced(LocalRecord),
    /// A newer local write exists; only the remote version was recorded.
    Superseded(LocalRecord),
    /// A confirmed delete removed the tombstone.
    Purged,
    /// The record no longer exists locally.
    Missing,
}

/// Durable key-value store of local records.
pub struct LocalRecordStore {
    log: EventLog<RecordEvent>,
    records: RwLock<HashMap<EntityKey, Slot>>,
    /// Last remote version of removed records. Locked after `records`.
    removed: RwLock<HashMap<EntityKey, u64>>,
    clock: AtomicU64,
}

impl LocalRecordStore {
    /// Opens a store over `backend`, replaying its log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or unreadable.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let log = EventLog::new(backend, LogKind::Records);
        let mut records = HashMap::new();
        let mut removed = HashMap::new();
        let mut clock = 0u64;

        for event in log.replay()? {
            match event {
                RecordEvent::Upsert(record) => {
                    clock += 1;
                    removed.remove(&record.key);
                    records.insert(
                        record.key.clone(),
                        Slot {
                            record,
                            last_access: AtomicU64::new(clock),
                        },
                    );
                }
                RecordEvent::Purge {
                    key,
                    remote_version,
                } => {
                    records.remove(&key);
                    if let Some(version) = remote_version {
                        remove_at(&mut removed, key, version);
                    }
                }
            }
        }

        debug!(records = records.len(), removed = removed.len(), "record store opened");
        Ok(Self {
            log,
            records: RwLock::new(records),
            removed: RwLock::new(removed),
            clock: AtomicU64::new(clock),
        })
    }

    /// Creates an empty store that lives in memory.
    pub fn in_memory() -> Self {
        Self {
            log: EventLog::new(Box::new(InMemoryBackend::new()), LogKind::Records),
            records: RwLock::new(HashMap::new()),
            removed: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Persists the removal of `key` and remembers `remote_version`.
    fn drop_record(
        &self,
        records: &mut HashMap<EntityKey, Slot>,
        key: &EntityKey,
        remote_version: Option<u64>,
    ) -> CoreResult<()> {
        self.log.append(&RecordEvent::Purge {
            key: key.clone(),
            remote_version,
        })?;
        records.remove(key);
        if let Some(version) = remote_version {
            remove_at(&mut self.removed.write(), key.clone(), version);
        }
        Ok(())
    }

    /// Persists `record` and installs it in `records`.
    fn commit(
        &self,
        records: &mut HashMap<EntityKey, Slot>,
        record: LocalRecord,
    ) -> CoreResult<LocalRecord> {
        self.log.append(&RecordEvent::Upsert(record.clone()))?;
        self.removed.write().remove(&record.key);
        records.insert(
            record.key.clone(),
            Slot {
                record: record.clone(),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        Ok(record)
    }

    /// Upserts a record as `Unsynced`, bumping its local version.
    pub fn put(&self, key: &EntityKey, payload: Payload) -> CoreResult<LocalRecord> {
        self.write(key, payload).map(|outcome| outcome.record)
    }

    /// Upserts a record as `Unsynced` and reports whether it was new.
    ///
    /// Writing over a tombstone, or over a key whose record was removed,
    /// counts as a create. The last known remote version is kept as the
    /// base so versions keep increasing.
    pub fn write(&self, key: &EntityKey, payload: Payload) -> CoreResult<WriteOutcome> {
        let mut records = self.records.write();
        let previous = records.get(key).map(|slot| &slot.record);

        let created = previous.map_or(true, LocalRecord::is_tombstoned);
        let remote_version = match previous {
            Some(record) => record.remote_version,
            None => self.removed.read().get(key).copied(),
        };
        let record = LocalRecord {
            key: key.clone(),
            payload,
            sync_state: SyncState::Unsynced,
            local_version: previous.map_or_else(
                || remote_version.map_or(1, |v| v + 1),
                LocalRecord::next_version,
            ),
            remote_version,
            updated_at: Timestamp::now(),
        };

        let record = self.commit(&mut records, record)?;
        Ok(WriteOutcome { record, created })
    }

    /// Upserts a record fetched from the remote authority as `Synced`.
    pub fn put_synced(
        &self,
        key: &EntityKey,
        payload: Payload,
        remote_version: u64,
    ) -> CoreResult<LocalRecord> {
        let mut records = self.records.write();
        let record = LocalRecord {
            key: key.clone(),
            payload,
            sync_state: SyncState::Synced,
            local_version: remote_version,
            remote_version: Some(remote_version),
            updated_at: Timestamp::now(),
        };
        self.commit(&mut records, record)
    }

    /// Returns the live record, never a tombstone.
    pub fn get(&self, key: &EntityKey) -> Option<LocalRecord> {
        let records = self.records.read();
        let slot = records.get(key)?;
        if slot.record.is_tombstoned() {
            return None;
        }
        slot.last_access.store(self.tick(), Ordering::Relaxed);
        Some(slot.record.clone())
    }

    /// Returns the record in any state, tombstones included.
    pub fn inspect(&self, key: &EntityKey) -> Option<LocalRecord> {
        self.records.read().get(key).map(|slot| slot.record.clone())
    }

    /// Live records of a collection, in no particular order.
    pub fn list(&self, collection: &str) -> Vec<LocalRecord> {
        self.records
            .read()
            .values()
            .map(|slot| &slot.record)
            .filter(|r| r.collection() == collection && !r.is_tombstoned())
            .cloned()
            .collect()
    }

    /// Every record, tombstones included.
    pub fn records(&self) -> Vec<LocalRecord> {
        self.records
            .read()
            .values()
            .map(|slot| slot.record.clone())
            .collect()
    }

    /// Marks a record as confirmed at `remote_version`.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` if absent, `InvalidTransition` for a tombstone.
    pub fn mark_synced(&self, key: &EntityKey, remote_version: u64) -> CoreResult<LocalRecord> {
        let mut records = self.records.write();
        let current = Self::live(&records, key)?;
        if current.is_tombstoned() {
            return Err(CoreError::InvalidTransition {
                key: key.clone(),
                from: current.sync_state,
                to: SyncState::Synced,
            });
        }

        let record = LocalRecord {
            sync_state: SyncState::Synced,
            local_version: remote_version,
            remote_version: Some(remote_version),
            updated_at: Timestamp::now(),
            ..current.clone()
        };
        self.commit(&mut records, record)
    }

    /// Marks a record as waiting on a conflict decision.
    pub fn mark_conflicted(&self, key: &EntityKey) -> CoreResult<LocalRecord> {
        let mut records = self.records.write();
        let current = Self::live(&records, key)?;
        if current.sync_state == SyncState::Conflicted {
            return Ok(current.clone());
        }
        let record = LocalRecord {
            sync_state: SyncState::Conflicted,
            ..current.clone()
        };
        self.commit(&mut records, record)
    }

    /// Soft-deletes a record. Idempotent on an existing tombstone.
    ///
    /// The tombstone stays until the delete is confirmed remotely.
    pub fn mark_deleted(&self, key: &EntityKey) -> CoreResult<LocalRecord> {
        let mut records = self.records.write();
        let current = Self::live(&records, key)?;
        if current.is_tombstoned() {
            return Ok(current.clone());
        }

        let record = LocalRecord {
            sync_state: SyncState::TombstonedUnsynced,
            local_version: current.next_version(),
            updated_at: Timestamp::now(),
            ..current.clone()
        };
        self.commit(&mut records, record)
    }

    /// Records the latest remote version without touching content or state.
    pub fn rebase_remote(&self, key: &EntityKey, remote_version: u64) -> CoreResult<()> {
        let mut records = self.records.write();
        let Some(slot) = records.get(key) else {
            return Ok(());
        };
        if slot.record.remote_version == Some(remote_version) {
            return Ok(());
        }
        let record = LocalRecord {
            remote_version: Some(remote_version),
            ..slot.record.clone()
        };
        self.commit(&mut records, record)?;
        Ok(())
    }

    /// Reconciles a remote apply of the write made at `sent_local_version`.
    ///
    /// If no newer local write happened since, the record becomes `Synced`
    /// (with `canonical` fields overlaid) or, for a tombstone, is purged.
    /// Otherwise only the remote version is recorded.
    pub fn confirm(
        &self,
        key: &EntityKey,
        sent_local_version: u64,
        remote_version: u64,
        canonical: Option<&Payload>,
    ) -> CoreResult<Confirmation> {
        let mut records = self.records.write();
        let Some(current) = records.get(key).map(|slot| slot.record.clone()) else {
            return Ok(Confirmation::Missing);
        };

        if current.local_version != sent_local_version {
            let record = LocalRecord {
                remote_version: Some(remote_version),
                ..current
            };
            return self
                .commit(&mut records, record)
                .map(Confirmation::Superseded);
        }

        if current.is_tombstoned() {
            self.drop_record(&mut records, key, Some(remote_version))?;
            return Ok(Confirmation::Purged);
        }

        let payload = match canonical {
            Some(canonical) => overlay(&current.payload, canonical),
            None => current.payload.clone(),
        };
        let record = LocalRecord {
            payload,
            sync_state: SyncState::Synced,
            local_version: remote_version,
            remote_version: Some(remote_version),
            updated_at: Timestamp::now(),
            key: current.key,
        };
        self.commit(&mut records, record).map(Confirmation::Synced)
    }

    /// Physically removes a record.
    pub fn purge(&self, key: &EntityKey) -> CoreResult<()> {
        let mut records = self.records.write();
        let remote_version = Self::live(&records, key)?.remote_version;
        self.drop_record(&mut records, key, remote_version)
    }

    /// Removes any local copy of a record the remote authority deleted at
    /// `remote_version`.
    pub fn forget(&self, key: &EntityKey, remote_version: u64) -> CoreResult<()> {
        let mut records = self.records.write();
        self.drop_record(&mut records, key, Some(remote_version))
    }

    /// Last remote version of a record that is no longer stored locally.
    pub fn removed_version(&self, key: &EntityKey) -> Option<u64> {
        self.removed.read().get(key).copied()
    }

    /// Purges up to `count` least-recently-used `Synced` records.
    ///
    /// Records with unconfirmed changes are never evicted. The log is
    /// rewritten without the victims, so eviction reclaims space even when
    /// the backend is already full.
    pub fn evict_synced(&self, count: usize) -> CoreResult<Vec<EntityKey>> {
        let mut records = self.records.write();
        let mut candidates: Vec<(u64, EntityKey)> = records
            .iter()
            .filter(|(_, slot)| slot.record.is_synced())
            .map(|(key, slot)| (slot.last_access.load(Ordering::Relaxed), key.clone()))
            .collect();
        candidates.sort();
        let victims: Vec<EntityKey> = candidates.into_iter().take(count).map(|(_, k)| k).collect();
        if victims.is_empty() {
            return Ok(victims);
        }

        let mut removed = self.removed.write();
        let mut after = removed.clone();
        for key in &victims {
            if let Some(version) = records.get(key).and_then(|slot| slot.record.remote_version) {
                remove_at(&mut after, key.clone(), version);
            }
        }
        let survivors = records.iter().filter(|(key, _)| !victims.contains(*key));
        self.log.rewrite(&snapshot(survivors, &after))?;
        for key in &victims {
            records.remove(key);
        }
        *removed = after;

        debug!(evicted = victims.len(), "evicted synced records");
        Ok(victims)
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Rewrites the log to contain only the current records.
    pub fn compact(&self) -> CoreResult<()> {
        let records = self.records.read();
        let removed = self.removed.read();
        self.log.rewrite(&snapshot(records.iter(), &removed))
    }

    /// Compacts the log if superseded events dominate it.
    ///
    /// Returns true if the log was rewritten.
    pub fn compact_if_bloated(&self) -> CoreResult<bool> {
        let records = self.records.read();
        let removed = self.removed.read();
        if !self.log.is_bloated(records.len() + removed.len()) {
            return Ok(false);
        }
        self.log.rewrite(&snapshot(records.iter(), &removed))?;
        debug!(records = records.len(), removed = removed.len(), "record log compacted");
        Ok(true)
    }

    /// Size of the record log in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.log.size()
    }

    fn live<'a>(
        records: &'a HashMap<EntityKey, Slot>,
        key: &EntityKey,
    ) -> CoreResult<&'a LocalRecord> {
        records
            .get(key)
            .map(|slot| &slot.record)
            .ok_or_else(|| CoreError::RecordNotFound { key: key.clone() })
    }
}

fn remove_at(removed: &mut HashMap<EntityKey, u64>, key: EntityKey, version: u64) {
    let known = removed.entry(key).or_insert(version);
    *known = (*known).max(version);
}

/// Events that rebuild the given records and removal markers.
fn snapshot<'a>(
    records: impl Iterator<Item = (&'a EntityKey, &'a Slot)>,
    removed: &HashMap<EntityKey, u64>,
) -> Vec<RecordEvent> {
    records
        .map(|(_, slot)| RecordEvent::Upsert(slot.record.clone()))
        .chain(removed.iter().map(|(key, &version)| RecordEvent::Purge {
            key: key.clone(),
            remote_version: Some(version),
        }))
        .collect()
}

/// Overlays authoritative fields onto a local payload.
///
/// When both are JSON objects the result keeps local fields and takes every
/// field present in `authoritative`; otherwise `authoritative` replaces local.
pub fn overlay(local: &Payload, authoritative: &Payload) -> Payload {
    match (local, authoritative) {
        (Payload::Object(local), Payload::Object(remote)) => {
            let mut merged = local.clone();
            for (field, value) in remote {
                merged.insert(field.clone(), value.clone());
            }
            Payload::Object(merged)
        }
        _ => authoritative.clone(),
    }
}
