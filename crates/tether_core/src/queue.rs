//! The sync queue.
//!
//! An ordered, durable log of outbound mutations. Entry IDs are allocated
//! monotonically, so ID order is enqueue order and per-entity FIFO falls out
//! of walking the active map front to back.
//!
//! Entries claimed by the processor are tracked in memory only; after a
//! restart nothing is in flight and every entry is eligible again with its
//! original idempotency key.

use crate::error::{CoreError, CoreResult};
use crate::log::{EventLog, LogKind};
use crate::types::{EntityKey, EntryId, IdempotencyKey, Payload, Timestamp, Verb};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tether_storage::{InMemoryBackend, StorageBackend};
use tracing::{debug, warn};

/// A pending outbound mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Queue-local ID; ordering key.
    pub id: EntryId,
    /// Target entity.
    pub key: EntityKey,
    /// Operation to perform.
    pub verb: Verb,
    /// Payload captured at enqueue time. `None` for deletes.
    pub payload: Option<Payload>,
    /// Remote version the write was made on top of.
    pub base_version: Option<u64>,
    /// Local version of the record this entry carries.
    pub local_version: u64,
    /// Time the entry (or its last reissue) was created.
    pub enqueued_at: Timestamp,
    /// Failed transmissions so far.
    pub attempts: u32,
    /// Earliest time the entry may be transmitted.
    pub next_attempt_at: Timestamp,
    /// Last transient error, for inspection.
    pub last_error: Option<String>,
    /// Stable across retries.
    pub idempotency_key: IdempotencyKey,
}

/// Input to [`SyncQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct NewEntry {
    /// Target entity.
    pub key: EntityKey,
    /// Operation to perform.
    pub verb: Verb,
    /// Payload snapshot.
    pub payload: Option<Payload>,
    /// Remote version the write was made on top of.
    pub base_version: Option<u64>,
    /// Local version of the record after the write.
    pub local_version: u64,
}

/// Replacement content for an entry that must be sent again as a new
/// logical operation (after a conflict was resolved in the client's favor).
#[derive(Debug, Clone)]
pub struct Reissue {
    /// Operation to perform.
    pub verb: Verb,
    /// Payload to send.
    pub payload: Option<Payload>,
    /// New base version, usually the remote version that conflicted.
    pub base_version: Option<u64>,
    /// Local version the payload corresponds to.
    pub local_version: u64,
}

/// Why an entry was moved out of the active queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// Transient failures hit the attempt limit.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error seen.
        last_error: String,
    },
    /// The remote authority rejected the payload as invalid.
    Rejected {
        /// Details from the remote authority.
        details: String,
    },
    /// A permanent error that is not a validation failure.
    Fatal {
        /// Error message.
        message: String,
    },
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            Self::Rejected { details } => write!(f, "rejected: {details}"),
            Self::Fatal { message } => write!(f, "fatal: {message}"),
        }
    }
}

/// An entry parked in the dead-letter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The entry as it was when it was buried.
    pub entry: SyncQueueEntry,
    /// Why it was buried.
    pub reason: DeadLetterReason,
    /// When it was buried.
    pub dead_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
enum QueueEvent {
    Upsert(SyncQueueEntry),
    Remove(EntryId),
    Bury(DeadLetter),
    Revive(SyncQueueEntry),
    Discard(EntryId),
    /// Next entry ID to allocate; written by compaction so IDs are never reused.
    Watermark(u64),
}

#[derive(Default)]
struct QueueState {
    active: BTreeMap<EntryId, SyncQueueEntry>,
    dead: BTreeMap<EntryId, DeadLetter>,
    in_flight: HashSet<EntryId>,
    next_id: u64,
}

impl QueueState {
    fn apply(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Upsert(entry) | QueueEvent::Revive(entry) => {
                self.bump(entry.id);
                self.dead.remove(&entry.id);
                self.active.insert(entry.id, entry);
            }
            QueueEvent::Remove(id) => {
                self.active.remove(&id);
            }
            QueueEvent::Bury(letter) => {
                self.bump(letter.entry.id);
                self.active.remove(&letter.entry.id);
                self.dead.insert(letter.entry.id, letter);
            }
            QueueEvent::Discard(id) => {
                self.dead.remove(&id);
            }
            QueueEvent::Watermark(next_id) => {
                self.next_id = self.next_id.max(next_id);
            }
        }
    }

    fn bump(&mut self, id: EntryId) {
        self.next_id = self.next_id.max(id.0 + 1);
    }

    fn active_entry(&self, id: EntryId) -> CoreResult<&SyncQueueEntry> {
        self.active
            .get(&id)
            .ok_or(CoreError::EntryNotFound { entry_id: id })
    }
}

/// Durable FIFO-per-entity queue of outbound mutations.
pub struct SyncQueue {
    log: EventLog<QueueEvent>,
    state: Mutex<QueueState>,
}

impl SyncQueue {
    /// Opens a queue over `backend`, replaying its log.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let log = EventLog::new(backend, LogKind::Queue);
        let mut state = QueueState {
            next_id: 1,
            ..QueueState::default()
        };
        for event in log.replay()? {
            state.apply(event);
        }

        debug!(
            active = state.active.len(),
            dead = state.dead.len(),
            "sync queue opened"
        );
        Ok(Self {
            log,
            state: Mutex::new(state),
        })
    }

    /// Creates an empty queue that lives in memory.
    pub fn in_memory() -> Self {
        Self {
            log: EventLog::new(Box::new(InMemoryBackend::new()), LogKind::Queue),
            state: Mutex::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            }),
        }
    }

    /// Appends a mutation, or folds it into a pending update.
    ///
    /// An update is coalesced into the entity's newest entry when that entry
    /// is also an update that has never been attempted and is not in flight.
    /// The surviving entry keeps its ID, position and idempotency key.
    /// Returns the stored entry and whether it was coalesced.
    pub fn enqueue(&self, new: NewEntry) -> CoreResult<(SyncQueueEntry, bool)> {
        let mut state = self.state.lock();

        if new.verb == Verb::Update {
            let newest = state.active.values().rev().find(|e| e.key == new.key);
            if let Some(newest) = newest {
                let foldable = newest.verb == Verb::Update
                    && newest.attempts == 0
                    && !state.in_flight.contains(&newest.id);
                if foldable {
                    let entry = SyncQueueEntry {
                        payload: new.payload,
                        local_version: new.local_version,
                        ..newest.clone()
                    };
                    self.log.append(&QueueEvent::Upsert(entry.clone()))?;
                    state.active.insert(entry.id, entry.clone());
                    debug!(entry = %entry.id, key = %entry.key, "coalesced update");
                    return Ok((entry, true));
                }
            }
        }

        let id = EntryId(state.next_id);
        let now = Timestamp::now();
        let entry = SyncQueueEntry {
            id,
            idempotency_key: IdempotencyKey::derive(&new.key, new.verb, now, id),
            key: new.key,
            verb: new.verb,
            payload: new.payload,
            base_version: new.base_version,
            local_version: new.local_version,
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
        };

        self.log.append(&QueueEvent::Upsert(entry.clone()))?;
        state.next_id += 1;
        state.active.insert(id, entry.clone());
        debug!(entry = %id, key = %entry.key, verb = %entry.verb, "enqueued");
        Ok((entry, false))
    }

    /// Oldest active entry, for one entity or across all of them.
    pub fn peek_next(&self, key: Option<&EntityKey>) -> Option<SyncQueueEntry> {
        let state = self.state.lock();
        state
            .active
            .values()
            .find(|e| key.map_or(true, |k| &e.key == k))
            .cloned()
    }

    /// The head entry of every entity that may be transmitted at `now`.
    ///
    /// An entity is skipped while its head is in flight, backing off, or
    /// `exclude` returns true for it. Later entries never overtake the head.
    pub fn eligible_heads<F>(&self, now: Timestamp, exclude: F) -> Vec<SyncQueueEntry>
    where
        F: Fn(&EntityKey) -> bool,
    {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        let mut heads = Vec::new();

        for entry in state.active.values() {
            if !seen.insert(&entry.key) {
                continue;
            }
            if state.in_flight.contains(&entry.id) || entry.next_attempt_at > now {
                continue;
            }
            if exclude(&entry.key) {
                continue;
            }
            heads.push(entry.clone());
        }
        heads
    }

    /// Marks an entry as being transmitted.
    ///
    /// Returns false if it is gone or already claimed.
    pub fn claim(&self, id: EntryId) -> bool {
        let mut state = self.state.lock();
        state.active.contains_key(&id) && state.in_flight.insert(id)
    }

    /// Releases a claim without changing the entry.
    pub fn release(&self, id: EntryId) {
        self.state.lock().in_flight.remove(&id);
    }

    /// Looks up an active entry.
    pub fn get(&self, id: EntryId) -> Option<SyncQueueEntry> {
        self.state.lock().active.get(&id).cloned()
    }

    /// Deletes an entry after a confirmed apply.
    pub fn remove(&self, id: EntryId) -> CoreResult<SyncQueueEntry> {
        let mut state = self.state.lock();
        state.active_entry(id)?;
        self.log.append(&QueueEvent::Remove(id))?;
        state.in_flight.remove(&id);
        state
            .active
            .remove(&id)
            .ok_or(CoreError::EntryNotFound { entry_id: id })
    }

    /// Records a transient failure and schedules the next attempt.
    pub fn requeue(&self, id: EntryId, delay: Duration, error: &str) -> CoreResult<SyncQueueEntry> {
        let mut state = self.state.lock();
        let current = state.active_entry(id)?;
        let entry = SyncQueueEntry {
            attempts: current.attempts.saturating_add(1),
            next_attempt_at: Timestamp::now().after(delay),
            last_error: Some(error.to_string()),
            ..current.clone()
        };

        self.log.append(&QueueEvent::Upsert(entry.clone()))?;
        state.in_flight.remove(&id);
        state.active.insert(id, entry.clone());
        debug!(
            entry = %id,
            attempts = entry.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "requeued"
        );
        Ok(entry)
    }

    /// Moves an entry to the dead-letter set.
    pub fn dead_letter(&self, id: EntryId, reason: DeadLetterReason) -> CoreResult<DeadLetter> {
        let mut state = self.state.lock();
        let entry = state.active_entry(id)?.clone();
        let letter = DeadLetter {
            entry,
            reason,
            dead_at: Timestamp::now(),
        };

        self.log.append(&QueueEvent::Bury(letter.clone()))?;
        state.in_flight.remove(&id);
        state.active.remove(&id);
        state.dead.insert(id, letter.clone());
        warn!(entry = %id, key = %letter.entry.key, reason = %letter.reason, "dead-lettered");
        Ok(letter)
    }

    /// Replaces an entry's content in place with a new logical operation.
    ///
    /// The entry keeps its position but gets a fresh idempotency key and
    /// attempt counter, since the remote authority must treat it as new.
    pub fn reissue(&self, id: EntryId, reissue: Reissue) -> CoreResult<SyncQueueEntry> {
        let mut state = self.state.lock();
        let current = state.active_entry(id)?;

        // keys derive from the timestamp, so never reuse the previous one
        let now = Timestamp::now().max(current.enqueued_at.after(Duration::from_millis(1)));
        let entry = SyncQueueEntry {
            idempotency_key: IdempotencyKey::derive(&current.key, reissue.verb, now, id),
            verb: reissue.verb,
            payload: reissue.payload,
            base_version: reissue.base_version,
            local_version: reissue.local_version,
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            ..current.clone()
        };

        self.log.append(&QueueEvent::Upsert(entry.clone()))?;
        state.in_flight.remove(&id);
        state.active.insert(id, entry.clone());
        debug!(entry = %id, key = %entry.key, "reissued");
        Ok(entry)
    }

    /// Points every idle entry of `key` at a new base version.
    ///
    /// Returns how many entries changed.
    pub fn rebase(&self, key: &EntityKey, base_version: u64) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let updated: Vec<SyncQueueEntry> = state
            .active
            .values()
            .filter(|e| &e.key == key && !state.in_flight.contains(&e.id))
            .filter(|e| e.base_version != Some(base_version))
            .map(|e| SyncQueueEntry {
                base_version: Some(base_version),
                ..e.clone()
            })
            .collect();
        if updated.is_empty() {
            return Ok(0);
        }

        let events: Vec<QueueEvent> = updated.iter().cloned().map(QueueEvent::Upsert).collect();
        self.log.append_all(&events)?;
        for entry in &updated {
            state.active.insert(entry.id, entry.clone());
        }
        Ok(updated.len())
    }

    /// Drops every active entry for `key`, claimed ones included.
    pub fn drop_entity(&self, key: &EntityKey) -> CoreResult<Vec<EntryId>> {
        let mut state = self.state.lock();
        let ids: Vec<EntryId> = state
            .active
            .values()
            .filter(|e| &e.key == key)
            .map(|e| e.id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }

        let events: Vec<QueueEvent> = ids.iter().copied().map(QueueEvent::Remove).collect();
        self.log.append_all(&events)?;
        for id in &ids {
            state.active.remove(id);
            state.in_flight.remove(id);
        }
        debug!(key = %key, dropped = ids.len(), "dropped queued entries");
        Ok(ids)
    }

    /// All active entries in enqueue order.
    pub fn entries(&self) -> Vec<SyncQueueEntry> {
        self.state.lock().active.values().cloned().collect()
    }

    /// Active entries for one entity in enqueue order.
    pub fn entries_for(&self, key: &EntityKey) -> Vec<SyncQueueEntry> {
        self.state
            .lock()
            .active
            .values()
            .filter(|e| &e.key == key)
            .cloned()
            .collect()
    }

    /// Returns true if `key` has an active or dead-lettered entry.
    pub fn has_entries_for(&self, key: &EntityKey) -> bool {
        let state = self.state.lock();
        state.active.values().any(|e| &e.key == key)
            || state.dead.values().any(|d| &d.entry.key == key)
    }

    /// The dead-letter set in ID order.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.values().cloned().collect()
    }

    /// Moves a dead letter back into the active queue.
    ///
    /// The entry keeps its idempotency key, so an apply that did reach the
    /// remote authority is not repeated. Its attempt counter starts over.
    pub fn revive(&self, id: EntryId) -> CoreResult<SyncQueueEntry> {
        let mut state = self.state.lock();
        let letter = state
            .dead
            .get(&id)
            .ok_or(CoreError::EntryNotFound { entry_id: id })?;
        let entry = SyncQueueEntry {
            attempts: 0,
            next_attempt_at: Timestamp::now(),
            last_error: None,
            ..letter.entry.clone()
        };

        self.log.append(&QueueEvent::Revive(entry.clone()))?;
        state.dead.remove(&id);
        state.active.insert(id, entry.clone());
        debug!(entry = %id, "revived dead letter");
        Ok(entry)
    }

    /// Permanently deletes a dead letter.
    pub fn discard(&self, id: EntryId) -> CoreResult<DeadLetter> {
        let mut state = self.state.lock();
        if !state.dead.contains_key(&id) {
            return Err(CoreError::EntryNotFound { entry_id: id });
        }
        self.log.append(&QueueEvent::Discard(id))?;
        state
            .dead
            .remove(&id)
            .ok_or(CoreError::EntryNotFound { entry_id: id })
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Returns true if no entry is active.
    pub fn is_empty(&self) -> bool {
        self.state.lock().active.is_empty()
    }

    /// Number of dead letters.
    pub fn dead_count(&self) -> usize {
        self.state.lock().dead.len()
    }

    /// Rewrites the log to contain only the live entries.
    pub fn compact(&self) -> CoreResult<()> {
        let state = self.state.lock();
        self.rewrite(&state)
    }

    /// Compacts the log if removed entries dominate it.
    ///
    /// Returns true if the log was rewritten.
    pub fn compact_if_bloated(&self) -> CoreResult<bool> {
        let state = self.state.lock();
        if !self.log.is_bloated(state.active.len() + state.dead.len() + 1) {
            return Ok(false);
        }
        self.rewrite(&state)?;
        Ok(true)
    }

    /// Size of the queue log in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.log.size()
    }

    fn rewrite(&self, state: &QueueState) -> CoreResult<()> {
        let events: Vec<QueueEvent> = std::iter::once(QueueEvent::Watermark(state.next_id))
            .chain(state.active.values().cloned().map(QueueEvent::Upsert))
            .chain(state.dead.values().cloned().map(QueueEvent::Bury))
            .collect();
        self.log.rewrite(&events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tether_storage::FileBackend;

    fn update(key: &EntityKey, name: &str, local_version: u64) -> NewEntry {
        NewEntry {
            key: key.clone(),
            verb: Verb::Update,
            payload: Some(json!({ "name": name })),
            base_version: Some(1),
            local_version,
        }
    }

    fn later() -> Timestamp {
        Timestamp::now().after(Duration::from_secs(3600))
    }

    #[test]
    fn consecutive_updates_coalesce() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "42");

        let (first, merged) = queue.enqueue(update(&key, "A", 2)).unwrap();
        assert!(!merged);
        let (_, merged) = queue.enqueue(update(&key, "B", 3)).unwrap();
        assert!(merged);
        let (last, merged) = queue.enqueue(update(&key, "C", 4)).unwrap();
        assert!(merged);

        assert_eq!(queue.len(), 1);
        assert_eq!(last.id, first.id);
        assert_eq!(last.idempotency_key, first.idempotency_key);
        assert_eq!(last.payload, Some(json!({"name": "C"})));
        assert_eq!(last.local_version, 4);
    }

    #[test]
    fn creates_and_deletes_are_never_coalesced() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("note", "1");

        queue
            .enqueue(NewEntry {
                verb: Verb::Create,
                base_version: None,
                ..update(&key, "A", 1)
            })
            .unwrap();
        queue.enqueue(update(&key, "B", 2)).unwrap();
        queue
            .enqueue(NewEntry {
                key: key.clone(),
                verb: Verb::Delete,
                payload: None,
                base_version: None,
                local_version: 3,
            })
            .unwrap();
        let (_, merged) = queue.enqueue(update(&key, "C", 4)).unwrap();
        assert!(!merged);

        let verbs: Vec<Verb> = queue.entries_for(&key).iter().map(|e| e.verb).collect();
        assert_eq!(verbs, vec![Verb::Create, Verb::Update, Verb::Delete, Verb::Update]);
    }

    #[test]
    fn attempted_or_claimed_entries_are_not_coalesced() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "1");

        let (first, _) = queue.enqueue(update(&key, "A", 1)).unwrap();
        assert!(queue.claim(first.id));
        let (_, merged) = queue.enqueue(update(&key, "B", 2)).unwrap();
        assert!(!merged);

        let (second, _) = queue.enqueue(update(&key, "C", 3)).unwrap();
        queue.requeue(second.id, Duration::ZERO, "timeout").unwrap();
        let (_, merged) = queue.enqueue(update(&key, "D", 4)).unwrap();
        assert!(!merged);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn heads_respect_claims_and_backoff() {
        let queue = SyncQueue::in_memory();
        let a = EntityKey::new("c", "a");
        let b = EntityKey::new("c", "b");
        let c = EntityKey::new("c", "c");

        let (a1, _) = queue
            .enqueue(NewEntry { verb: Verb::Create, ..update(&a, "1", 1) })
            .unwrap();
        queue.enqueue(update(&a, "2", 2)).unwrap();
        let (b1, _) = queue.enqueue(update(&b, "1", 1)).unwrap();
        let (c1, _) = queue.enqueue(update(&c, "1", 1)).unwrap();

        let heads = queue.eligible_heads(later(), |_| false);
        let ids: Vec<EntryId> = heads.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a1.id, b1.id, c1.id]);

        assert!(queue.claim(a1.id));
        assert!(!queue.claim(a1.id));
        queue
            .requeue(b1.id, Duration::from_secs(60), "503")
            .unwrap();

        let heads = queue.eligible_heads(Timestamp::now(), |k| k == &c);
        assert!(heads.is_empty());

        let heads = queue.eligible_heads(later(), |_| false);
        let ids: Vec<EntryId> = heads.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b1.id, c1.id]);
    }

    #[test]
    fn requeue_keeps_idempotency_key() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "1");
        let (entry, _) = queue.enqueue(update(&key, "A", 1)).unwrap();

        queue.claim(entry.id);
        let retried = queue
            .requeue(entry.id, Duration::from_secs(2), "connection reset")
            .unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.idempotency_key, entry.idempotency_key);
        assert!(retried.next_attempt_at >= entry.enqueued_at.after(Duration::from_secs(2)));
        assert_eq!(retried.last_error.as_deref(), Some("connection reset"));
        assert!(queue.claim(entry.id));
    }

    #[test]
    fn reissue_keeps_position_with_new_key() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "1");
        let (first, _) = queue.enqueue(update(&key, "A", 1)).unwrap();
        let (second, _) = queue
            .enqueue(NewEntry { verb: Verb::Delete, payload: None, ..update(&key, "", 2) })
            .unwrap();
        queue.requeue(first.id, Duration::ZERO, "timeout").unwrap();

        let reissued = queue
            .reissue(
                first.id,
                Reissue {
                    verb: Verb::Update,
                    payload: Some(json!({"name": "A"})),
                    base_version: Some(5),
                    local_version: 1,
                },
            )
            .unwrap();
        assert_eq!(reissued.attempts, 0);
        assert_eq!(reissued.base_version, Some(5));
        assert_ne!(reissued.idempotency_key, first.idempotency_key);

        let ids: Vec<EntryId> = queue.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn rebase_skips_claimed_entries() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "1");
        let (first, _) = queue
            .enqueue(NewEntry { verb: Verb::Create, base_version: None, ..update(&key, "A", 1) })
            .unwrap();
        queue
            .enqueue(NewEntry { verb: Verb::Delete, payload: None, base_version: None, ..update(&key, "", 2) })
            .unwrap();

        queue.claim(first.id);
        assert_eq!(queue.rebase(&key, 7).unwrap(), 1);
        let entries = queue.entries_for(&key);
        assert_eq!(entries[0].base_version, None);
        assert_eq!(entries[1].base_version, Some(7));
        assert_eq!(queue.rebase(&key, 7).unwrap(), 0);
    }

    #[test]
    fn dead_letters_revive_and_discard() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "1");
        let (entry, _) = queue.enqueue(update(&key, "A", 1)).unwrap();
        let (other, _) = queue.enqueue(update(&EntityKey::new("profile", "2"), "B", 1)).unwrap();

        queue
            .dead_letter(entry.id, DeadLetterReason::Rejected { details: "bad name".into() })
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dead_count(), 1);
        assert!(queue.has_entries_for(&key));
        assert_eq!(queue.peek_next(None).unwrap().id, other.id);

        let revived = queue.revive(entry.id).unwrap();
        assert_eq!(revived.idempotency_key, entry.idempotency_key);
        assert_eq!(queue.dead_count(), 0);
        assert_eq!(queue.peek_next(None).unwrap().id, entry.id);

        queue
            .dead_letter(entry.id, DeadLetterReason::Fatal { message: "x".into() })
            .unwrap();
        queue.discard(entry.id).unwrap();
        assert!(!queue.has_entries_for(&key));
        assert!(matches!(
            queue.discard(entry.id),
            Err(CoreError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn drop_entity_clears_claims() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("note", "7");
        let (first, _) = queue.enqueue(update(&key, "A", 2)).unwrap();
        queue
            .enqueue(NewEntry { verb: Verb::Delete, payload: None, ..update(&key, "", 3) })
            .unwrap();
        queue.claim(first.id);

        assert_eq!(queue.drop_entity(&key).unwrap().len(), 2);
        assert!(queue.is_empty());
        assert!(!queue.claim(first.id));
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let key = EntityKey::new("profile", "1");

        let (kept, buried) = {
            let queue = SyncQueue::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
            let (done, _) = queue.enqueue(update(&key, "A", 1)).unwrap();
            let (kept, _) = queue
                .enqueue(NewEntry { verb: Verb::Delete, payload: None, ..update(&key, "", 2) })
                .unwrap();
            let (buried, _) = queue.enqueue(update(&EntityKey::new("x", "y"), "Z", 1)).unwrap();
            queue.remove(done.id).unwrap();
            queue.claim(kept.id);
            queue.requeue(kept.id, Duration::ZERO, "timeout").unwrap();
            queue
                .dead_letter(buried.id, DeadLetterReason::Rejected { details: "no".into() })
                .unwrap();
            queue.compact().unwrap();
            (kept, buried)
        };

        let queue = SyncQueue::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, kept.id);
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[0].idempotency_key, kept.idempotency_key);
        assert!(queue.claim(kept.id));
        assert_eq!(queue.dead_letters()[0].entry.id, buried.id);

        let (fresh, _) = queue.enqueue(update(&key, "B", 3)).unwrap();
        assert!(fresh.id > buried.id);
    }

    #[test]
    fn ids_are_not_reused_after_compacting_an_empty_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let key = EntityKey::new("profile", "1");

        let last = {
            let queue = SyncQueue::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
            let mut last = EntryId(0);
            for n in 0..3 {
                let (entry, _) = queue
                    .enqueue(NewEntry { verb: Verb::Create, ..update(&key, "A", n) })
                    .unwrap();
                queue.remove(entry.id).unwrap();
                last = entry.id;
            }
            queue.compact().unwrap();
            last
        };

        let queue = SyncQueue::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert!(queue.is_empty());
        let (fresh, _) = queue.enqueue(update(&key, "B", 4)).unwrap();
        assert!(fresh.id > last);
    }

    #[test]
    fn bloated_log_is_compacted() {
        let queue = SyncQueue::in_memory();
        let key = EntityKey::new("profile", "1");
        let (pending, _) = queue.enqueue(update(&key, "keep", 1)).unwrap();
        assert!(!queue.compact_if_bloated().unwrap());

        for n in 0..200 {
            let other = EntityKey::new("log", n.to_string());
            let (entry, _) = queue.enqueue(update(&other, "x", 1)).unwrap();
            queue.remove(entry.id).unwrap();
        }
        let before = queue.log_size().unwrap();
        assert!(queue.compact_if_bloated().unwrap());
        assert!(queue.log_size().unwrap() < before);
        assert_eq!(queue.entries(), vec![pending]);
        assert!(!queue.compact_if_bloated().unwrap());
    }

    fn verb_for(code: u8) -> Verb {
        match code % 3 {
            0 => Verb::Create,
            1 => Verb::Update,
            _ => Verb::Delete,
        }
    }

    proptest! {
        #[test]
        fn drain_preserves_per_entity_order(ops in prop::collection::vec((0u8..4, 0u8..3), 1..60)) {
            let queue = SyncQueue::in_memory();
            let mut latest: HashMap<EntityKey, u64> = HashMap::new();

            for (entity, code) in ops {
                let key = EntityKey::new("c", entity.to_string());
                let version = latest.get(&key).copied().unwrap_or(0) + 1;
                latest.insert(key.clone(), version);
                queue.enqueue(NewEntry {
                    key,
                    verb: verb_for(code),
                    payload: Some(json!(version)),
                    base_version: None,
                    local_version: version,
                }).unwrap();
            }

            let mut observed: HashMap<EntityKey, Vec<u64>> = HashMap::new();
            loop {
                let heads = queue.eligible_heads(later(), |_| false);
                if heads.is_empty() {
                    break;
                }
                let mut keys = HashSet::new();
                for head in heads {
                    prop_assert!(keys.insert(head.key.clone()));
                    prop_assert_eq!(queue.peek_next(Some(&head.key)).map(|e| e.id), Some(head.id));
                    prop_assert!(queue.claim(head.id));
                    queue.remove(head.id).unwrap();
                    observed.entry(head.key).or_default().push(head.local_version);
                }
            }

            prop_assert!(queue.is_empty());
            for (key, versions) in observed {
                prop_assert!(versions.windows(2).all(|w| w[0] < w[1]));
                prop_assert_eq!(versions.last().copied(), latest.get(&key).copied());
            }
        }
    }
}
