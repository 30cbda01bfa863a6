//! The queue processor.
//!
//! Drains the sync queue against the remote authority in rounds. Each round
//! takes the head entry of every eligible entity and transmits them on a
//! bounded pool of scoped worker threads. Heads are one per entity, so two
//! operations for the same entity are never in flight together.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::locks::KeyLocks;
use crate::remote::{ApplyOutcome, ApplyRequest, RemoteAuthority};
use crate::resolver::{ConflictResolver, Resolution};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether_core::{
    ConflictId, ConflictRecord, ConflictStatus, ConflictStore, DeadLetterReason, LocalRecordStore,
    NewEntry, Payload, Reissue, SyncQueue, SyncQueueEntry, Timestamp, Verb,
};
use tracing::{debug, info, warn};

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Entries confirmed by the remote authority.
    pub applied: usize,
    /// Conflicts settled automatically.
    pub conflicts_resolved: usize,
    /// Conflicts parked for a manual decision.
    pub conflicts_pending: usize,
    /// Transient failures scheduled for retry.
    pub requeued: usize,
    /// Entries moved to the dead-letter set.
    pub dead_lettered: usize,
    /// True if the cycle stopped on cancellation.
    pub cancelled: bool,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl DrainReport {
    /// Entries handled in any way.
    pub fn processed(&self) -> usize {
        self.applied
            + self.conflicts_resolved
            + self.conflicts_pending
            + self.requeued
            + self.dead_lettered
    }

    /// Folds a later cycle's counts into this one.
    pub(crate) fn absorb(&mut self, later: DrainReport) {
        self.applied += later.applied;
        self.conflicts_resolved += later.conflicts_resolved;
        self.conflicts_pending += later.conflicts_pending;
        self.requeued += later.requeued;
        self.dead_lettered += later.dead_lettered;
        self.cancelled = later.cancelled;
        self.duration += later.duration;
    }

    fn record(&mut self, step: Step) {
        match step {
            Step::Applied => self.applied += 1,
            Step::Resolved => self.conflicts_resolved += 1,
            Step::Parked => self.conflicts_pending += 1,
            Step::Requeued => self.requeued += 1,
            Step::DeadLettered => self.dead_lettered += 1,
            Step::Skipped => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Applied,
    Resolved,
    Parked,
    Requeued,
    DeadLettered,
    Skipped,
}

/// A decision supplied by the application for a pending conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionChoice {
    /// Resend the local payload on top of the remote version.
    KeepLocal,
    /// Take the remote payload.
    AcceptRemote,
    /// Send this payload instead of either side.
    Custom(Payload),
}

/// Transmits queue entries and interprets the outcomes.
pub struct QueueProcessor {
    config: SyncConfig,
    store: Arc<LocalRecordStore>,
    queue: Arc<SyncQueue>,
    conflicts: Arc<ConflictStore>,
    resolver: Arc<ConflictResolver>,
    remote: Arc<dyn RemoteAuthority>,
    locks: KeyLocks,
}

impl QueueProcessor {
    /// Creates a processor over shared components.
    pub fn new(
        config: SyncConfig,
        store: Arc<LocalRecordStore>,
        queue: Arc<SyncQueue>,
        conflicts: Arc<ConflictStore>,
        resolver: Arc<ConflictResolver>,
        remote: Arc<dyn RemoteAuthority>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            conflicts,
            resolver,
            remote,
            locks: KeyLocks::new(),
        }
    }

    /// Locks that serialize local bookkeeping per entity.
    pub(crate) fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Runs until nothing is eligible or `cancel` is raised.
    ///
    /// Entities with a pending conflict are skipped. `progress` is called
    /// every `progress_every` processed entries, possibly from a worker
    /// thread. The first local storage error stops the cycle; entries that
    /// were not reached stay queued.
    pub fn drain(
        &self,
        cancel: &AtomicBool,
        progress: &(dyn Fn(&DrainReport) + Sync),
    ) -> SyncResult<DrainReport> {
        let started = Instant::now();
        let report = Mutex::new(DrainReport::default());
        let failure: Mutex<Option<SyncError>> = Mutex::new(None);
        let every = self.config.progress_every.max(1);

        info!(pending = self.queue.len(), "drain started");
        loop {
            if cancel.load(Ordering::SeqCst) {
                report.lock().cancelled = true;
                break;
            }

            let heads = self
                .queue
                .eligible_heads(Timestamp::now(), |key| self.conflicts.has_pending(key));
            if heads.is_empty() {
                break;
            }

            let next = AtomicUsize::new(0);
            let workers = self.config.workers.clamp(1, heads.len());
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| loop {
                        if failure.lock().is_some() {
                            return;
                        }
                        if cancel.load(Ordering::SeqCst) {
                            report.lock().cancelled = true;
                            return;
                        }
                        let Some(entry) = heads.get(next.fetch_add(1, Ordering::SeqCst)) else {
                            return;
                        };

                        match self.process(entry) {
                            Ok(step) => {
                                let snapshot = {
                                    let mut report = report.lock();
                                    report.record(step);
                                    let due = step != Step::Skipped
                                        && report.processed() % every == 0;
                                    due.then(|| report.clone())
                                };
                                if let Some(snapshot) = snapshot {
                                    progress(&snapshot);
                                }
                            }
                            Err(err) => {
                                warn!(entry = %entry.id, key = %entry.key, error = %err, "drain aborted");
                                failure.lock().get_or_insert(err);
                                return;
                            }
                        }
                    });
                }
            });

            if failure.lock().is_some() || report.lock().cancelled {
                break;
            }
        }

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        let mut report = report.into_inner();
        report.duration = started.elapsed();
        info!(
            applied = report.applied,
            resolved = report.conflicts_resolved,
            parked = report.conflicts_pending,
            requeued = report.requeued,
            dead = report.dead_lettered,
            cancelled = report.cancelled,
            "drain finished"
        );
        Ok(report)
    }

    /// Transmits one claimed entry and settles the outcome.
    fn process(&self, entry: &SyncQueueEntry) -> SyncResult<Step> {
        if !self.queue.claim(entry.id) {
            return Ok(Step::Skipped);
        }

        let request = ApplyRequest {
            idempotency_key: entry.idempotency_key.clone(),
            key: entry.key.clone(),
            verb: entry.verb,
            payload: entry.payload.clone(),
            base_version: entry.base_version,
            timeout: self.config.request_timeout,
        };
        debug!(entry = %entry.id, key = %entry.key, verb = %entry.verb, "transmitting");

        let response = self.remote.apply(&request);
        let _guard = self.locks.lock(&entry.key);
        let result = match response {
            Ok(ApplyOutcome::Applied { version, payload }) => {
                self.on_applied(entry, version, payload.as_ref())
            }
            Ok(ApplyOutcome::Conflict {
                remote_version,
                remote_payload,
            }) => self.on_conflict(entry, remote_version, remote_payload),
            Ok(ApplyOutcome::Rejected { details }) => self
                .queue
                .dead_letter(entry.id, DeadLetterReason::Rejected { details })
                .map(|_| Step::DeadLettered)
                .map_err(SyncError::from),
            Err(err) if err.is_retryable() => self.on_transient(entry, &err),
            Err(err) => self
                .queue
                .dead_letter(
                    entry.id,
                    DeadLetterReason::Fatal {
                        message: err.to_string(),
                    },
                )
                .map(|_| Step::DeadLettered)
                .map_err(SyncError::from),
        };

        if result.is_err() {
            self.queue.release(entry.id);
        }
        result
    }

    fn on_applied(
        &self,
        entry: &SyncQueueEntry,
        version: u64,
        canonical: Option<&Payload>,
    ) -> SyncResult<Step> {
        let confirmation = self
            .store
            .confirm(&entry.key, entry.local_version, version, canonical)?;
        self.queue.remove(entry.id)?;
        self.queue.rebase(&entry.key, version)?;
        debug!(entry = %entry.id, key = %entry.key, version, ?confirmation, "applied");
        Ok(Step::Applied)
    }

    fn on_transient(&self, entry: &SyncQueueEntry, err: &SyncError) -> SyncResult<Step> {
        let attempts = entry.attempts.saturating_add(1);
        if self.config.retry.is_exhausted(attempts) {
            self.queue.dead_letter(
                entry.id,
                DeadLetterReason::RetriesExhausted {
                    attempts,
                    last_error: err.to_string(),
                },
            )?;
            return Ok(Step::DeadLettered);
        }

        let delay = self.config.retry.delay_for_attempt(entry.attempts);
        self.queue.requeue(entry.id, delay, &err.to_string())?;
        Ok(Step::Requeued)
    }

    fn on_conflict(
        &self,
        entry: &SyncQueueEntry,
        remote_version: u64,
        remote_payload: Option<Payload>,
    ) -> SyncResult<Step> {
        let conflict = ConflictRecord {
            id: ConflictId::new(),
            key: entry.key.clone(),
            entry_id: entry.id,
            verb: entry.verb,
            local_payload: entry.payload.clone(),
            local_version: entry.local_version,
            base_version: entry.base_version,
            remote_payload,
            remote_version,
            strategy: self.resolver.strategy_for(&entry.key.collection),
            status: ConflictStatus::Pending,
            detected_at: Timestamp::now(),
        };
        info!(
            key = %entry.key,
            base = ?entry.base_version,
            remote_version,
            strategy = %conflict.strategy,
            "conflict detected"
        );

        match self.resolver.resolve(&conflict) {
            Resolution::KeepLocal => {
                self.resend(
                    &conflict,
                    conflict.local_payload.clone(),
                    conflict.local_version,
                    false,
                )?;
                Ok(Step::Resolved)
            }
            Resolution::Merged(merged) => {
                self.resend(&conflict, Some(merged), conflict.local_version, true)?;
                Ok(Step::Resolved)
            }
            Resolution::AcceptRemote => {
                self.accept_remote(&conflict)?;
                Ok(Step::Resolved)
            }
            Resolution::Pending => {
                self.conflicts.record(conflict)?;
                if let Some(record) = self.store.inspect(&entry.key) {
                    if !record.is_tombstoned() {
                        self.store.mark_conflicted(&entry.key)?;
                    }
                }
                self.queue.release(entry.id);
                Ok(Step::Parked)
            }
        }
    }

    /// Applies an application decision for a pending conflict.
    ///
    /// Local updates made while the conflict was pending may have been
    /// folded into the parked entry; `KeepLocal` sends that latest content.
    pub fn settle(&self, conflict: &ConflictRecord, choice: ResolutionChoice) -> SyncResult<()> {
        let _guard = self.locks.lock(&conflict.key);
        let (local_payload, local_version) = match self.queue.get(conflict.entry_id) {
            Some(entry) => (entry.payload, entry.local_version),
            None => (conflict.local_payload.clone(), conflict.local_version),
        };
        match choice {
            ResolutionChoice::KeepLocal => {
                self.resend(conflict, local_payload, local_version, true)
            }
            ResolutionChoice::AcceptRemote => self.accept_remote(conflict),
            ResolutionChoice::Custom(payload) => {
                self.resend(conflict, Some(payload), local_version, true)
            }
        }
    }

    /// Takes the remote side: overwrite or purge locally, drop queued writes.
    fn accept_remote(&self, conflict: &ConflictRecord) -> SyncResult<()> {
        match &conflict.remote_payload {
            Some(payload) => {
                self.store
                    .put_synced(&conflict.key, payload.clone(), conflict.remote_version)?;
            }
            None => self.store.forget(&conflict.key, conflict.remote_version)?,
        }
        self.queue.drop_entity(&conflict.key)?;
        debug!(key = %conflict.key, version = conflict.remote_version, "accepted remote");
        Ok(())
    }

    /// Sends `payload` again on top of the remote version.
    ///
    /// `local_version` is the local write the payload stands for. With
    /// `write_local`, the payload also becomes the local content unless a
    /// newer local write has happened since.
    fn resend(
        &self,
        conflict: &ConflictRecord,
        payload: Option<Payload>,
        mut local_version: u64,
        write_local: bool,
    ) -> SyncResult<()> {
        let key = &conflict.key;
        let verb = if payload.is_some() {
            Verb::Update
        } else {
            Verb::Delete
        };

        if let (true, Some(content)) = (write_local, &payload) {
            let unchanged = self
                .store
                .inspect(key)
                .is_some_and(|r| r.local_version == local_version);
            if unchanged {
                local_version = self.store.put(key, content.clone())?.local_version;
            }
        }

        self.store.rebase_remote(key, conflict.remote_version)?;
        let reissue = Reissue {
            verb,
            payload: payload.clone(),
            base_version: Some(conflict.remote_version),
            local_version,
        };
        if self.queue.get(conflict.entry_id).is_some() {
            self.queue.reissue(conflict.entry_id, reissue)?;
        } else {
            self.queue.enqueue(NewEntry {
                key: key.clone(),
                verb,
                payload,
                base_version: Some(conflict.remote_version),
                local_version,
            })?;
        }
        self.queue.rebase(key, conflict.remote_version)?;
        debug!(key = %key, base = conflict.remote_version, "resending local side");
        Ok(())
    }
}
