//! The sync orchestrator.
//!
//! Owns the record store, queue and conflict store, mirrors application
//! writes into the queue, and drives drain cycles on connectivity edges,
//! timer ticks and explicit requests. At most one drain cycle runs at a
//! time; the guard is a single atomic flag. A trigger that finds a cycle
//! running leaves a rerun request, and the running cycle drains again
//! before it releases the guard.

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::processor::{DrainReport, QueueProcessor, ResolutionChoice};
use crate::remote::RemoteAuthority;
use crate::resolver::{ConflictResolver, MergeError};
use crate::status::{Listeners, OrchestratorState, StatusListener, Subscription, SyncStatus};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tether_core::{
    ConflictId, ConflictRecord, ConflictStore, CoreError, DataDir, DeadLetter, EntityKey, EntryId,
    LocalRecord, LocalRecordStore, NewEntry, Payload, ResolutionKind, SyncQueue, SyncQueueEntry,
    SyncState, Timestamp, Verb,
};
use tracing::{debug, info, warn};

/// Result of asking for a drain cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A cycle ran.
    Completed(DrainReport),
    /// Another cycle was already running; it drains again once it finishes.
    AlreadySyncing,
    /// Conditions did not call for a cycle (timer tick while offline or busy).
    Skipped,
}

/// Top-level coordinator of the sync engine.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<LocalRecordStore>,
    queue: Arc<SyncQueue>,
    conflicts: Arc<ConflictStore>,
    resolver: Arc<ConflictResolver>,
    processor: QueueProcessor,
    connectivity: Arc<dyn Connectivity>,
    state: RwLock<OrchestratorState>,
    syncing: AtomicBool,
    rerun: AtomicBool,
    cancel: AtomicBool,
    last_sync: RwLock<Option<Timestamp>>,
    cycles: AtomicU64,
    listeners: Arc<Listeners>,
    _dir: Option<DataDir>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator over existing components.
    ///
    /// Recovers orphaned local changes and registers for connectivity edges.
    pub fn new(
        config: SyncConfig,
        store: LocalRecordStore,
        queue: SyncQueue,
        conflicts: ConflictStore,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: Arc<dyn Connectivity>,
    ) -> SyncResult<Arc<Self>> {
        Self::build(config, store, queue, conflicts, remote, connectivity, None)
    }

    /// Creates an orchestrator whose state lives only in memory.
    pub fn in_memory(
        config: SyncConfig,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: Arc<dyn Connectivity>,
    ) -> SyncResult<Arc<Self>> {
        Self::new(
            config,
            LocalRecordStore::in_memory(),
            SyncQueue::in_memory(),
            ConflictStore::in_memory(),
            remote,
            connectivity,
        )
    }

    /// Opens (or creates) a data directory and takes ownership of it.
    ///
    /// # Errors
    ///
    /// Fails with a `DirectoryLocked` core error if another owner holds it.
    pub fn open(
        path: &Path,
        config: SyncConfig,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: Arc<dyn Connectivity>,
    ) -> SyncResult<Arc<Self>> {
        let dir = DataDir::open(path, true)?;
        let store = dir.open_store()?;
        let queue = dir.open_queue()?;
        let conflicts = dir.open_conflicts()?;
        info!(path = %path.display(), "data directory opened");
        Self::build(config, store, queue, conflicts, remote, connectivity, Some(dir))
    }

    fn build(
        config: SyncConfig,
        store: LocalRecordStore,
        queue: SyncQueue,
        conflicts: ConflictStore,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: Arc<dyn Connectivity>,
        dir: Option<DataDir>,
    ) -> SyncResult<Arc<Self>> {
        let store = Arc::new(store);
        let queue = Arc::new(queue);
        let conflicts = Arc::new(conflicts);
        let resolver = Arc::new(ConflictResolver::from_config(&config));
        let processor = QueueProcessor::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&conflicts),
            Arc::clone(&resolver),
            remote,
        );
        let initial = if connectivity.is_online() {
            OrchestratorState::Idle
        } else {
            OrchestratorState::Offline
        };

        let orchestrator = Arc::new(Self {
            config,
            store,
            queue,
            conflicts,
            resolver,
            processor,
            connectivity: Arc::clone(&connectivity),
            state: RwLock::new(initial),
            syncing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            last_sync: RwLock::new(None),
            cycles: AtomicU64::new(0),
            listeners: Arc::new(Listeners::default()),
            _dir: dir,
        });

        orchestrator.recover()?;
        orchestrator.compact_logs();

        let weak: Weak<Self> = Arc::downgrade(&orchestrator);
        connectivity.on_change(Arc::new(move |online| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.connectivity_changed(online);
            }
        }));
        Ok(orchestrator)
    }

    // ------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------

    /// Writes a record locally and queues it for sync.
    ///
    /// The write is readable immediately. A full backend surfaces as a
    /// storage-full error and nothing is queued.
    pub fn put(&self, collection: &str, id: &str, payload: Payload) -> SyncResult<LocalRecord> {
        let key = EntityKey::new(collection, id);
        let guard = self.processor.locks().lock(&key);
        let outcome = self.store.write(&key, payload)?;
        let record = outcome.record;
        let verb = if outcome.created {
            Verb::Create
        } else {
            Verb::Update
        };

        self.queue.enqueue(NewEntry {
            key,
            verb,
            payload: Some(record.payload.clone()),
            base_version: record.remote_version,
            local_version: record.local_version,
        })?;
        drop(guard);
        self.publish();
        Ok(record)
    }

    /// Stores a copy fetched from the remote authority as `Synced`.
    ///
    /// Nothing is queued.
    ///
    /// # Errors
    ///
    /// Fails with an `InvalidTransition` core error if the record still has
    /// local changes that were not confirmed.
    pub fn put_synced(
        &self,
        collection: &str,
        id: &str,
        payload: Payload,
        remote_version: u64,
    ) -> SyncResult<LocalRecord> {
        let key = EntityKey::new(collection, id);
        let _guard = self.processor.locks().lock(&key);
        if let Some(current) = self.store.inspect(&key) {
            if current.sync_state.needs_sync() || self.queue.has_entries_for(&key) {
                return Err(CoreError::InvalidTransition {
                    key,
                    from: current.sync_state,
                    to: SyncState::Synced,
                }
                .into());
            }
        }
        Ok(self.store.put_synced(&key, payload, remote_version)?)
    }

    /// Reads a live record.
    pub fn get(&self, collection: &str, id: &str) -> Option<LocalRecord> {
        self.store.get(&EntityKey::new(collection, id))
    }

    /// Lists the live records of a collection.
    pub fn list(&self, collection: &str) -> Vec<LocalRecord> {
        self.store.list(collection)
    }

    /// Reads a record in any state, tombstones included.
    pub fn inspect(&self, collection: &str, id: &str) -> Option<LocalRecord> {
        self.store.inspect(&EntityKey::new(collection, id))
    }

    /// Deletes a record locally and queues the delete.
    ///
    /// Deleting a record that is already pending deletion does nothing.
    pub fn mark_deleted(&self, collection: &str, id: &str) -> SyncResult<()> {
        let key = EntityKey::new(collection, id);
        let guard = self.processor.locks().lock(&key);
        if self.store.inspect(&key).is_some_and(|r| r.is_tombstoned()) {
            return Ok(());
        }

        let record = self.store.mark_deleted(&key)?;
        self.queue.enqueue(NewEntry {
            key,
            verb: Verb::Delete,
            payload: None,
            base_version: record.remote_version,
            local_version: record.local_version,
        })?;
        drop(guard);
        self.publish();
        Ok(())
    }

    /// Purges up to `count` least-recently-used synced records.
    pub fn evict_synced(&self, count: usize) -> SyncResult<Vec<EntityKey>> {
        Ok(self.store.evict_synced(count)?)
    }

    // ------------------------------------------------------------------
    // Sync cycles
    // ------------------------------------------------------------------

    /// Runs a drain cycle now.
    ///
    /// # Errors
    ///
    /// Fails fast with [`SyncError::Offline`] while connectivity is down.
    pub fn force_sync(&self) -> SyncResult<TriggerOutcome> {
        if !self.connectivity.is_online() {
            self.set_state(OrchestratorState::Offline);
            return Err(SyncError::Offline);
        }
        self.run_cycle()
    }

    /// Timer entry point: runs a cycle only when idle and online.
    pub fn tick(&self) -> SyncResult<TriggerOutcome> {
        if !self.connectivity.is_online() || self.state() != OrchestratorState::Idle {
            return Ok(TriggerOutcome::Skipped);
        }
        self.run_cycle()
    }

    /// Asks the running cycle to stop before its next transmission.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Starts a timer thread that calls [`tick`](Self::tick) every `interval`.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> PeriodicHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        let thread = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(orchestrator) = weak.upgrade() else {
                        return;
                    };
                    if let Err(err) = orchestrator.tick() {
                        warn!(error = %err, "periodic sync failed");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        debug!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "periodic sync started");

        PeriodicHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    /// Starts the timer configured by `sync_interval`, if any.
    pub fn spawn_configured(self: &Arc<Self>) -> Option<PeriodicHandle> {
        self.config
            .sync_interval
            .map(|interval| self.spawn_periodic(interval))
    }

    fn run_cycle(&self) -> SyncResult<TriggerOutcome> {
        self.rerun.store(true, Ordering::SeqCst);
        if !self.try_begin() {
            debug!("sync already running, rerun requested");
            return Ok(TriggerOutcome::AlreadySyncing);
        }

        let mut total: Option<DrainReport> = None;
        let result = loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.cancel.store(false, Ordering::SeqCst);
            self.set_state(OrchestratorState::Syncing);
            self.publish();

            let report = match self
                .processor
                .drain(&self.cancel, &|_: &DrainReport| self.publish())
            {
                Ok(report) => report,
                Err(err) => {
                    self.syncing.store(false, Ordering::SeqCst);
                    break Err(err);
                }
            };
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if !report.cancelled {
                *self.last_sync.write() = Some(Timestamp::now());
            }
            total = Some(match total.take() {
                Some(mut sum) => {
                    sum.absorb(report);
                    sum
                }
                None => report,
            });

            // a losing trigger may land right up to the release, so the
            // rerun flag is read only after it
            self.syncing.store(false, Ordering::SeqCst);
            let again = self.rerun.load(Ordering::SeqCst)
                && self.connectivity.is_online()
                && self.try_begin();
            if !again {
                break Ok(total.unwrap_or_default());
            }
            debug!("sync requested during cycle, draining again");
        };

        self.compact_logs();
        self.set_state(if self.connectivity.is_online() {
            OrchestratorState::Idle
        } else {
            OrchestratorState::Offline
        });
        self.publish();

        result.map(TriggerOutcome::Completed)
    }

    fn try_begin(&self) -> bool {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn connectivity_changed(&self, online: bool) {
        if online {
            info!("connectivity restored");
            self.cancel.store(false, Ordering::SeqCst);
            if !self.syncing.load(Ordering::SeqCst) {
                self.set_state(OrchestratorState::Idle);
            }
            self.publish();
            if let Err(err) = self.run_cycle() {
                warn!(error = %err, "sync after reconnect failed");
            }
        } else {
            info!("connectivity lost");
            self.set_state(OrchestratorState::Offline);
            self.cancel();
            self.publish();
        }
    }

    /// Rewrites logs that have outgrown the state they describe.
    fn compact_logs(&self) {
        let results = [
            ("records", self.store.compact_if_bloated()),
            ("queue", self.queue.compact_if_bloated()),
            ("conflicts", self.conflicts.compact_if_bloated()),
        ];
        for (log, result) in results {
            match result {
                Ok(true) => debug!(log, "log compacted"),
                Ok(false) => {}
                Err(err) => warn!(log, error = %err, "log compaction failed"),
            }
        }
    }

    /// Current sizes of the record, queue and conflict logs in bytes.
    pub fn log_sizes(&self) -> SyncResult<(u64, u64, u64)> {
        Ok((
            self.store.log_size()?,
            self.queue.log_size()?,
            self.conflicts.log_size()?,
        ))
    }

    /// Completed drain cycles since construction.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Conflicts waiting for a decision.
    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.pending()
    }

    /// Registers a merge function for a collection using `Merge`.
    pub fn register_merge<F>(&self, collection: impl Into<String>, merge: F)
    where
        F: Fn(&Payload, &Payload) -> Result<Payload, MergeError> + Send + Sync + 'static,
    {
        self.resolver.register_merge(collection, merge);
    }

    /// Settles a pending conflict and unpauses its entity.
    ///
    /// The resolved change is transmitted by the next cycle.
    pub fn apply_resolution(&self, conflict_id: ConflictId, choice: ResolutionChoice) -> SyncResult<()> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .ok_or(SyncError::UnknownConflict(conflict_id))?;
        let kind = match &choice {
            ResolutionChoice::KeepLocal => ResolutionKind::KeepLocal,
            ResolutionChoice::AcceptRemote => ResolutionKind::AcceptRemote,
            ResolutionChoice::Custom(_) => ResolutionKind::Custom,
        };

        self.processor.settle(&conflict, choice)?;
        self.conflicts.resolve(conflict_id, kind)?;
        self.publish();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue inspection and dead letters
    // ------------------------------------------------------------------

    /// Active queue entries in enqueue order.
    pub fn pending_entries(&self) -> Vec<SyncQueueEntry> {
        self.queue.entries()
    }

    /// Entries that will not be retried automatically.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters()
    }

    /// Moves a dead letter back into the queue with a fresh attempt budget.
    pub fn revive_dead_letter(&self, id: EntryId) -> SyncResult<SyncQueueEntry> {
        let entry = self.queue.revive(id)?;
        self.publish();
        Ok(entry)
    }

    /// Drops a dead letter for good.
    pub fn discard_dead_letter(&self, id: EntryId) -> SyncResult<DeadLetter> {
        let letter = self.queue.discard(id)?;
        self.publish();
        Ok(letter)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Current orchestrator state.
    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    /// Recomputes the status snapshot.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.connectivity.is_online(),
            syncing: self.syncing.load(Ordering::SeqCst),
            last_sync_time: *self.last_sync.read(),
            pending_count: self.queue.len(),
            failed_count: self.queue.dead_count(),
            conflict_count: self.conflicts.len(),
            state: self.state(),
        }
    }

    /// Registers a listener and delivers the current status to it at once.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let listener: StatusListener = Arc::new(listener);
        let subscription = self.listeners.add(Arc::clone(&listener));
        listener(&self.status());
        subscription
    }

    fn set_state(&self, state: OrchestratorState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = %*current, to = %state, "state transition");
            *current = state;
        }
    }

    fn publish(&self) {
        self.listeners.publish(&self.status());
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Queues local changes that have no queue entry.
    ///
    /// A crash between a record write and its enqueue leaves such records
    /// behind. Returns how many were queued.
    fn recover(&self) -> SyncResult<usize> {
        let mut recovered = 0;
        for record in self.store.records() {
            if !record.sync_state.needs_sync() || self.queue.has_entries_for(&record.key) {
                continue;
            }
            let verb = match (record.sync_state, record.remote_version) {
                (SyncState::TombstonedUnsynced, _) => Verb::Delete,
                (_, None) => Verb::Create,
                (_, Some(_)) => Verb::Update,
            };
            let payload = (verb != Verb::Delete).then(|| record.payload.clone());
            self.queue.enqueue(NewEntry {
                key: record.key.clone(),
                verb,
                payload,
                base_version: record.remote_version,
                local_version: record.local_version,
            })?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "queued orphaned local changes");
        }
        Ok(recovered)
    }
}

/// Handle to the periodic sync thread; stops it on [`stop`](Self::stop) or drop.
#[must_use = "dropping the handle stops the timer"]
pub struct PeriodicHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Stops the timer and waits for an in-progress tick to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            // the thread may already be gone
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("periodic sync thread panicked");
            }
        }
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
