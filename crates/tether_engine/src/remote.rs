//! The boundary to the remote authority.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tether_core::{EntityKey, IdempotencyKey, Payload, Verb};

/// One mutation sent to the remote authority.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    /// Deduplication key; identical for every retry of one operation.
    pub idempotency_key: IdempotencyKey,
    /// Target entity.
    pub key: EntityKey,
    /// Operation.
    pub verb: Verb,
    /// Payload snapshot. `None` for deletes.
    pub payload: Option<Payload>,
    /// Remote version the client last observed.
    pub base_version: Option<u64>,
    /// Bound on the call, enforced by the implementation.
    pub timeout: Duration,
}

/// The remote authority's answer to an [`ApplyRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The mutation was applied.
    Applied {
        /// New remote version.
        version: u64,
        /// Canonical payload after the apply. `None` for deletes.
        payload: Option<Payload>,
    },
    /// The entity changed since `base_version`.
    Conflict {
        /// Current remote version.
        remote_version: u64,
        /// Current remote payload. `None` if deleted remotely.
        remote_payload: Option<Payload>,
    },
    /// The payload failed validation and will never be accepted.
    Rejected {
        /// Why.
        details: String,
    },
}

/// A remote authority handles mutations sent by the queue processor.
///
/// Implementations must be idempotent on `idempotency_key`: re-sending a key
/// that was already applied returns the original `Applied` outcome. Transient
/// failures are reported as retryable [`SyncError`]s.
///
/// The processor does not abandon a call on its own. Implementations must
/// honour [`ApplyRequest::timeout`] and return [`SyncError::Timeout`] once it
/// expires; the entry is then retried under the same idempotency key.
pub trait RemoteAuthority: Send + Sync {
    /// Applies one mutation.
    fn apply(&self, request: &ApplyRequest) -> SyncResult<ApplyOutcome>;
}

/// A fault injected into [`MemoryRemote`] for the next call on an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a retryable server error before applying.
    Transient,
    /// Fail with a timeout before applying.
    Timeout,
    /// Apply, then lose the response.
    LostResponse,
    /// Reject the payload as invalid.
    Validation(String),
}

/// A mutation the remote authority actually applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedWrite {
    /// Target entity.
    pub key: EntityKey,
    /// Operation.
    pub verb: Verb,
    /// Resulting payload. `None` after a delete.
    pub payload: Option<Payload>,
    /// Resulting version.
    pub version: u64,
    /// Key of the request that caused it, `None` for external writes.
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone)]
struct RemoteEntity {
    version: u64,
    payload: Option<Payload>,
}

#[derive(Default)]
struct RemoteState {
    entities: HashMap<EntityKey, RemoteEntity>,
    applied: HashMap<IdempotencyKey, ApplyOutcome>,
    faults: HashMap<EntityKey, VecDeque<Fault>>,
    history: Vec<AppliedWrite>,
    running: HashMap<EntityKey, usize>,
    max_running_per_entity: usize,
    max_running: usize,
}

/// An in-memory remote authority for tests and demos.
///
/// Holds one versioned copy of every entity, detects stale base versions,
/// caches applied outcomes by idempotency key, and can be scripted with
/// faults, latency and writes from other clients.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    online: AtomicBool,
    calls: AtomicUsize,
    latency: Mutex<Duration>,
    stamp_field: Option<String>,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            stamp_field: None,
        }
    }

    /// Adds `field: version` to every canonical object payload.
    pub fn with_version_stamp(mut self, field: impl Into<String>) -> Self {
        self.stamp_field = Some(field.into());
        self
    }

    /// Sets reachability; unreachable calls fail with `NotConnected`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Queues a fault for the next call on `key`.
    pub fn fail_next(&self, key: &EntityKey, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(key.clone())
            .or_default()
            .push_back(fault);
    }

    /// Writes as another client would. `None` deletes.
    ///
    /// Returns the new remote version.
    pub fn apply_external(&self, key: &EntityKey, payload: Option<Payload>) -> u64 {
        let mut state = self.state.lock();
        let verb = if payload.is_none() {
            Verb::Delete
        } else {
            Verb::Update
        };
        self.commit(&mut state, key, verb, payload, None).0
    }

    /// Current remote version and payload of `key`.
    pub fn entity(&self, key: &EntityKey) -> Option<(u64, Option<Payload>)> {
        self.state
            .lock()
            .entities
            .get(key)
            .map(|e| (e.version, e.payload.clone()))
    }

    /// Current live payload of `key`.
    pub fn payload(&self, key: &EntityKey) -> Option<Payload> {
        self.entity(key).and_then(|(_, payload)| payload)
    }

    /// Every applied write in order.
    pub fn history(&self) -> Vec<AppliedWrite> {
        self.state.lock().history.clone()
    }

    /// Applied writes for one entity in order.
    pub fn history_for(&self, key: &EntityKey) -> Vec<AppliedWrite> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|w| &w.key == key)
            .cloned()
            .collect()
    }

    /// Total calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls seen for a single entity.
    pub fn max_concurrent_per_entity(&self) -> usize {
        self.state.lock().max_running_per_entity
    }

    /// Highest number of simultaneous calls seen overall.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_running
    }

    fn commit(
        &self,
        state: &mut RemoteState,
        key: &EntityKey,
        verb: Verb,
        payload: Option<Payload>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> (u64, Option<Payload>) {
        let version = state.entities.get(key).map_or(0, |e| e.version) + 1;
        let payload = match (payload, &self.stamp_field) {
            (Some(Payload::Object(mut fields)), Some(stamp)) => {
                fields.insert(stamp.clone(), Payload::from(version));
                Some(Payload::Object(fields))
            }
            (payload, _) => payload,
        };

        state.entities.insert(
            key.clone(),
            RemoteEntity {
                version,
                payload: payload.clone(),
            },
        );
        state.history.push(AppliedWrite {
            key: key.clone(),
            verb,
            payload: payload.clone(),
            version,
            idempotency_key,
        });
        (version, payload)
    }

    fn process(&self, request: &ApplyRequest, fault: Option<Fault>) -> SyncResult<ApplyOutcome> {
        match &fault {
            Some(Fault::Transient) => return Err(SyncError::ServerError("injected failure".into())),
            Some(Fault::Timeout) => return Err(SyncError::Timeout),
            Some(Fault::Validation(details)) => {
                return Ok(ApplyOutcome::Rejected {
                    details: details.clone(),
                })
            }
            Some(Fault::LostResponse) | None => {}
        }

        let mut state = self.state.lock();
        let cached = state.applied.get(&request.idempotency_key).cloned();
        let current = state
            .entities
            .get(&request.key)
            .map(|e| (e.version, e.payload.clone()));

        let outcome = match (cached, current) {
            (Some(previous), _) => previous,
            (None, Some((version, payload))) if request.base_version != Some(version) => {
                ApplyOutcome::Conflict {
                    remote_version: version,
                    remote_payload: payload,
                }
            }
            (None, _) => {
                let payload = match request.verb {
                    Verb::Delete => None,
                    Verb::Create | Verb::Update => request.payload.clone(),
                };
                let (version, payload) = self.commit(
                    &mut state,
                    &request.key,
                    request.verb,
                    payload,
                    Some(request.idempotency_key.clone()),
                );
                let outcome = ApplyOutcome::Applied { version, payload };
                state
                    .applied
                    .insert(request.idempotency_key.clone(), outcome.clone());
                outcome
            }
        };
        drop(state);

        if fault == Some(Fault::LostResponse) {
            return Err(SyncError::transport_retryable("connection reset before response"));
        }
        Ok(outcome)
    }

    fn enter(&self, key: &EntityKey) {
        let mut state = self.state.lock();
        let running = state.running.entry(key.clone()).or_default();
        *running += 1;
        let for_entity = *running;
        let total: usize = state.running.values().sum();
        state.max_running_per_entity = state.max_running_per_entity.max(for_entity);
        state.max_running = state.max_running.max(total);
    }

    fn leave(&self, key: &EntityKey) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.get_mut(key) {
            *running = running.saturating_sub(1);
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteAuthority for MemoryRemote {
    fn apply(&self, request: &ApplyRequest) -> SyncResult<ApplyOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }

        self.enter(&request.key);
        let latency = *self.latency.lock();
        let result = if latency > request.timeout {
            thread::sleep(request.timeout);
            Err(SyncError::Timeout)
        } else {
            thread::sleep(latency);
            let fault = self
                .state
                .lock()
                .faults
                .get_mut(&request.key)
                .and_then(VecDeque::pop_front);
            self.process(request, fault)
        };
        self.leave(&request.key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(key: &EntityKey, seq: u64, base: Option<u64>, name: &str) -> ApplyRequest {
        ApplyRequest {
            idempotency_key: IdempotencyKey::derive(
                key,
                Verb::Update,
                tether_core::Timestamp::from_millis(seq),
                tether_core::EntryId(seq),
            ),
            key: key.clone(),
            verb: Verb::Update,
            payload: Some(json!({ "name": name })),
            base_version: base,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn applies_and_detects_stale_base() {
        let remote = MemoryRemote::new();
        let key = EntityKey::new("note", "7");

        let first = remote.apply(&request(&key, 1, None, "a")).unwrap();
        assert_eq!(
            first,
            ApplyOutcome::Applied { version: 1, payload: Some(json!({"name": "a"})) }
        );

        let stale = remote.apply(&request(&key, 2, None, "b")).unwrap();
        assert_eq!(
            stale,
            ApplyOutcome::Conflict { remote_version: 1, remote_payload: Some(json!({"name": "a"})) }
        );

        let next = remote.apply(&request(&key, 3, Some(1), "c")).unwrap();
        assert!(matches!(next, ApplyOutcome::Applied { version: 2, .. }));
    }

    #[test]
    fn replay_returns_original_outcome() {
        let remote = MemoryRemote::new();
        let key = EntityKey::new("note", "1");
        let req = request(&key, 1, None, "a");

        remote.fail_next(&key, Fault::LostResponse);
        assert!(remote.apply(&req).unwrap_err().is_retryable());

        let replay = remote.apply(&req).unwrap();
        assert!(matches!(replay, ApplyOutcome::Applied { version: 1, .. }));
        assert_eq!(remote.history_for(&key).len(), 1);
        assert_eq!(remote.call_count(), 2);
    }

    #[test]
    fn scripted_faults() {
        let remote = MemoryRemote::new();
        let key = EntityKey::new("note", "1");
        remote.fail_next(&key, Fault::Transient);
        remote.fail_next(&key, Fault::Validation("title required".into()));

        assert!(matches!(
            remote.apply(&request(&key, 1, None, "a")),
            Err(SyncError::ServerError(_))
        ));
        assert_eq!(
            remote.apply(&request(&key, 1, None, "a")).unwrap(),
            ApplyOutcome::Rejected { details: "title required".into() }
        );
        assert!(remote.history().is_empty());

        remote.set_online(false);
        assert!(matches!(
            remote.apply(&request(&key, 1, None, "a")),
            Err(SyncError::NotConnected)
        ));
    }

    #[test]
    fn latency_beyond_timeout_times_out() {
        let remote = MemoryRemote::new();
        remote.set_latency(Duration::from_millis(50));
        let key = EntityKey::new("note", "1");

        let mut req = request(&key, 1, None, "a");
        req.timeout = Duration::from_millis(10);
        assert!(matches!(remote.apply(&req), Err(SyncError::Timeout)));
        assert!(remote.entity(&key).is_none());
    }

    #[test]
    fn external_writes_and_stamps() {
        let remote = MemoryRemote::new().with_version_stamp("rev");
        let key = EntityKey::new("note", "7");

        assert_eq!(remote.apply_external(&key, Some(json!({"body": "x"}))), 1);
        assert_eq!(remote.payload(&key), Some(json!({"body": "x", "rev": 1})));
        assert_eq!(remote.apply_external(&key, None), 2);
        assert_eq!(remote.entity(&key), Some((2, None)));
    }
}
