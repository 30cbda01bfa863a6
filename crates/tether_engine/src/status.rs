//! Sync status and its listeners.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_core::Timestamp;

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorState {
    /// Online, nothing running.
    Idle,
    /// A drain cycle is running.
    Syncing,
    /// Connectivity is down.
    Offline,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Snapshot of the engine, pushed to listeners after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Connectivity as last reported.
    pub online: bool,
    /// True while a drain cycle runs.
    pub syncing: bool,
    /// End of the last cycle that ran to completion.
    pub last_sync_time: Option<Timestamp>,
    /// Active queue entries.
    pub pending_count: usize,
    /// Dead-lettered entries.
    pub failed_count: usize,
    /// Conflicts awaiting a decision.
    pub conflict_count: usize,
    /// Orchestrator state.
    pub state: OrchestratorState,
}

/// Callback receiving status updates.
pub type StatusListener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// Token-keyed registry of status listeners.
#[derive(Default)]
pub(crate) struct Listeners {
    next_token: AtomicU64,
    entries: Mutex<BTreeMap<u64, StatusListener>>,
}

impl Listeners {
    pub(crate) fn add(self: &Arc<Self>, listener: StatusListener) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(token, listener);
        Subscription {
            token,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, token: u64) {
        self.entries.lock().remove(&token);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Calls every listener outside the registry lock, so a listener may
    /// subscribe or unsubscribe without deadlocking.
    pub(crate) fn publish(&self, status: &SyncStatus) {
        let listeners: Vec<StatusListener> = self.entries.lock().values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }
}

/// Handle returned by `subscribe`; unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    token: u64,
    registry: Weak<Listeners>,
}

impl Subscription {
    /// Stops delivery to the listener.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.token);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("token", &self.token).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(pending: usize) -> SyncStatus {
        SyncStatus {
            online: true,
            syncing: false,
            last_sync_time: None,
            pending_count: pending,
            failed_count: 0,
            conflict_count: 0,
            state: OrchestratorState::Idle,
        }
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let listeners = Arc::new(Listeners::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let first = listeners.add(Arc::new(move |s: &SyncStatus| sink.lock().push(s.pending_count)));
        let _second = listeners.add(Arc::new(|_: &SyncStatus| {}));
        assert_eq!(listeners.len(), 2);

        listeners.publish(&status(1));
        first.unsubscribe();
        listeners.publish(&status(2));

        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn drop_unsubscribes() {
        let listeners = Arc::new(Listeners::default());
        {
            let _sub = listeners.add(Arc::new(|_: &SyncStatus| {}));
            assert_eq!(listeners.len(), 1);
        }
        assert_eq!(listeners.len(), 0);
    }
}
