//! Connectivity signal.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked with the new online state on every edge.
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// A source of online/offline state with edge notifications.
pub trait Connectivity: Send + Sync {
    /// Returns true if the remote authority is believed reachable.
    fn is_online(&self) -> bool;

    /// Registers a callback for connectivity edges.
    fn on_change(&self, callback: ConnectivityCallback);
}

/// A connectivity source flipped by hand.
///
/// Callbacks run synchronously on the thread calling [`set_online`], and
/// only when the state actually changes.
///
/// [`set_online`]: ManualConnectivity::set_online
pub struct ManualConnectivity {
    online: AtomicBool,
    callbacks: Mutex<Vec<ConnectivityCallback>>,
}

impl ManualConnectivity {
    /// Creates a source in the given state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Changes the state, notifying callbacks on an edge.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(online);
        }
    }
}

impl Connectivity for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn on_change(&self, callback: ConnectivityCallback) {
        self.callbacks.lock().push(callback);
    }
}
