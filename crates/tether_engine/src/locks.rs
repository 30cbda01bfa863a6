//! Per-entity write serialization.
//!
//! A local write touches the record store and then the queue; a confirmed
//! apply touches them in the same order. Both hold the entity's lock for the
//! whole sequence so neither can observe the other half-done. Keys hash onto
//! a fixed set of stripes; unrelated keys may share one.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tether_core::EntityKey;

const STRIPES: usize = 64;

pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Blocks until `key` is free. Not reentrant.
    pub(crate) fn lock(&self, key: &EntityKey) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % STRIPES as u64) as usize;
        self.stripes[stripe].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn same_key_is_exclusive() {
        let locks = KeyLocks::new();
        let key = EntityKey::new("profile", "1");
        let inside = AtomicUsize::new(0);
        let max = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        let _guard = locks.lock(&key);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }
}
