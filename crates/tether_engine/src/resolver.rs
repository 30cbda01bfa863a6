//! Conflict resolution strategies.

use crate::config::SyncConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::{ConflictRecord, ConflictStrategy, Payload};
use thiserror::Error;
use tracing::warn;

/// A merge function declined to combine two payloads.
#[derive(Debug, Clone, Error)]
#[error("merge declined: {0}")]
pub struct MergeError(pub String);

/// Field-level merge of a local and a remote payload.
///
/// Arguments are `(local, remote)`.
pub type MergeFn = Arc<dyn Fn(&Payload, &Payload) -> Result<Payload, MergeError> + Send + Sync>;

/// What the resolver decided for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local payload and resend it on top of the remote version.
    KeepLocal,
    /// Take the remote payload.
    AcceptRemote,
    /// Use a merged payload and resend it.
    Merged(Payload),
    /// Wait for the application.
    Pending,
}

/// Maps collections to strategies and applies them.
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    strategies: HashMap<String, ConflictStrategy>,
    merges: RwLock<HashMap<String, MergeFn>>,
}

impl ConflictResolver {
    /// Creates a resolver using `default_strategy` for every collection.
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            strategies: HashMap::new(),
            merges: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a resolver with the strategies in `config`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            strategies: config.strategies.clone(),
            merges: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the merge function for a collection using `Merge`.
    pub fn register_merge<F>(&self, collection: impl Into<String>, merge: F)
    where
        F: Fn(&Payload, &Payload) -> Result<Payload, MergeError> + Send + Sync + 'static,
    {
        self.merges.write().insert(collection.into(), Arc::new(merge));
    }

    /// The strategy configured for `collection`.
    pub fn strategy_for(&self, collection: &str) -> ConflictStrategy {
        self.strategies
            .get(collection)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Decides a conflict according to its recorded strategy.
    ///
    /// A merge that cannot run (no function, a missing side, or a declined
    /// merge) falls back to the remote payload.
    pub fn resolve(&self, conflict: &ConflictRecord) -> Resolution {
        match conflict.strategy {
            ConflictStrategy::ClientWins => Resolution::KeepLocal,
            ConflictStrategy::ServerWins => Resolution::AcceptRemote,
            ConflictStrategy::Manual => Resolution::Pending,
            ConflictStrategy::Merge => self.merge(conflict),
        }
    }

    fn merge(&self, conflict: &ConflictRecord) -> Resolution {
        let merge = self.merges.read().get(conflict.key.collection.as_str()).cloned();
        let (Some(merge), Some(local), Some(remote)) = (
            merge,
            conflict.local_payload.as_ref(),
            conflict.remote_payload.as_ref(),
        ) else {
            warn!(key = %conflict.key, "merge not possible, accepting remote");
            return Resolution::AcceptRemote;
        };

        match merge(local, remote) {
            Ok(merged) => Resolution::Merged(merged),
            Err(err) => {
                warn!(key = %conflict.key, error = %err, "accepting remote");
                Resolution::AcceptRemote
            }
        }
    }
}

/// Union of two JSON objects; fields present locally win.
///
/// Usable directly as a [`MergeFn`].
///
/// # Errors
///
/// Declines unless both payloads are objects.
pub fn merge_objects(local: &Payload, remote: &Payload) -> Result<Payload, MergeError> {
    match (local, remote) {
        (Payload::Object(local), Payload::Object(remote)) => {
            let mut merged = remote.clone();
            for (field, value) in local {
                merged.insert(field.clone(), value.clone());
            }
            Ok(Payload::Object(merged))
        }
        _ => Err(MergeError("both payloads must be objects".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{ConflictId, ConflictStatus, EntityKey, EntryId, Timestamp, Verb};

    fn conflict(strategy: ConflictStrategy, local: Option<Payload>) -> ConflictRecord {
        ConflictRecord {
            id: ConflictId::new(),
            key: EntityKey::new("checkin", "1"),
            entry_id: EntryId(1),
            verb: Verb::Update,
            local_payload: local,
            local_version: 2,
            base_version: Some(1),
            remote_payload: Some(json!({"mood": "ok", "note": "remote"})),
            remote_version: 2,
            strategy,
            status: ConflictStatus::Pending,
            detected_at: Timestamp::now(),
        }
    }

    #[test]
    fn fixed_strategies() {
        let resolver = ConflictResolver::new(ConflictStrategy::ServerWins);
        let local = Some(json!({"note": "local"}));
        assert_eq!(
            resolver.resolve(&conflict(ConflictStrategy::ClientWins, local.clone())),
            Resolution::KeepLocal
        );
        assert_eq!(
            resolver.resolve(&conflict(ConflictStrategy::ServerWins, local.clone())),
            Resolution::AcceptRemote
        );
        assert_eq!(
            resolver.resolve(&conflict(ConflictStrategy::Manual, local)),
            Resolution::Pending
        );
    }

    #[test]
    fn per_collection_strategy() {
        let config = SyncConfig::new().with_strategy("profile", ConflictStrategy::Manual);
        let resolver = ConflictResolver::from_config(&config);
        assert_eq!(resolver.strategy_for("profile"), ConflictStrategy::Manual);
        assert_eq!(resolver.strategy_for("log"), ConflictStrategy::ServerWins);
    }

    #[test]
    fn merge_uses_registered_function() {
        let resolver = ConflictResolver::new(ConflictStrategy::Merge);
        resolver.register_merge("checkin", merge_objects);

        let resolution = resolver.resolve(&conflict(
            ConflictStrategy::Merge,
            Some(json!({"note": "local", "steps": 10})),
        ));
        assert_eq!(
            resolution,
            Resolution::Merged(json!({"mood": "ok", "note": "local", "steps": 10}))
        );
    }

    #[test]
    fn merge_falls_back_to_remote() {
        let resolver = ConflictResolver::new(ConflictStrategy::Merge);
        let local = Some(json!({"note": "local"}));

        // nothing registered
        assert_eq!(
            resolver.resolve(&conflict(ConflictStrategy::Merge, local.clone())),
            Resolution::AcceptRemote
        );

        resolver.register_merge("checkin", |_: &Payload, _: &Payload| {
            Err(MergeError("refused".into()))
        });
        assert_eq!(
            resolver.resolve(&conflict(ConflictStrategy::Merge, local)),
            Resolution::AcceptRemote
        );

        resolver.register_merge("checkin", merge_objects);
        assert_eq!(
            resolver.resolve(&conflict(ConflictStrategy::Merge, None)),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn merge_objects_requires_objects() {
        assert!(merge_objects(&json!([1]), &json!({})).is_err());
    }
}
