//! Configuration for the sync engine.

use std::collections::HashMap;
use std::time::Duration;
use tether_core::ConflictStrategy;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Maximum entities transmitted concurrently.
    pub workers: usize,
    /// Bound on a single remote call.
    pub request_timeout: Duration,
    /// Interval for the periodic driver, if any.
    pub sync_interval: Option<Duration>,
    /// Publish status after this many processed entries during a drain.
    pub progress_every: usize,
    /// Strategy for collections without an override.
    pub default_strategy: ConflictStrategy,
    /// Per-collection strategy overrides.
    pub strategies: HashMap<String, ConflictStrategy>,
}

impl SyncConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            workers: 4,
            request_timeout: Duration::from_secs(30),
            sync_interval: None,
            progress_every: 1,
            default_strategy: ConflictStrategy::ServerWins,
            strategies: HashMap::new(),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the worker pool size. Zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets how often progress is published during a drain.
    pub fn with_progress_every(mut self, entries: usize) -> Self {
        self.progress_every = entries.max(1);
        self
    }

    /// Sets the fallback conflict strategy.
    pub fn with_default_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Overrides the conflict strategy for one collection.
    pub fn with_strategy(mut self, collection: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.strategies.insert(collection.into(), strategy);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which an entry is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration with default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Retries immediately, for tests and tools.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts)
            .with_base_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Backoff after a failure, given the attempts made before it.
    ///
    /// `min(base_delay * 2^attempts, max_delay)`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Returns true once `attempts` failures exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_workers(0)
            .with_request_timeout(Duration::from_secs(45))
            .with_default_strategy(ConflictStrategy::ClientWins)
            .with_strategy("profile", ConflictStrategy::Manual);

        assert_eq!(config.workers, 1);
        assert_eq!(config.request_timeout, Duration::from_secs(45));
        assert_eq!(config.default_strategy, ConflictStrategy::ClientWins);
        assert_eq!(config.strategies.get("profile"), Some(&ConflictStrategy::Manual));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.default_strategy, ConflictStrategy::ServerWins);
        assert!(config.sync_interval.is_none());
    }

    #[test]
    fn retry_delay_doubles() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(16));
    }

    #[test]
    fn retry_delay_respects_max() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(9), Duration::from_secs(300));
        assert_eq!(retry.delay_for_attempt(64), Duration::from_secs(300));
        assert_eq!(RetryConfig::immediate(3).delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn exhaustion_threshold() {
        let retry = RetryConfig::new(5);
        assert!(!retry.is_exhausted(4));
        assert!(retry.is_exhausted(5));
    }
}
