//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbox retry ceiling. Items reaching this count are abandoned.
    pub max_retries: u32,
    /// Time-to-live of the recently-modified race guard.
    pub recent_write_ttl: Duration,
    /// Pull phase retry policy.
    pub pull_retry: PullRetry,
    /// Debounce after a local write.
    pub write_debounce: Duration,
    /// Debounce after the app regains visibility.
    pub visibility_debounce: Duration,
    /// Fixed background sync cadence.
    pub interval_period: Duration,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            max_retries: 5,
            recent_write_ttl: Duration::from_secs(5),
            pull_retry: PullRetry::default(),
            write_debounce: Duration::from_secs(2),
            visibility_debounce: Duration::from_secs(1),
            interval_period: Duration::from_secs(5 * 60),
        }
    }

    /// Sets the outbox retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the recently-modified guard TTL.
    pub fn with_recent_write_ttl(mut self, ttl: Duration) -> Self {
        self.recent_write_ttl = ttl;
        self
    }

    /// Sets the pull retry policy.
    pub fn with_pull_retry(mut self, pull_retry: PullRetry) -> Self {
        self.pull_retry = pull_retry;
        self
    }

    /// Sets the post-write debounce.
    pub fn with_write_debounce(mut self, debounce: Duration) -> Self {
        self.write_debounce = debounce;
        self
    }

    /// Sets the visibility debounce.
    pub fn with_visibility_debounce(mut self, debounce: Duration) -> Self {
        self.visibility_debounce = debounce;
        self
    }

    /// Sets the background sync cadence.
    pub fn with_interval_period(mut self, period: Duration) -> Self {
        self.interval_period = period;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy for the pull phase: a bounded number of attempts with a
/// linearly growing delay between them.
///
/// The default walks the full schedule: an initial attempt plus three
/// retries, waiting 1 s, 2 s, then 3 s between them.
#[derive(Debug, Clone)]
pub struct PullRetry {
    /// Maximum number of attempts, the first try included.
    pub max_attempts: u32,
    /// Delay step: attempt `n` waits `n * step` before retrying.
    pub step: Duration,
}

impl PullRetry {
    /// Creates a new pull retry policy.
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self { max_attempts, step }
    }

    /// A policy with a single attempt and no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            step: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-indexed; the first attempt
    /// has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt)
    }
}

impl Default for PullRetry {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(1))
    }
}
