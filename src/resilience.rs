//! Resilience utilities: retry policy and cancellable backoff.
//!
//! Handler failures never end a replication. The failing call is retried
//! after [`RetryConfig::delay_for_attempt`], and the wait is cut short when
//! the replication is cancelled.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use replication_protocol::resilience::{backoff, RetryConfig};
//! use tokio::sync::watch;
//!
//! let retry = RetryConfig::daemon();
//! let (_cancel_tx, mut cancel_rx) = watch::channel(false);
//! if !backoff(retry.delay_for_attempt(3), &mut cancel_rx).await {
//!     // cancelled while waiting
//! }
//! # }
//! ```

use std::time::Duration;
use tokio::sync::watch;

/// Retry behavior for failed handler calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` to retry until cancelled.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Constant delay, retry forever.
    ///
    /// Matches the classic "retry every 5 seconds" behavior of offline-first
    /// clients: a device can stay offline for days and must pick up again
    /// without intervention.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.0,
        }
    }

    /// Exponential backoff capped at 5 minutes, retry forever.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s (cap)
    /// ```
    pub fn exponential() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        if delay_secs <= 0.0 {
            return Duration::ZERO;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

/// Sleep for `delay` unless cancellation is signalled first.
///
/// Returns `false` when cancelled.
pub async fn backoff(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.wait_for(|cancelled| *cancelled) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
