//! Circuit breakers in front of the remote handlers.
//!
//! A master that keeps failing is not hammered with calls on every retry.
//! After enough failures the circuit opens and calls fail fast until the
//! recovery timeout elapses; the replication keeps backing off in the
//! meantime. Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Handler unhealthy, calls are rejected without being made
//! - **HalfOpen**: Probing whether the handler recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use replication_protocol::circuit_breaker::{HandlerCircuit, CircuitConfig, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = HandlerCircuit::new("replication-0123456789abcdef", CircuitConfig::default());
//!
//! match circuit.pull.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, backoff */ }
//!     Err(CircuitError::Inner(e)) => { /* handler error */ }
//! }
//! # Ok(())
//! # }
//! ```

use crate::meta::Direction;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Rejected => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the sampling window that trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Calls sampled while half-open before deciding to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open before probing (e.g. "30s").
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitConfig {
    /// Tolerates more failures, probes sooner.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: "15s".to_string(),
        }
    }

    /// Fast recovery for tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: "50ms".to_string(),
        }
    }

    pub fn recovery_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.recovery_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        let window = config.failure_threshold.max(1) as usize;
        // Trip once (nearly) every call in the window failed.
        let recloser = Recloser::custom()
            .error_rate(0.99)
            .closed_len(window)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout_duration())
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                crate::metrics::set_circuit_state(&self.name, "open");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// One circuit per remote direction.
pub struct HandlerCircuit {
    pub pull: CircuitBreaker,
    pub push: CircuitBreaker,
}

impl HandlerCircuit {
    /// Circuits named `<replication>_pull` / `<replication>_push`.
    pub fn new(replication: &str, config: CircuitConfig) -> Self {
        Self {
            pull: CircuitBreaker::new(format!("{replication}_pull"), &config),
            push: CircuitBreaker::new(format!("{replication}_push"), &config),
        }
    }

    /// The circuit guarding `direction`.
    pub fn for_direction(&self, direction: Direction) -> &CircuitBreaker {
        match direction {
            Direction::Down => &self.pull,
            Direction::Up => &self.push,
        }
    }

    pub fn metrics(&self) -> HandlerCircuitMetrics {
        HandlerCircuitMetrics {
            pull_total: self.pull.calls_total(),
            pull_failures: self.pull.failures(),
            pull_rejections: self.pull.rejections(),
            push_total: self.push.calls_total(),
            push_failures: self.push.failures(),
            push_rejections: self.push.rejections(),
        }
    }
}

/// Aggregated call counts of both circuits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerCircuitMetrics {
    pub pull_total: u64,
    pub pull_failures: u64,
    pub pull_rejections: u64,
    pub push_total: u64,
    pub push_failures: u64,
    pub push_rejections: u64,
}
