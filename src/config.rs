//! Configuration for a replication.
//!
//! Configuration is passed to
//! [`ReplicationState::builder()`](crate::ReplicationState::builder) and can
//! be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_protocol::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     live: true,
//!     ..ReplicationConfig::new("https://example.org/heroes")
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── replication_identifier: String   # Namespaces checkpoints and tracker rows
//! ├── live: bool                       # Keep running after the initial sync
//! ├── pull: PullConfig                 # Master → fork
//! ├── push: PushConfig                 # Fork → master
//! ├── schema: DocumentSchema           # Primary key / deleted field names
//! ├── retry_time + backoff             # Handler failure retry
//! ├── circuit: CircuitConfig           # Fail fast against a dead master
//! ├── wait_for_leadership: bool
//! ├── live_interval: Option<String>    # Periodic resync in live mode
//! ├── watchdog: WatchdogConfig         # Stuck cycle reporting
//! ├── meta: MetaConfig                 # Checkpoint / tracker persistence
//! └── initial_checkpoint               # Used when nothing is persisted yet
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! replication_identifier: "https://example.org/heroes"
//! live: true
//! pull:
//!   batch_size: 50
//! push:
//!   batch_size: 20
//! retry_time: "2s"
//! backoff:
//!   backoff_factor: 2.0
//!   max_delay: "1m"
//! circuit:
//!   failure_threshold: 5
//!   recovery_timeout: "30s"
//! watchdog:
//!   stuck_after: "2m"
//! meta:
//!   sqlite_path: "/var/lib/app/replication.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::document::{Checkpoint, DocumentSchema};
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level replication config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Stable identifier of the remote endpoint. Together with the fork's
    /// collection name it forms the replication key.
    pub replication_identifier: String,

    /// Keep replicating after the initial sync.
    #[serde(default = "default_false")]
    pub live: bool,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub push: PushConfig,

    /// Wire field names.
    #[serde(default)]
    pub schema: DocumentSchema,

    /// Delay before retrying a failed handler call.
    #[serde(default = "default_retry_time")]
    pub retry_time: String,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Circuit breakers in front of both handlers.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Wait for the leadership signal before starting, when one is given.
    #[serde(default = "default_true")]
    pub wait_for_leadership: bool,

    /// Period of the forced resync in live mode. `None` disables it.
    #[serde(default = "default_live_interval")]
    pub live_interval: Option<String>,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub meta: MetaConfig,

    #[serde(default)]
    pub initial_checkpoint: InitialCheckpoint,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_identifier: String::new(),
            live: false,
            pull: PullConfig::default(),
            push: PushConfig::default(),
            schema: DocumentSchema::default(),
            retry_time: default_retry_time(),
            backoff: BackoffConfig::default(),
            circuit: CircuitConfig::default(),
            wait_for_leadership: true,
            live_interval: default_live_interval(),
            watchdog: WatchdogConfig::default(),
            meta: MetaConfig::default(),
            initial_checkpoint: InitialCheckpoint::default(),
        }
    }
}

impl ReplicationConfig {
    /// Defaults for the given identifier.
    pub fn new(replication_identifier: impl Into<String>) -> Self {
        Self {
            replication_identifier: replication_identifier.into(),
            ..Default::default()
        }
    }

    /// Fast retries and circuit recovery, in-memory meta store, no
    /// periodic resync.
    pub fn for_testing(replication_identifier: &str) -> Self {
        Self {
            replication_identifier: replication_identifier.to_string(),
            retry_time: "20ms".to_string(),
            backoff: BackoffConfig {
                backoff_factor: 1.0,
                max_delay: "200ms".to_string(),
                max_attempts: None,
            },
            circuit: CircuitConfig::testing(),
            live_interval: None,
            meta: MetaConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.replication_identifier.trim().is_empty() {
            return Err(ReplicationError::Config(
                "replication_identifier must not be empty".to_string(),
            ));
        }
        if !self.pull.enabled && !self.push.enabled {
            return Err(ReplicationError::Config(
                "at least one of pull or push must be enabled".to_string(),
            ));
        }
        if self.pull.batch_size == 0 || self.push.batch_size == 0 {
            return Err(ReplicationError::Config(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.schema.primary_key == self.schema.deleted_field {
            return Err(ReplicationError::Config(
                "primary_key and deleted_field must differ".to_string(),
            ));
        }
        if self.live_interval.is_some() && self.live_interval_duration().is_none() {
            return Err(ReplicationError::Config(
                "live_interval must be greater than zero".to_string(),
            ));
        }
        if self.watchdog.enabled && self.watchdog.threshold().is_none() {
            return Err(ReplicationError::Config(format!(
                "watchdog.stuck_after must be greater than zero, got {:?}",
                self.watchdog.stuck_after
            )));
        }
        let factor = self.backoff.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ReplicationError::Config(format!(
                "backoff_factor must be a finite number of at least 1.0, got {factor}"
            )));
        }
        Ok(())
    }

    /// Parse the retry_time string to a Duration.
    pub fn retry_time_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_time).unwrap_or(Duration::from_secs(5))
    }

    /// Parse the live_interval string. Invalid strings fall back to 10s,
    /// a zero interval disables the periodic resync.
    pub fn live_interval_duration(&self) -> Option<Duration> {
        self.live_interval
            .as_ref()
            .map(|s| humantime::parse_duration(s).unwrap_or(Duration::from_secs(10)))
            .filter(|period| !period.is_zero())
    }

    /// Retry policy for handler calls.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.backoff.max_attempts.unwrap_or(usize::MAX),
            initial_delay: self.retry_time_duration(),
            max_delay: self.backoff.max_delay_duration(),
            backoff_factor: self.backoff.backoff_factor,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_retry_time() -> String {
    "5s".to_string()
}

fn default_live_interval() -> Option<String> {
    Some("10s".to_string())
}

fn default_batch_size() -> usize {
    100
}

// ═══════════════════════════════════════════════════════════════════════════════
// Directions
// ═══════════════════════════════════════════════════════════════════════════════

/// Master → fork replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Documents requested per pull call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
        }
    }
}

/// Fork → master replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rows per push call. Also the page size read from the fork.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
        }
    }
}

/// Initial checkpoints, applied only when none is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialCheckpoint {
    #[serde(default)]
    pub upstream: Option<Checkpoint>,
    #[serde(default)]
    pub downstream: Option<Checkpoint>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resilience
// ═══════════════════════════════════════════════════════════════════════════════

/// Growth of the retry delay after repeated handler failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Multiplier per failed attempt. 1.0 retries at a constant `retry_time`.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Ceiling for the retry delay.
    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    /// Give up after this many attempts. `None` retries until cancelled.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_delay() -> String {
    "5m".to_string()
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn max_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_delay).unwrap_or(Duration::from_secs(300))
    }
}

/// Stuck cycle reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// A cycle running longer than this is reported on the error channel.
    #[serde(default = "default_stuck_after")]
    pub stuck_after: String,
}

fn default_stuck_after() -> String {
    "60s".to_string()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stuck_after: default_stuck_after(),
        }
    }
}

impl WatchdogConfig {
    /// Threshold, or `None` when disabled or zero.
    pub fn threshold(&self) -> Option<Duration> {
        self.enabled
            .then(|| humantime::parse_duration(&self.stuck_after).unwrap_or(Duration::from_secs(60)))
            .filter(|threshold| !threshold.is_zero())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MetaConfig: checkpoint and tracker persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Meta store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Path to the SQLite database. `":memory:"` keeps everything in process.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_meta.db".to_string(),
            wal_mode: true,
        }
    }
}

impl MetaConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
