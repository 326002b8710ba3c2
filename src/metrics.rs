//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Pull and push throughput
//! - Conflicts by outcome
//! - Handler failures and circuit breaker state
//! - Meta store commits
//! - Cycle durations and stuck cycles
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Per-replication series carry a `replication` label holding the
//! replication key (never the raw identifier, which may contain a URL).
//!
//! # Usage
//!
//! ```rust,no_run
//! use replication_protocol::metrics;
//! use std::time::Duration;
//!
//! metrics::record_pull_batch("replication-0123456789abcdef", 42, Duration::from_millis(50));
//! metrics::record_conflict("replication-0123456789abcdef", "down", "use_master");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Pull / Push
// =============================================================================

/// Record one pull handler response.
pub fn record_pull_batch(replication: &str, documents: usize, duration: Duration) {
    counter!("replication_pull_batches_total", "replication" => replication.to_string()).increment(1);
    counter!("replication_pull_documents_total", "replication" => replication.to_string())
        .increment(documents as u64);
    histogram!("replication_pull_duration_seconds", "replication" => replication.to_string())
        .record(duration.as_secs_f64());
}

/// Record master documents written to the fork.
pub fn record_documents_received(replication: &str, count: usize) {
    counter!("replication_documents_received_total", "replication" => replication.to_string())
        .increment(count as u64);
}

/// Record one push handler call.
pub fn record_push_batch(replication: &str, rows: usize, conflicts: usize, duration: Duration) {
    let replication = replication.to_string();
    counter!("replication_push_batches_total", "replication" => replication.clone()).increment(1);
    counter!("replication_push_rows_total", "replication" => replication.clone())
        .increment(rows as u64);
    if conflicts > 0 {
        counter!("replication_push_conflicts_total", "replication" => replication.clone())
            .increment(conflicts as u64);
    }
    histogram!("replication_push_duration_seconds", "replication" => replication)
        .record(duration.as_secs_f64());
}

/// Record how a conflict was settled (`use_master`, `resolved`, `no_conflict`,
/// `equal`, `unresolvable`).
pub fn record_conflict(replication: &str, direction: &str, outcome: &str) {
    counter!(
        "replication_conflicts_total",
        "replication" => replication.to_string(),
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record fork writes refused by optimistic concurrency.
pub fn record_fork_write_conflicts(replication: &str, direction: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "replication_fork_write_conflicts_total",
        "replication" => replication.to_string(),
        "direction" => direction.to_string()
    )
    .increment(count as u64);
}

// =============================================================================
// Errors and Cycles
// =============================================================================

/// Record a failed handler call.
pub fn record_handler_error(replication: &str, direction: &str) {
    counter!(
        "replication_handler_errors_total",
        "replication" => replication.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

/// Record an error emitted on the error channel.
pub fn record_error(replication: &str, kind: &str) {
    counter!(
        "replication_errors_total",
        "replication" => replication.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a finished cycle.
pub fn record_cycle(replication: &str, direction: &str, duration: Duration) {
    counter!(
        "replication_cycles_total",
        "replication" => replication.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
    histogram!(
        "replication_cycle_duration_seconds",
        "replication" => replication.to_string(),
        "direction" => direction.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a watchdog report.
pub fn record_stuck_cycle(replication: &str, direction: &str) {
    counter!(
        "replication_stuck_cycles_total",
        "replication" => replication.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

// =============================================================================
// Meta Store
// =============================================================================

/// Record a meta batch commit.
pub fn record_meta_commit(direction: &str, rows: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_meta_commits_total",
        "direction" => direction.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        histogram!("replication_meta_commit_rows").record(rows as f64);
    }
}

/// Record a SQLite busy retry.
pub fn meta_retries_total(operation: &str) {
    counter!("replication_meta_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Gauge for a replication's lifecycle phase.
pub fn set_replication_phase(replication: &str, phase: &str) {
    let value = match phase {
        "Created" => 0.0,
        "WaitingForLeadership" => 1.0,
        "Running" => 2.0,
        "Cancelling" => 3.0,
        "Cancelled" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_phase", "replication" => replication.to_string()).set(value);
}

/// Gauge for replications registered in a registry.
pub fn set_active_replications(count: usize) {
    gauge!("replication_active").set(count as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}
