//! Replication lifecycle and statistics types.
//!
//! # State Transitions
//!
//! ```text
//!                 start()
//! Created ─────────────────────→ WaitingForLeadership
//!    │                                   │
//!    │ start()                           │ (leadership granted)
//!    │ (no leadership signal)            ↓
//!    └─────────────────────────────→ Running
//!                                        │
//!          cancel() from any state       │ cancel() / one-shot done
//!                                        ↓
//!                                   Cancelling ──→ Cancelled
//! ```
//!
//! - **Created**: Built, nothing scheduled yet.
//! - **WaitingForLeadership**: `start()` called, blocked on the leadership signal.
//! - **Running**: Cycles are wired to their triggers.
//! - **Cancelling**: No new cycles are scheduled; in-flight ones finish.
//! - **Cancelled**: All tasks stopped. Terminal.

use serde::Serialize;

/// Lifecycle phase of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicationPhase {
    Created,
    WaitingForLeadership,
    Running,
    Cancelling,
    Cancelled,
}

impl ReplicationPhase {
    /// Whether the replication can no longer run cycles.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelling | Self::Cancelled)
    }
}

impl std::fmt::Display for ReplicationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::WaitingForLeadership => write!(f, "WaitingForLeadership"),
            Self::Running => write!(f, "Running"),
            Self::Cancelling => write!(f, "Cancelling"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Point-in-time counters of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReplicationStats {
    /// Pull tasks queued (stream batches and resyncs).
    pub pull_tasks_added: u64,
    /// Full checkpoint drains.
    pub pull_resyncs: u64,
    /// Merged stream batches applied.
    pub pull_batches_processed: u64,
    /// Events received from the master stream.
    pub pull_stream_emits: u64,
    /// Master batches written to the fork.
    pub persisted_from_master: u64,

    /// Push cycles started from the stored checkpoint.
    pub push_initial_syncs: u64,
    /// Fork change bulks that triggered the push lane.
    pub fork_stream_emits: u64,
    /// Push handler calls.
    pub persisted_to_master: u64,
    /// Push handler calls that reported conflicts.
    pub push_had_conflicts: u64,
    /// Conflict resolutions written to the fork.
    pub conflict_writes: u64,
}
