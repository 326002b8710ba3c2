//! # Replication Protocol
//!
//! Checkpoint-driven replication between a local document store (the
//! *fork*) and a remote authoritative store (the *master*).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          ReplicationState                                │
//! │                                                                          │
//! │  ┌───────────┐  changes   ┌─────────────┐  Up lane   ┌─────────────────┐ │
//! │  │ ForkStore │───────────►│ StreamQueue │───────────►│ push cycle      │─┼──► PushHandler
//! │  │  (fork)   │◄───────┐   │ (coalesces) │            │ (upstream)      │ │
//! │  └───────────┘        │   └─────────────┘            └─────────────────┘ │
//! │                       │          ▲ Down lane                  │          │
//! │                       │          │                            ▼          │
//! │                       │   ┌─────────────┐            ┌─────────────────┐ │
//! │                       └───│ pull cycle  │◄──tasks────│ MetaInstance    │ │
//! │                           │ (downstream)│            │ checkpoints +   │ │
//! │                           └─────────────┘            │ assumed master  │ │
//! │                                  ▲                   └─────────────────┘ │
//! └──────────────────────────────────┼───────────────────────────────────────┘
//!                                    └──── PullHandler (+ optional stream)
//! ```
//!
//! ## Assumed Master State
//!
//! Conflicts are detected without revision numbers. For every document the
//! fork remembers the last master state it saw or wrote (the *tracker*).
//! A push carries that state along, and the master refuses the write when
//! its own state differs. A pull compares the fork against the tracker to
//! tell local edits apart from stale copies. Tracker rows and checkpoints
//! are committed together, so a crash never advances one without the other.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_protocol::{
//!     MasterWins, MemoryForkStore, ReplicationConfig, ReplicationState, StorageReplicationHandler,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replication_protocol::Result<()> {
//!     let fork = Arc::new(MemoryForkStore::new("heroes"));
//!     let master = Arc::new(StorageReplicationHandler::new(
//!         Arc::new(MemoryForkStore::new("master")),
//!         Arc::new(MasterWins),
//!     ));
//!
//!     let replication = ReplicationState::builder(fork)
//!         .config(ReplicationConfig {
//!             live: true,
//!             ..ReplicationConfig::new("https://example.org/heroes")
//!         })
//!         .pull(master.clone())
//!         .push(master)
//!         .build()
//!         .await?;
//!
//!     replication.start().await;
//!     replication.await_initial_replication().await?;
//!
//!     // Replicates until cancelled
//!     replication.cancel().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod handler;
pub mod meta;
pub mod metrics;
mod protocol;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod storage;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, HandlerCircuitMetrics};
pub use config::{ReplicationConfig, PullConfig, PushConfig, BackoffConfig, WatchdogConfig, MetaConfig};
pub use conflict::{ConflictHandler, ConflictInput, ConflictResult, MasterWins, ResolvedConflict, UnresolvableConflict};
pub use coordinator::{ReplicationBuilder, ReplicationPhase, ReplicationState, ReplicationStats};
pub use document::{Checkpoint, Document, DocumentSchema};
pub use error::{ReplicationError, Result};
pub use handler::{HandlerError, PullBatch, PullHandler, PullStreamEvent, PushHandler, StorageReplicationHandler, WriteRow};
pub use meta::{AssumedMasterState, Direction, MemoryMetaStore, MetaInstance, MetaStore, SqliteMetaStore};
pub use registry::ReplicationRegistry;
pub use storage::{ForkStore, MemoryForkStore, StoredDocument, WriteContext};
