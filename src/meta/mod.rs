// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication metadata: checkpoints and assumed master states.
//!
//! Two kinds of rows are kept per replication key:
//!
//! - **Checkpoint rows**, one per [`Direction`], holding the last cursor a
//!   cycle fully processed.
//! - **Assumed-master rows**, one per document, holding the master state
//!   the fork last knowingly agreed with. Conflict detection compares
//!   against this value.
//!
//! # Atomicity
//!
//! A cycle step writes both kinds of rows through a single
//! [`MetaStore::commit`]. Implementations must make the whole
//! [`MetaBatch`] durable together or not at all:
//!
//! ```text
//! fork write ──→ commit(tracker rows + checkpoint)
//!                (crash here = checkpoint not advanced, step is replayed)
//! ```
//!
//! # Backends
//!
//! - [`MemoryMetaStore`]: in-process, with fault injection for tests
//! - [`SqliteMetaStore`]: durable, one SQL transaction per commit

mod memory;
mod sqlite;

pub use memory::MemoryMetaStore;
pub use sqlite::SqliteMetaStore;

use crate::config::MetaConfig;
use crate::conflict::ConflictHandler;
use crate::document::{Checkpoint, Document};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fork to master (push).
    Up,
    /// Master to fork (pull).
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted assumed-master row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssumedMasterRow {
    pub document: Document,
    /// Push checkpoint at the time the row was written.
    pub push_checkpoint: Option<Checkpoint>,
}

/// The fork's belief about a document's master state.
#[derive(Debug, Clone, PartialEq)]
pub enum AssumedMasterState {
    /// Never observed, or forgotten.
    Unknown,
    Known {
        document: Document,
        push_checkpoint: Option<Checkpoint>,
    },
}

impl AssumedMasterState {
    /// The assumed document, if known.
    pub fn document(&self) -> Option<&Document> {
        match self {
            Self::Unknown => None,
            Self::Known { document, .. } => Some(document),
        }
    }

    /// Whether the belief is known and equal to `document`.
    pub fn is_known_as(&self, document: &Document, handler: &dyn ConflictHandler) -> bool {
        self.document()
            .is_some_and(|assumed| handler.is_equal(assumed, document))
    }
}

impl From<AssumedMasterRow> for AssumedMasterState {
    fn from(row: AssumedMasterRow) -> Self {
        Self::Known {
            document: row.document,
            push_checkpoint: row.push_checkpoint,
        }
    }
}

/// Everything one cycle step persists, committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaBatch {
    pub direction: Direction,
    /// New checkpoint for `direction`. `None` leaves it unchanged.
    pub checkpoint: Option<Checkpoint>,
    /// Assumed-master rows to upsert.
    pub assumed: Vec<AssumedMasterRow>,
}

impl MetaBatch {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            checkpoint: None,
            assumed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoint.is_none() && self.assumed.is_empty()
    }
}

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type MetaFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage backend for checkpoints and assumed-master rows.
pub trait MetaStore: Send + Sync + 'static {
    /// Last committed checkpoint for `direction`.
    fn checkpoint<'a>(
        &'a self,
        key: &'a str,
        direction: Direction,
    ) -> MetaFuture<'a, Option<Checkpoint>>;

    /// Assumed-master rows for `ids`. Untracked ids are omitted.
    fn assumed_master<'a>(
        &'a self,
        key: &'a str,
        ids: Vec<String>,
    ) -> MetaFuture<'a, HashMap<String, AssumedMasterRow>>;

    /// Persist a batch atomically.
    fn commit<'a>(&'a self, key: &'a str, batch: MetaBatch) -> MetaFuture<'a, ()>;

    /// Forget assumed-master rows. Returns how many were removed.
    fn purge<'a>(&'a self, key: &'a str, ids: Vec<String>) -> MetaFuture<'a, usize>;

    /// Delete every row of a replication key.
    fn remove_all<'a>(&'a self, key: &'a str) -> MetaFuture<'a, ()>;
}

/// Stable, sortable key for a replication of `collection` under `identifier`.
pub fn replication_key(collection: &str, identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update(b"|");
    hasher.update(identifier.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("replication-{hex}")
}

/// Open the meta store described by `config`.
///
/// `":memory:"` selects [`MemoryMetaStore`]; any other path opens SQLite.
pub async fn open_meta_store(config: &MetaConfig) -> Result<Arc<dyn MetaStore>> {
    if config.is_in_memory() {
        debug!("Using in-memory meta store");
        return Ok(Arc::new(MemoryMetaStore::new()));
    }
    let store = SqliteMetaStore::open(&config.sqlite_path, config.wal_mode).await?;
    Ok(Arc::new(store))
}

/// The meta rows of one replication, bound to its key.
#[derive(Clone)]
pub struct MetaInstance {
    key: String,
    store: Arc<dyn MetaStore>,
}

impl MetaInstance {
    pub fn new(key: impl Into<String>, store: Arc<dyn MetaStore>) -> Self {
        Self {
            key: key.into(),
            store,
        }
    }

    /// Replication key all rows are stored under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn checkpoint(&self, direction: Direction) -> Result<Option<Checkpoint>> {
        self.store.checkpoint(&self.key, direction).await
    }

    /// Beliefs for `ids`; every requested id gets an entry.
    pub async fn assumed_master(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, AssumedMasterState>> {
        let mut rows = self.store.assumed_master(&self.key, ids.clone()).await?;
        Ok(ids
            .into_iter()
            .map(|id| {
                let state = rows
                    .remove(&id)
                    .map(AssumedMasterState::from)
                    .unwrap_or(AssumedMasterState::Unknown);
                (id, state)
            })
            .collect())
    }

    pub async fn commit(&self, batch: MetaBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let direction = batch.direction;
        let rows = batch.assumed.len();
        match self.store.commit(&self.key, batch).await {
            Ok(()) => {
                debug!(replication = %self.key, %direction, rows, "Committed meta batch");
                crate::metrics::record_meta_commit(direction.as_str(), rows, true);
                Ok(())
            }
            Err(e) => {
                warn!(replication = %self.key, %direction, rows, error = %e, "Meta commit failed");
                crate::metrics::record_meta_commit(direction.as_str(), rows, false);
                Err(e)
            }
        }
    }

    pub async fn purge(&self, ids: Vec<String>) -> Result<usize> {
        self.store.purge(&self.key, ids).await
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.store.remove_all(&self.key).await
    }
}
