// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote handler contracts.
//!
//! The protocol talks to the master exclusively through two traits:
//!
//! - [`PullHandler`]: page through master changes after a checkpoint, and
//!   optionally stream live changes
//! - [`PushHandler`]: submit fork writes together with the master state
//!   each write was based on; the master answers with the rows it refused
//!
//! # Push Contract
//!
//! ```text
//! push([WriteRow { new_document_state, assumed_master_state }])
//!   → [] if every row was accepted
//!   → [current master state] for each row whose assumed state is stale
//! ```
//!
//! A master must accept a row whose new state already equals its current
//! state; replays after a crash rely on it.
//!
//! [`StorageReplicationHandler`] implements both traits on top of any
//! [`ForkStore`], which is how two local stores replicate with each other.

use crate::conflict::ConflictHandler;
use crate::document::{Checkpoint, Document};
use crate::storage::{ForkStore, ForkWriteOutcome, ForkWriteRow, WriteContext};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A remote call failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Type alias for boxed handler futures.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send + 'a>>;

/// One page of master changes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PullBatch {
    pub documents: Vec<Document>,
    /// Resume point. `None` (or null) keeps the previous checkpoint.
    pub checkpoint: Option<Checkpoint>,
}

/// Live pull stream item.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStreamEvent {
    /// Changes pushed by the master.
    Batch(PullBatch),
    /// Events may have been missed. Re-drain from the stored checkpoint.
    Resync,
}

/// A fork write submitted to the master.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRow {
    pub new_document_state: Document,
    /// Master state the write was based on. `None` for writes the fork
    /// never saw a master state for.
    pub assumed_master_state: Option<Document>,
}

/// Source of master changes.
pub trait PullHandler: Send + Sync + 'static {
    /// Up to `batch_size` master documents changed after `checkpoint`.
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> HandlerFuture<'_, PullBatch>;

    /// Live change stream, if the master offers one.
    fn stream(&self) -> Option<BoxStream<'static, PullStreamEvent>> {
        None
    }
}

/// Sink for fork writes.
pub trait PushHandler: Send + Sync + 'static {
    /// Submit rows; returns the current master state of every refused row.
    fn push(&self, rows: Vec<WriteRow>) -> HandlerFuture<'_, Vec<Document>>;
}

/// Adapt a broadcast receiver into a pull stream.
///
/// A lagged receiver has dropped events, which surfaces as
/// [`PullStreamEvent::Resync`].
pub fn broadcast_stream<T, F>(receiver: broadcast::Receiver<T>, map: F) -> BoxStream<'static, PullStreamEvent>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Option<PullStreamEvent> + Send + 'static,
{
    stream::unfold((receiver, map), |(mut receiver, map)| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => {
                    if let Some(event) = map(item) {
                        return Some((event, (receiver, map)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Pull stream lagged, requesting resync");
                    return Some((PullStreamEvent::Resync, (receiver, map)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Master handler backed by a [`ForkStore`].
pub struct StorageReplicationHandler<S: ForkStore> {
    store: Arc<S>,
    conflict: Arc<dyn ConflictHandler>,
}

impl<S: ForkStore> StorageReplicationHandler<S> {
    /// `conflict` supplies the equality used to accept writes.
    pub fn new(store: Arc<S>, conflict: Arc<dyn ConflictHandler>) -> Self {
        Self { store, conflict }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: ForkStore> PullHandler for StorageReplicationHandler<S> {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> HandlerFuture<'_, PullBatch> {
        Box::pin(async move {
            let changed = self
                .store
                .changed_since(checkpoint, batch_size)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(PullBatch {
                documents: changed.documents.into_iter().map(|s| s.document).collect(),
                checkpoint: changed.checkpoint,
            })
        })
    }

    fn stream(&self) -> Option<BoxStream<'static, PullStreamEvent>> {
        Some(broadcast_stream(self.store.changes(), |bulk| {
            Some(PullStreamEvent::Batch(PullBatch {
                documents: bulk.documents.into_iter().map(|s| s.document).collect(),
                checkpoint: Some(bulk.checkpoint),
            }))
        }))
    }
}

impl<S: ForkStore> PushHandler for StorageReplicationHandler<S> {
    fn push(&self, rows: Vec<WriteRow>) -> HandlerFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let ids: Vec<String> = rows.iter().map(|r| r.new_document_state.id.clone()).collect();
            let current = self
                .store
                .find_by_ids(ids)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;

            let mut conflicts = Vec::new();
            let mut writes = Vec::new();
            for row in rows {
                let id = row.new_document_state.id.clone();
                match current.get(&id) {
                    None => writes.push(ForkWriteRow {
                        previous_revision: None,
                        document: row.new_document_state,
                    }),
                    Some(master) if self.conflict.is_equal(&master.document, &row.new_document_state) => {
                        debug!(document_id = %id, "Push row already matches master");
                    }
                    Some(master) => {
                        let assumed_matches = row
                            .assumed_master_state
                            .as_ref()
                            .is_some_and(|assumed| self.conflict.is_equal(assumed, &master.document));
                        if assumed_matches {
                            writes.push(ForkWriteRow {
                                previous_revision: Some(master.revision),
                                document: row.new_document_state,
                            });
                        } else {
                            conflicts.push(master.document.clone());
                        }
                    }
                }
            }

            if !writes.is_empty() {
                let outcomes = self
                    .store
                    .bulk_write(writes, WriteContext::Replication)
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                for outcome in outcomes {
                    if let ForkWriteOutcome::Conflict { current: Some(current) } = outcome {
                        conflicts.push(current.document);
                    }
                }
            }
            Ok(conflicts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::MasterWins;
    use crate::storage::MemoryForkStore;
    use serde_json::json;

    fn doc(id: &str, n: i64) -> Document {
        Document::new(id, json!({ "n": n }))
    }

    fn handler() -> StorageReplicationHandler<MemoryForkStore> {
        StorageReplicationHandler::new(Arc::new(MemoryForkStore::new("master")), Arc::new(MasterWins))
    }

    #[tokio::test]
    async fn test_push_inserts_new_documents() {
        let handler = handler();
        let conflicts = handler
            .push(vec![WriteRow { new_document_state: doc("a", 1), assumed_master_state: None }])
            .await
            .unwrap();

        assert!(conflicts.is_empty());
        assert_eq!(handler.store().get("a").await, Some(doc("a", 1)));
    }

    #[tokio::test]
    async fn test_push_with_matching_assumed_state() {
        let handler = handler();
        handler.store().put(doc("a", 1)).await;

        let conflicts = handler
            .push(vec![WriteRow {
                new_document_state: doc("a", 2),
                assumed_master_state: Some(doc("a", 1)),
            }])
            .await
            .unwrap();

        assert!(conflicts.is_empty());
        assert_eq!(handler.store().get("a").await, Some(doc("a", 2)));
    }

    #[tokio::test]
    async fn test_push_reports_stale_assumed_state() {
        let handler = handler();
        handler.store().put(doc("a", 5)).await;

        let conflicts = handler
            .push(vec![
                WriteRow { new_document_state: doc("a", 2), assumed_master_state: Some(doc("a", 1)) },
                WriteRow { new_document_state: doc("b", 1), assumed_master_state: None },
            ])
            .await
            .unwrap();

        assert_eq!(conflicts, vec![doc("a", 5)]);
        assert_eq!(handler.store().get("a").await, Some(doc("a", 5)));
        assert_eq!(handler.store().get("b").await, Some(doc("b", 1)));
    }

    #[tokio::test]
    async fn test_push_without_assumed_state_conflicts_with_existing() {
        let handler = handler();
        handler.store().put(doc("a", 1)).await;

        let conflicts = handler
            .push(vec![WriteRow { new_document_state: doc("a", 2), assumed_master_state: None }])
            .await
            .unwrap();
        assert_eq!(conflicts, vec![doc("a", 1)]);
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let handler = handler();
        let row = WriteRow { new_document_state: doc("a", 1), assumed_master_state: None };

        assert!(handler.push(vec![row.clone()]).await.unwrap().is_empty());
        let sequence = handler.store().sequence().await;
        // Replay with a stale assumed state: equal to master, accepted without a write.
        assert!(handler.push(vec![row]).await.unwrap().is_empty());
        assert_eq!(handler.store().sequence().await, sequence);
    }

    #[tokio::test]
    async fn test_pull_pages_through_master() {
        let handler = handler();
        for i in 0..3 {
            handler.store().put(doc(&format!("d{i}"), i)).await;
        }

        let first = handler.pull(None, 2).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        let second = handler.pull(first.checkpoint, 2).await.unwrap();
        assert_eq!(second.documents, vec![doc("d2", 2)]);
        let empty = handler.pull(second.checkpoint, 2).await.unwrap();
        assert!(empty.documents.is_empty());
        assert!(empty.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_stream_forwards_changes() {
        let handler = handler();
        let mut stream = handler.stream().unwrap();

        handler.store().put(doc("a", 1)).await;

        match stream.next().await {
            Some(PullStreamEvent::Batch(batch)) => {
                assert_eq!(batch.documents, vec![doc("a", 1)]);
                assert_eq!(batch.checkpoint, Some(Checkpoint(json!({ "sequence": 1 }))));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagged_stream_resyncs() {
        let (tx, rx) = broadcast::channel::<u32>(1);
        let mut stream = broadcast_stream(rx, |n| {
            Some(PullStreamEvent::Batch(PullBatch {
                documents: vec![doc("x", n as i64)],
                checkpoint: None,
            }))
        });

        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert_eq!(stream.next().await, Some(PullStreamEvent::Resync));
        drop(tx);
        assert!(matches!(stream.next().await, Some(PullStreamEvent::Batch(_))));
        assert_eq!(stream.next().await, None);
    }
}
