// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fork storage integration.
//!
//! Defines what the protocol needs from a local document store: point reads,
//! optimistic-concurrency bulk writes, a sequence-ordered change feed and a
//! change broadcast for live mode.
//!
//! # Optimistic Concurrency
//!
//! Every stored document carries a `revision`. A [`ForkWriteRow`] names the
//! revision it expects to replace (`None` = must not exist). When the stored
//! revision differs, the write is rejected with
//! [`ForkWriteOutcome::Conflict`] and the current state, so that
//! replication never overwrites an application write it has not seen.
//!
//! # Change Feed
//!
//! Every successful write gets a new, strictly increasing `sequence`.
//! [`ForkStore::changed_since`] pages through documents by sequence and
//! returns a checkpoint that resumes after the last returned document.
//!
//! [`MemoryForkStore`] implements the contract in memory and serves both as
//! a fork and, wrapped by
//! [`StorageReplicationHandler`](crate::handler::StorageReplicationHandler),
//! as a master.

use crate::document::{Checkpoint, Document};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Capacity of the change broadcast before slow receivers lag.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Storage backend error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StorageError {}

/// A document as persisted by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    /// Per-document write counter, used for optimistic concurrency.
    pub revision: u64,
    /// Store-wide change sequence of the last write.
    pub sequence: u64,
}

/// Who performed a write. Carried on change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteContext {
    /// Application write.
    Application,
    /// Master state applied by the pull cycle.
    Downstream,
    /// Conflict resolution written by a replication cycle.
    ConflictResolution,
    /// Write accepted by a storage-backed master handler.
    Replication,
}

impl std::fmt::Display for WriteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Application => write!(f, "application"),
            Self::Downstream => write!(f, "downstream"),
            Self::ConflictResolution => write!(f, "conflict_resolution"),
            Self::Replication => write!(f, "replication"),
        }
    }
}

/// A conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkWriteRow {
    /// Revision the write expects to replace. `None` means insert.
    pub previous_revision: Option<u64>,
    pub document: Document,
}

/// Per-row result of [`ForkStore::bulk_write`].
#[derive(Debug, Clone, PartialEq)]
pub enum ForkWriteOutcome {
    Written(StoredDocument),
    /// The expected revision did not match. Carries the current state.
    Conflict { current: Option<StoredDocument> },
}

/// One page of the change feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangedDocuments {
    /// Changed documents in sequence order.
    pub documents: Vec<StoredDocument>,
    /// Resume point after the last document. `None` when the page is empty.
    pub checkpoint: Option<Checkpoint>,
}

/// Documents written by one bulk write.
#[derive(Debug, Clone)]
pub struct ChangeEventBulk {
    pub documents: Vec<StoredDocument>,
    pub checkpoint: Checkpoint,
    pub context: WriteContext,
}

/// Trait defining what the protocol needs from a document store.
pub trait ForkStore: Send + Sync + 'static {
    /// Collection name, part of the replication key.
    fn name(&self) -> &str;

    /// Fetch current states by primary key. Absent ids are omitted.
    fn find_by_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashMap<String, StoredDocument>>;

    /// Apply conditional writes. Returns one outcome per row, in order.
    fn bulk_write(
        &self,
        rows: Vec<ForkWriteRow>,
        context: WriteContext,
    ) -> BoxFuture<'_, Vec<ForkWriteOutcome>>;

    /// Page through documents changed after `checkpoint`.
    fn changed_since(
        &self,
        checkpoint: Option<Checkpoint>,
        limit: usize,
    ) -> BoxFuture<'_, ChangedDocuments>;

    /// Subscribe to write notifications.
    fn changes(&self) -> broadcast::Receiver<ChangeEventBulk>;
}

fn sequence_checkpoint(sequence: u64) -> Checkpoint {
    Checkpoint(json!({ "sequence": sequence }))
}

fn sequence_of(checkpoint: Option<&Checkpoint>) -> u64 {
    checkpoint
        .and_then(|cp| cp.as_value().get("sequence"))
        .and_then(|seq| seq.as_u64())
        .unwrap_or(0)
}

#[derive(Default)]
struct ForkInner {
    documents: BTreeMap<String, StoredDocument>,
    sequence: u64,
}

impl ForkInner {
    fn write(&mut self, document: Document) -> StoredDocument {
        self.sequence += 1;
        let revision = self
            .documents
            .get(&document.id)
            .map(|current| current.revision + 1)
            .unwrap_or(1);
        let stored = StoredDocument {
            document,
            revision,
            sequence: self.sequence,
        };
        self.documents
            .insert(stored.document.id.clone(), stored.clone());
        stored
    }
}

/// In-memory [`ForkStore`].
pub struct MemoryForkStore {
    name: String,
    inner: RwLock<ForkInner>,
    changes: broadcast::Sender<ChangeEventBulk>,
    /// Remaining bulk writes that fail with an injected error.
    fail_writes: AtomicUsize,
}

impl MemoryForkStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            inner: RwLock::new(ForkInner::default()),
            changes,
            fail_writes: AtomicUsize::new(0),
        }
    }

    /// Unconditional application write (last writer wins).
    pub async fn put(&self, document: Document) -> StoredDocument {
        let mut inner = self.inner.write().await;
        let stored = inner.write(document);
        self.emit(vec![stored.clone()], WriteContext::Application);
        stored
    }

    /// Application delete: writes a tombstone keeping the last body.
    ///
    /// Returns `None` when the document does not exist.
    pub async fn delete(&self, id: &str) -> Option<StoredDocument> {
        let mut inner = self.inner.write().await;
        let current = inner.documents.get(id)?.document.clone();
        let stored = inner.write(current.into_deleted());
        self.emit(vec![stored.clone()], WriteContext::Application);
        Some(stored)
    }

    /// Current state of a document, tombstones included.
    pub async fn get(&self, id: &str) -> Option<Document> {
        self.inner
            .read()
            .await
            .documents
            .get(id)
            .map(|stored| stored.document.clone())
    }

    /// All documents including tombstones, ordered by id.
    pub async fn documents(&self) -> Vec<Document> {
        self.inner
            .read()
            .await
            .documents
            .values()
            .map(|stored| stored.document.clone())
            .collect()
    }

    /// Documents that are not deleted, ordered by id.
    pub async fn live_documents(&self) -> Vec<Document> {
        self.documents()
            .await
            .into_iter()
            .filter(|doc| !doc.deleted)
            .collect()
    }

    /// Current change sequence.
    pub async fn sequence(&self) -> u64 {
        self.inner.read().await.sequence
    }

    /// Make the next `n` calls to [`ForkStore::bulk_write`] fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn emit(&self, documents: Vec<StoredDocument>, context: WriteContext) {
        let Some(last) = documents.last().map(|stored| stored.sequence) else {
            return;
        };
        // No receivers is fine.
        let _ = self.changes.send(ChangeEventBulk {
            documents,
            checkpoint: sequence_checkpoint(last),
            context,
        });
    }
}

impl ForkStore for MemoryForkStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_by_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashMap<String, StoredDocument>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(ids
                .into_iter()
                .filter_map(|id| inner.documents.get(&id).map(|stored| (id, stored.clone())))
                .collect())
        })
    }

    fn bulk_write(
        &self,
        rows: Vec<ForkWriteRow>,
        context: WriteContext,
    ) -> BoxFuture<'_, Vec<ForkWriteOutcome>> {
        Box::pin(async move {
            if self.take_injected_failure() {
                return Err(StorageError::new(format!(
                    "injected write failure in '{}'",
                    self.name
                )));
            }

            let mut outcomes = Vec::with_capacity(rows.len());
            let mut written = Vec::new();
            let mut inner = self.inner.write().await;
            for row in rows {
                let current = inner.documents.get(&row.document.id).cloned();
                let current_revision = current.as_ref().map(|stored| stored.revision);
                if current_revision != row.previous_revision {
                    debug!(
                        store = %self.name,
                        document_id = %row.document.id,
                        expected = ?row.previous_revision,
                        actual = ?current_revision,
                        "Write conflict"
                    );
                    outcomes.push(ForkWriteOutcome::Conflict { current });
                    continue;
                }
                let stored = inner.write(row.document);
                written.push(stored.clone());
                outcomes.push(ForkWriteOutcome::Written(stored));
            }
            // Emitted under the lock so subscribers see bulks in sequence order.
            self.emit(written, context);
            Ok(outcomes)
        })
    }

    fn changed_since(
        &self,
        checkpoint: Option<Checkpoint>,
        limit: usize,
    ) -> BoxFuture<'_, ChangedDocuments> {
        Box::pin(async move {
            let after = sequence_of(checkpoint.as_ref());
            let inner = self.inner.read().await;
            let mut documents: Vec<StoredDocument> = inner
                .documents
                .values()
                .filter(|stored| stored.sequence > after)
                .cloned()
                .collect();
            documents.sort_by_key(|stored| stored.sequence);
            documents.truncate(limit);

            let checkpoint = documents
                .last()
                .map(|stored| sequence_checkpoint(stored.sequence));
            Ok(ChangedDocuments {
                documents,
                checkpoint,
            })
        })
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEventBulk> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(id: &str, n: i64) -> Document {
        Document::new(id, json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_put_assigns_revisions_and_sequences() {
        let store = MemoryForkStore::new("docs");
        let first = store.put(doc("a", 1)).await;
        let second = store.put(doc("a", 2)).await;
        let other = store.put(doc("b", 1)).await;

        assert_eq!((first.revision, first.sequence), (1, 1));
        assert_eq!((second.revision, second.sequence), (2, 2));
        assert_eq!((other.revision, other.sequence), (1, 3));
        assert_eq!(store.get("a").await, Some(doc("a", 2)));
    }

    #[tokio::test]
    async fn test_bulk_write_rejects_stale_revision() {
        let store = MemoryForkStore::new("docs");
        store.put(doc("a", 1)).await;

        let outcomes = store
            .bulk_write(
                vec![
                    ForkWriteRow { previous_revision: None, document: doc("a", 9) },
                    ForkWriteRow { previous_revision: None, document: doc("b", 1) },
                ],
                WriteContext::Downstream,
            )
            .await
            .unwrap();

        match &outcomes[0] {
            ForkWriteOutcome::Conflict { current: Some(current) } => {
                assert_eq!(current.document, doc("a", 1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(matches!(outcomes[1], ForkWriteOutcome::Written(_)));
        assert_eq!(store.get("a").await, Some(doc("a", 1)));
    }

    #[tokio::test]
    async fn test_bulk_write_with_matching_revision() {
        let store = MemoryForkStore::new("docs");
        let current = store.put(doc("a", 1)).await;

        let outcomes = store
            .bulk_write(
                vec![ForkWriteRow {
                    previous_revision: Some(current.revision),
                    document: doc("a", 2),
                }],
                WriteContext::ConflictResolution,
            )
            .await
            .unwrap();

        assert!(matches!(&outcomes[0], ForkWriteOutcome::Written(s) if s.revision == 2));
    }

    #[tokio::test]
    async fn test_changed_since_pages_by_sequence() {
        let store = MemoryForkStore::new("docs");
        for i in 0..5 {
            store.put(doc(&format!("d{i}"), i)).await;
        }
        store.put(doc("d0", 10)).await;

        let first = store.changed_since(None, 3).await.unwrap();
        let ids: Vec<_> = first.documents.iter().map(|s| s.document.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);

        let rest = store.changed_since(first.checkpoint.clone(), 10).await.unwrap();
        let ids: Vec<_> = rest.documents.iter().map(|s| s.document.id.as_str()).collect();
        assert_eq!(ids, vec!["d4", "d0"]);

        let empty = store.changed_since(rest.checkpoint, 10).await.unwrap();
        assert!(empty.documents.is_empty());
        assert!(empty.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone() {
        let store = MemoryForkStore::new("docs");
        store.put(doc("a", 1)).await;

        let stored = store.delete("a").await.unwrap();
        assert!(stored.document.deleted);
        assert!(store.live_documents().await.is_empty());
        assert!(store.delete("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_changes_carry_context() {
        let store = MemoryForkStore::new("docs");
        let mut rx = store.changes();

        store.put(doc("a", 1)).await;
        store
            .bulk_write(
                vec![ForkWriteRow { previous_revision: None, document: doc("b", 1) }],
                WriteContext::Downstream,
            )
            .await
            .unwrap();

        let app = rx.recv().await.unwrap();
        assert_eq!(app.context, WriteContext::Application);
        let down = rx.recv().await.unwrap();
        assert_eq!(down.context, WriteContext::Downstream);
        assert_eq!(down.checkpoint, sequence_checkpoint(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_emit_in_sequence_order() {
        let store = Arc::new(MemoryForkStore::new("docs"));
        let mut rx = store.changes();

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for n in 0..25 {
                        store.put(doc(&format!("w{writer}"), n)).await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..100 {
            let bulk = rx.recv().await.unwrap();
            let sequence = sequence_of(Some(&bulk.checkpoint));
            assert!(sequence > last, "sequence {sequence} emitted after {last}");
            last = sequence;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let store = MemoryForkStore::new("docs");
        store.fail_next_writes(1);

        let row = ForkWriteRow { previous_revision: None, document: doc("a", 1) };
        assert!(store.bulk_write(vec![row.clone()], WriteContext::Downstream).await.is_err());
        assert!(store.bulk_write(vec![row], WriteContext::Downstream).await.is_ok());
    }
}
