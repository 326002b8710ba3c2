//! In-memory meta store.
//!
//! Commits apply under a single write lock, which makes them atomic with
//! respect to readers. Two fault injection switches simulate what a real
//! backend can do to a cycle:
//!
//! - [`MemoryMetaStore::fail_next_commits`]: the commit returns an error
//! - [`MemoryMetaStore::drop_next_commits`]: the commit reports success but
//!   nothing is persisted, as if the process died right after the fork
//!   write and before the meta transaction reached disk

use super::{AssumedMasterRow, Direction, MetaBatch, MetaFuture, MetaStore};
use crate::document::Checkpoint;
use crate::error::ReplicationError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Default)]
struct MetaRows {
    checkpoints: HashMap<(String, Direction), Checkpoint>,
    assumed: BTreeMap<(String, String), AssumedMasterRow>,
}

#[derive(Default)]
pub struct MemoryMetaStore {
    rows: RwLock<MetaRows>,
    fail_commits: AtomicUsize,
    drop_commits: AtomicUsize,
    commits: AtomicU64,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a meta store error.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Silently discard the next `n` commits.
    pub fn drop_next_commits(&self, n: usize) {
        self.drop_commits.store(n, Ordering::SeqCst);
    }

    /// Number of commits that were persisted.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of assumed-master rows stored under `key`.
    pub async fn assumed_count(&self, key: &str) -> usize {
        self.rows
            .read()
            .await
            .assumed
            .keys()
            .filter(|(k, _)| k == key)
            .count()
    }
}

impl MetaStore for MemoryMetaStore {
    fn checkpoint<'a>(
        &'a self,
        key: &'a str,
        direction: Direction,
    ) -> MetaFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            Ok(self
                .rows
                .read()
                .await
                .checkpoints
                .get(&(key.to_string(), direction))
                .cloned())
        })
    }

    fn assumed_master<'a>(
        &'a self,
        key: &'a str,
        ids: Vec<String>,
    ) -> MetaFuture<'a, HashMap<String, AssumedMasterRow>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(ids
                .into_iter()
                .filter_map(|id| {
                    rows.assumed
                        .get(&(key.to_string(), id.clone()))
                        .map(|row| (id, row.clone()))
                })
                .collect())
        })
    }

    fn commit<'a>(&'a self, key: &'a str, batch: MetaBatch) -> MetaFuture<'a, ()> {
        Box::pin(async move {
            if take_one(&self.fail_commits) {
                return Err(ReplicationError::meta_msg("commit", "injected commit failure"));
            }
            if take_one(&self.drop_commits) {
                warn!(replication = %key, direction = %batch.direction, "Dropping meta commit");
                return Ok(());
            }

            let mut rows = self.rows.write().await;
            for row in batch.assumed {
                rows.assumed
                    .insert((key.to_string(), row.document.id.clone()), row);
            }
            if let Some(checkpoint) = batch.checkpoint {
                rows.checkpoints
                    .insert((key.to_string(), batch.direction), checkpoint);
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn purge<'a>(&'a self, key: &'a str, ids: Vec<String>) -> MetaFuture<'a, usize> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            Ok(ids
                .into_iter()
                .filter(|id| rows.assumed.remove(&(key.to_string(), id.clone())).is_some())
                .count())
        })
    }

    fn remove_all<'a>(&'a self, key: &'a str) -> MetaFuture<'a, ()> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            rows.checkpoints.retain(|(k, _), _| k != key);
            rows.assumed.retain(|(k, _), _| k != key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;

    fn batch(direction: Direction, ids: &[&str], checkpoint: u64) -> MetaBatch {
        MetaBatch {
            direction,
            checkpoint: Some(Checkpoint(json!({ "sequence": checkpoint }))),
            assumed: ids
                .iter()
                .map(|id| AssumedMasterRow {
                    document: Document::new(*id, json!({})),
                    push_checkpoint: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_commit_persists_rows_and_checkpoint() {
        let store = MemoryMetaStore::new();
        store.commit("k", batch(Direction::Down, &["a", "b"], 2)).await.unwrap();

        assert_eq!(
            store.checkpoint("k", Direction::Down).await.unwrap(),
            Some(Checkpoint(json!({ "sequence": 2 })))
        );
        assert!(store.checkpoint("k", Direction::Up).await.unwrap().is_none());
        let rows = store
            .assumed_master("k", vec!["a".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.contains_key("a"));
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = MemoryMetaStore::new();
        store.commit("k1", batch(Direction::Up, &["a"], 1)).await.unwrap();

        assert!(store.checkpoint("k2", Direction::Up).await.unwrap().is_none());
        assert_eq!(store.assumed_count("k1").await, 1);
        assert_eq!(store.assumed_count("k2").await, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_persists_nothing() {
        let store = MemoryMetaStore::new();
        store.fail_next_commits(1);

        let err = store.commit("k", batch(Direction::Up, &["a"], 1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::MetaStore { .. }));
        assert_eq!(store.assumed_count("k").await, 0);

        store.commit("k", batch(Direction::Up, &["a"], 1)).await.unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_commit_reports_success() {
        let store = MemoryMetaStore::new();
        store.drop_next_commits(1);

        store.commit("k", batch(Direction::Down, &["a"], 5)).await.unwrap();
        assert!(store.checkpoint("k", Direction::Down).await.unwrap().is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_and_remove_all() {
        let store = MemoryMetaStore::new();
        store.commit("k", batch(Direction::Down, &["a", "b", "c"], 1)).await.unwrap();
        store.commit("other", batch(Direction::Down, &["a"], 1)).await.unwrap();

        let removed = store.purge("k", vec!["a".into(), "zz".into()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.assumed_count("k").await, 2);

        store.remove_all("k").await.unwrap();
        assert_eq!(store.assumed_count("k").await, 0);
        assert!(store.checkpoint("k", Direction::Down).await.unwrap().is_none());
        assert_eq!(store.assumed_count("other").await, 1);
    }
}
