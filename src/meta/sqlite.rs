// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable meta store backed by SQLite.
//!
//! ```text
//! replication_checkpoints        (replication_key, direction)   → checkpoint JSON
//! replication_assumed_master     (replication_key, document_id) → document JSON, push checkpoint
//! ```
//!
//! Tracker documents are stored as serialized [`Document`]s
//! (`{"id", "deleted", "data"}`), independent of the configured
//! [`DocumentSchema`](crate::DocumentSchema). Application fields that share
//! a name with the primary key or deletion flag survive the round trip.
//!
//! # Atomic Commits
//!
//! [`MetaStore::commit`] runs all upserts of a [`MetaBatch`] and the
//! checkpoint update in one transaction. A crash at any point leaves either
//! the whole batch or none of it.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when another connection holds
//! the write lock. Every statement (or whole transaction) is retried with
//! capped exponential backoff before the error is surfaced.

use super::{AssumedMasterRow, Direction, MetaBatch, MetaFuture, MetaStore};
use crate::document::{Checkpoint, Document};
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Ids per `IN (...)` lookup, below SQLite's bound parameter limit.
const LOOKUP_CHUNK: usize = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::meta_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn encode_json<T: serde::Serialize>(operation: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| ReplicationError::meta_msg(operation, format!("encode failed: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(operation: &str, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| ReplicationError::meta_msg(operation, format!("decode failed: {e}")))
}

/// SQLite-backed [`MetaStore`].
pub struct SqliteMetaStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteMetaStore {
    /// Open (or create) the database at `path` and its tables.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, wal_mode, "Opening meta store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let journal_mode = if wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A private in-memory database only exists on its own connection.
        let mut pool_options = SqlitePoolOptions::new().max_connections(2);
        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| ReplicationError::meta("open", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_checkpoints (
                replication_key TEXT NOT NULL,
                direction TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (replication_key, direction)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ReplicationError::meta("create_table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_assumed_master (
                replication_key TEXT NOT NULL,
                document_id TEXT NOT NULL,
                document TEXT NOT NULL,
                push_checkpoint TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (replication_key, document_id)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ReplicationError::meta("create_table", e))?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool, checkpointing the WAL first.
    pub async fn close(&self) {
        let pool = &self.pool;
        let result = execute_with_retry("meta_wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Meta store closed");
    }

    fn decode_row(&self, document: &str, push_checkpoint: Option<&str>) -> Result<AssumedMasterRow> {
        let document: Document = decode_json("assumed_master", document)?;
        let push_checkpoint = push_checkpoint
            .map(|text| decode_json("assumed_master", text).map(Checkpoint))
            .transpose()?;
        Ok(AssumedMasterRow {
            document,
            push_checkpoint,
        })
    }
}

impl MetaStore for SqliteMetaStore {
    fn checkpoint<'a>(
        &'a self,
        key: &'a str,
        direction: Direction,
    ) -> MetaFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            let pool = &self.pool;
            let row: Option<(String,)> = execute_with_retry("meta_checkpoint", || async {
                sqlx::query_as(
                    "SELECT checkpoint FROM replication_checkpoints WHERE replication_key = ? AND direction = ?",
                )
                .bind(key)
                .bind(direction.as_str())
                .fetch_optional(pool)
                .await
            })
            .await
            .map_err(|e| ReplicationError::meta("checkpoint", e))?;

            row.map(|(text,)| decode_json("checkpoint", &text).map(Checkpoint))
                .transpose()
        })
    }

    fn assumed_master<'a>(
        &'a self,
        key: &'a str,
        ids: Vec<String>,
    ) -> MetaFuture<'a, HashMap<String, AssumedMasterRow>> {
        Box::pin(async move {
            let pool = &self.pool;
            let mut found = HashMap::with_capacity(ids.len());

            for chunk in ids.chunks(LOOKUP_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT document_id, document, push_checkpoint FROM replication_assumed_master \
                     WHERE replication_key = ? AND document_id IN ({placeholders})"
                );
                let rows = execute_with_retry("meta_assumed_master", || async {
                    let mut query = sqlx::query(&sql).bind(key);
                    for id in chunk {
                        query = query.bind(id);
                    }
                    query.fetch_all(pool).await
                })
                .await
                .map_err(|e| ReplicationError::meta("assumed_master", e))?;

                for row in rows {
                    let document_id: String = row.get("document_id");
                    let document: String = row.get("document");
                    let push_checkpoint: Option<String> = row.get("push_checkpoint");
                    let decoded = self.decode_row(&document, push_checkpoint.as_deref())?;
                    found.insert(document_id, decoded);
                }
            }
            Ok(found)
        })
    }

    fn commit<'a>(&'a self, key: &'a str, batch: MetaBatch) -> MetaFuture<'a, ()> {
        Box::pin(async move {
            let mut rows = Vec::with_capacity(batch.assumed.len());
            for row in &batch.assumed {
                let document = encode_json("commit", &row.document)?;
                let push_checkpoint = row
                    .push_checkpoint
                    .as_ref()
                    .map(|cp| encode_json("commit", cp))
                    .transpose()?;
                rows.push((row.document.id.clone(), document, push_checkpoint));
            }
            let checkpoint = batch
                .checkpoint
                .as_ref()
                .map(|cp| encode_json("commit", cp))
                .transpose()?;
            let direction = batch.direction.as_str();
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;

            execute_with_retry("meta_commit", || async {
                let mut tx = pool.begin().await?;
                for (document_id, document, push_checkpoint) in &rows {
                    sqlx::query(
                        r#"
                        INSERT INTO replication_assumed_master
                            (replication_key, document_id, document, push_checkpoint, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(replication_key, document_id) DO UPDATE SET
                            document = excluded.document,
                            push_checkpoint = excluded.push_checkpoint,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(key)
                    .bind(document_id)
                    .bind(document)
                    .bind(push_checkpoint)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                if let Some(checkpoint) = &checkpoint {
                    sqlx::query(
                        r#"
                        INSERT INTO replication_checkpoints (replication_key, direction, checkpoint, updated_at)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT(replication_key, direction) DO UPDATE SET
                            checkpoint = excluded.checkpoint,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(key)
                    .bind(direction)
                    .bind(checkpoint)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await
            })
            .await
            .map_err(|e| ReplicationError::meta("commit", e))?;

            debug!(replication = %key, direction, rows = rows.len(), "Meta batch committed");
            Ok(())
        })
    }

    fn purge<'a>(&'a self, key: &'a str, ids: Vec<String>) -> MetaFuture<'a, usize> {
        Box::pin(async move {
            let pool = &self.pool;
            let mut removed = 0;
            for chunk in ids.chunks(LOOKUP_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "DELETE FROM replication_assumed_master \
                     WHERE replication_key = ? AND document_id IN ({placeholders})"
                );
                let result = execute_with_retry("meta_purge", || async {
                    let mut query = sqlx::query(&sql).bind(key);
                    for id in chunk {
                        query = query.bind(id);
                    }
                    query.execute(pool).await
                })
                .await
                .map_err(|e| ReplicationError::meta("purge", e))?;
                removed += result.rows_affected() as usize;
            }
            Ok(removed)
        })
    }

    fn remove_all<'a>(&'a self, key: &'a str) -> MetaFuture<'a, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_retry("meta_remove_all", || async {
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM replication_assumed_master WHERE replication_key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM replication_checkpoints WHERE replication_key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            })
            .await
            .map_err(|e| ReplicationError::meta("remove_all", e))?;

            info!(replication = %key, "Removed all meta rows");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn row(id: &str, n: i64, push_checkpoint: Option<u64>) -> AssumedMasterRow {
        AssumedMasterRow {
            document: Document::new(id, json!({ "n": n })),
            push_checkpoint: push_checkpoint.map(|seq| Checkpoint(json!({ "sequence": seq }))),
        }
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("meta.db"), true)
            .await
            .unwrap();

        store
            .commit(
                "k",
                MetaBatch {
                    direction: Direction::Up,
                    checkpoint: Some(Checkpoint(json!({ "sequence": 4 }))),
                    assumed: vec![row("a", 1, Some(4)), row("b", 2, None)],
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.checkpoint("k", Direction::Up).await.unwrap(),
            Some(Checkpoint(json!({ "sequence": 4 })))
        );
        assert!(store.checkpoint("k", Direction::Down).await.unwrap().is_none());

        let rows = store
            .assumed_master("k", vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["a"], row("a", 1, Some(4)));
        assert_eq!(rows["b"], row("b", 2, None));

        store.close().await;
    }

    #[tokio::test]
    async fn test_commit_upserts() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("meta.db"), true)
            .await
            .unwrap();

        for n in 1..=3 {
            store
                .commit(
                    "k",
                    MetaBatch {
                        direction: Direction::Down,
                        checkpoint: Some(Checkpoint(json!({ "sequence": n }))),
                        assumed: vec![row("a", n, None)],
                    },
                )
                .await
                .unwrap();
        }

        let rows = store.assumed_master("k", vec!["a".into()]).await.unwrap();
        assert_eq!(rows["a"], row("a", 3, None));
        assert_eq!(
            store.checkpoint("k", Direction::Down).await.unwrap(),
            Some(Checkpoint(json!({ "sequence": 3 })))
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let store = SqliteMetaStore::open(&path, true).await.unwrap();
            store
                .commit(
                    "k",
                    MetaBatch {
                        direction: Direction::Down,
                        checkpoint: Some(Checkpoint(json!("cursor-9"))),
                        assumed: vec![row("a", 1, None)],
                    },
                )
                .await
                .unwrap();
            store.close().await;
        }

        {
            let store = SqliteMetaStore::open(&path, true).await.unwrap();
            assert_eq!(
                store.checkpoint("k", Direction::Down).await.unwrap(),
                Some(Checkpoint(json!("cursor-9")))
            );
            assert_eq!(store.assumed_master("k", vec!["a".into()]).await.unwrap().len(), 1);
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_documents_stored_as_serialized_documents() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("docs.db"), false).await.unwrap();

        let mut batch = MetaBatch::new(Direction::Down);
        batch.assumed.push(AssumedMasterRow {
            document: Document::tombstone("x"),
            push_checkpoint: None,
        });
        store.commit("k", batch).await.unwrap();

        let (raw,): (String,) =
            sqlx::query_as("SELECT document FROM replication_assumed_master WHERE document_id = 'x'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({"id": "x", "deleted": true, "data": {}}));

        let rows = store.assumed_master("k", vec!["x".into()]).await.unwrap();
        assert_eq!(rows["x"].document, Document::tombstone("x"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_reserved_field_names_in_body_round_trip() {
        let store = SqliteMetaStore::open(":memory:", false).await.unwrap();
        let document = Document::new("x", json!({ "id": "shadow", "_deleted": "maybe", "n": 1 }));

        let mut batch = MetaBatch::new(Direction::Up);
        batch.assumed.push(AssumedMasterRow {
            document: document.clone(),
            push_checkpoint: Some(Checkpoint(json!({ "sequence": 3 }))),
        });
        store.commit("k", batch).await.unwrap();

        let rows = store.assumed_master("k", vec!["x".into()]).await.unwrap();
        assert_eq!(rows["x"].document, document);
        assert_eq!(rows["x"].push_checkpoint, Some(Checkpoint(json!({ "sequence": 3 }))));
        store.close().await;
    }

    #[tokio::test]
    async fn test_lookup_larger_than_chunk() {
        let store = SqliteMetaStore::open(":memory:", false)
            .await
            .unwrap();

        let mut batch = MetaBatch::new(Direction::Down);
        let ids: Vec<String> = (0..LOOKUP_CHUNK + 20).map(|i| format!("doc-{i}")).collect();
        for id in &ids {
            batch.assumed.push(row(id, 0, None));
        }
        store.commit("k", batch).await.unwrap();

        let rows = store.assumed_master("k", ids.clone()).await.unwrap();
        assert_eq!(rows.len(), ids.len());

        let removed = store.purge("k", ids[..10].to_vec()).await.unwrap();
        assert_eq!(removed, 10);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let store = SqliteMetaStore::open(":memory:", false)
            .await
            .unwrap();
        for key in ["k1", "k2"] {
            store
                .commit(
                    key,
                    MetaBatch {
                        direction: Direction::Up,
                        checkpoint: Some(Checkpoint(json!(1))),
                        assumed: vec![row("a", 1, None)],
                    },
                )
                .await
                .unwrap();
        }

        store.remove_all("k1").await.unwrap();

        assert!(store.checkpoint("k1", Direction::Up).await.unwrap().is_none());
        assert!(store.assumed_master("k1", vec!["a".into()]).await.unwrap().is_empty());
        assert!(store.checkpoint("k2", Direction::Up).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, sqlx::Error>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = execute_with_retry("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
