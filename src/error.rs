// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication protocol.
//!
//! Errors are categorized by the component that produced them (remote
//! handlers, the meta store, the fork storage) and carry enough context to
//! tell which direction and document were involved.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Handler` | Yes | Pull/push handler failed (network, remote unavailable) |
//! | `ConflictUnresolvable` | Yes | Conflict handler gave up; retried on next trigger |
//! | `MetaStore` | Yes | Checkpoint/tracker commit failed; cycle re-derives state |
//! | `Storage` | No | Fork storage error, propagated unchanged |
//! | `Document` | No | Malformed wire document |
//! | `StuckCycle` | No | Watchdog report, the cycle keeps running |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle violation |
//! | `Shutdown` | No | Replication is being cancelled |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Surfacing
//!
//! Replication cycles never return errors to the caller of
//! [`ReplicationState::start()`](crate::ReplicationState::start). Every
//! failure observed by a cycle is broadcast on the error channel as an
//! `Arc<ReplicationError>` (see [`ReplicationState::errors()`](crate::ReplicationState::errors)).

use crate::document::DocumentError;
use crate::meta::Direction;
use crate::storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A pull or push handler call failed.
    ///
    /// The cycle retries the call after the configured retry delay.
    #[error("{direction} handler error: {message}")]
    Handler { direction: Direction, message: String },

    /// The conflict handler could not produce a resolution.
    ///
    /// The affected batch is not checkpointed, so the document is
    /// reconsidered on the next cycle.
    #[error("Unresolvable conflict on document {document_id}: {message}")]
    ConflictUnresolvable { document_id: String, message: String },

    /// Reading or committing checkpoint / assumed-master rows failed.
    ///
    /// The checkpoint does not advance; the next cycle re-reads the same
    /// changes and reconciles against the master.
    #[error("Meta store error ({operation}): {message}")]
    MetaStore {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Fork storage error, surfaced unchanged.
    #[error("Fork storage error: {0}")]
    Storage(#[from] StorageError),

    /// A document on the wire did not match the configured schema.
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// A cycle has been running longer than the watchdog threshold.
    ///
    /// Reported periodically while the cycle is still in flight. The cycle
    /// itself is never aborted.
    #[error("{direction} cycle stuck for {elapsed:?}")]
    StuckCycle { direction: Direction, elapsed: Duration },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Cancellation in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a handler error for the given direction.
    pub fn handler(direction: Direction, message: impl Into<String>) -> Self {
        Self::Handler {
            direction,
            message: message.into(),
        }
    }

    /// Create a meta store error from a sqlx::Error
    pub fn meta(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::MetaStore {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a meta store error without source
    pub fn meta_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MetaStore {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handler { .. } => true,
            Self::ConflictUnresolvable { .. } => true,
            Self::MetaStore { .. } => true,
            Self::Storage(_) => false,
            Self::Document(_) => false,
            Self::StuckCycle { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short machine-readable label, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler { .. } => "handler",
            Self::ConflictUnresolvable { .. } => "conflict_unresolvable",
            Self::MetaStore { .. } => "meta_store",
            Self::Storage(_) => "storage",
            Self::Document(_) => "document",
            Self::StuckCycle { .. } => "stuck_cycle",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display() {
        let err = ReplicationError::handler(Direction::Down, "connection reset");
        assert_eq!(err.to_string(), "down handler error: connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "handler");
    }

    #[test]
    fn test_meta_msg_error() {
        let err = ReplicationError::meta_msg("commit", "disk full");
        assert_eq!(err.to_string(), "Meta store error (commit): disk full");
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_meta_error_keeps_source() {
        let err = ReplicationError::meta("checkpoint", sqlx::Error::RowNotFound);
        assert!(err.to_string().starts_with("Meta store error (checkpoint)"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_conflict_error_display() {
        let err = ReplicationError::ConflictUnresolvable {
            document_id: "doc-1".into(),
            message: "both sides deleted".into(),
        };
        assert!(err.to_string().contains("doc-1"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_storage_error_not_retryable() {
        let err: ReplicationError = StorageError::new("disk failure").into();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "storage");
    }

    #[test]
    fn test_stuck_cycle_display() {
        let err = ReplicationError::StuckCycle {
            direction: Direction::Up,
            elapsed: Duration::from_secs(61),
        };
        assert_eq!(err.to_string(), "up cycle stuck for 61s");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_non_retryable_variants() {
        assert!(!ReplicationError::Config("bad".into()).is_retryable());
        assert!(!ReplicationError::Shutdown.is_retryable());
        assert!(!ReplicationError::Internal("oops".into()).is_retryable());
        assert!(!ReplicationError::InvalidState {
            expected: "Created".into(),
            actual: "Running".into(),
        }
        .is_retryable());
    }
}
