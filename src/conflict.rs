// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict handling.
//!
//! A conflict exists when the fork and the master both changed a document
//! since the last state both sides agreed on. The protocol detects it; a
//! [`ConflictHandler`] decides the outcome.
//!
//! Handlers must be deterministic and side-effect free: the same input may
//! be presented more than once (for example after a crash between a fork
//! write and the meta commit).
//!
//! Any `Fn(&ConflictInput) -> Result<ConflictResult, UnresolvableConflict>`
//! closure is a handler with structural equality:
//!
//! ```rust
//! use replication_protocol::conflict::{ConflictHandler, ConflictInput, ConflictResult, UnresolvableConflict};
//!
//! let fork_wins = |input: &ConflictInput| -> Result<ConflictResult, UnresolvableConflict> {
//!     Ok(ConflictResult::Resolved(input.fork_state.clone()))
//! };
//! let _handler: &dyn ConflictHandler = &fork_wins;
//! ```

use crate::document::Document;
use crate::meta::Direction;
use thiserror::Error;

/// What the conflict handler sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInput {
    /// Current state in the fork.
    pub fork_state: Document,
    /// Current state in the master.
    pub real_master_state: Document,
    /// Master state the fork last based a write on, if tracked.
    pub assumed_master_state: Option<Document>,
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResult {
    /// The states are equivalent. The fork state stands as is.
    NoConflict,
    /// Overwrite the fork with the master state.
    UseMaster,
    /// Write this merged state to the fork. It is pushed to the master
    /// unless it equals the master state.
    Resolved(Document),
}

/// The handler could not decide.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct UnresolvableConflict(pub String);

impl UnresolvableConflict {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Conflict policy.
pub trait ConflictHandler: Send + Sync + 'static {
    /// Semantic equality used for every fork/master/tracker comparison.
    fn is_equal(&self, a: &Document, b: &Document) -> bool {
        a == b
    }

    /// Decide the outcome of a detected conflict.
    fn resolve(&self, input: &ConflictInput) -> Result<ConflictResult, UnresolvableConflict>;
}

impl<F> ConflictHandler for F
where
    F: Fn(&ConflictInput) -> Result<ConflictResult, UnresolvableConflict> + Send + Sync + 'static,
{
    fn resolve(&self, input: &ConflictInput) -> Result<ConflictResult, UnresolvableConflict> {
        self(input)
    }
}

/// A conflict the handler settled, as broadcast on the resolved-conflicts
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    /// Cycle that detected the conflict.
    pub direction: Direction,
    pub input: ConflictInput,
    pub output: ConflictResult,
}

/// Master wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterWins;

impl ConflictHandler for MasterWins {
    fn resolve(&self, _input: &ConflictInput) -> Result<ConflictResult, UnresolvableConflict> {
        Ok(ConflictResult::UseMaster)
    }
}

/// Turn a handler decision into the state the fork should end up with.
pub(crate) fn resolved_state(input: &ConflictInput, result: &ConflictResult) -> Document {
    match result {
        ConflictResult::NoConflict => input.fork_state.clone(),
        ConflictResult::UseMaster => input.real_master_state.clone(),
        ConflictResult::Resolved(document) => document.clone(),
    }
}
