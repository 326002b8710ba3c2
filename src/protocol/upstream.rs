// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push cycle: fork → master.
//!
//! A run pages through the fork's change feed from the stored push
//! checkpoint until it comes back empty. Each page:
//!
//! 1. drops documents whose tracker already holds an equal state
//! 2. sends the rest in `push.batch_size` chunks, each row paired with
//!    its tracker state
//! 3. settles the conflicts the master reported
//! 4. writes conflict resolutions to the fork, then commits tracker rows
//!    and the new checkpoint together
//!
//! Resolution writes get fresh fork sequences, so the next page picks
//! them up and pushes them against the master state now in the tracker.
//!
//! # Stale Trackers
//!
//! After a lost meta commit the tracker lags behind what the master
//! actually accepted. The replayed row then carries a stale assumed state;
//! a master that reports its current state as a conflict hands back the
//! very state we sent, which is recognized by equality and repairs the
//! tracker without consulting the conflict handler.

use super::downstream::outcome_label;
use super::{bump, ReplicationContext};
use crate::conflict::{resolved_state, ConflictInput, ResolvedConflict};
use crate::document::{Checkpoint, Document};
use crate::error::{ReplicationError, Result};
use crate::handler::{PushHandler, WriteRow};
use crate::meta::{AssumedMasterRow, AssumedMasterState, Direction, MetaBatch};
use crate::metrics;
use crate::storage::{ForkStore, ForkWriteOutcome, ForkWriteRow, StoredDocument, WriteContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of pushing one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    Persisted,
    /// An unresolvable conflict kept the checkpoint from advancing.
    Halted,
}

/// A row selected for pushing.
struct Candidate {
    stored: StoredDocument,
    assumed: Option<Document>,
}

/// Keep the last state of every id, in feed order.
pub(crate) fn latest_per_id(documents: Vec<StoredDocument>) -> Vec<StoredDocument> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<StoredDocument> = Vec::with_capacity(documents.len());
    for stored in documents {
        match index.get(&stored.document.id) {
            Some(&position) => latest[position] = stored,
            None => {
                index.insert(stored.document.id.clone(), latest.len());
                latest.push(stored);
            }
        }
    }
    latest
}

/// One push run.
pub(crate) async fn run<F: ForkStore>(ctx: &ReplicationContext<F>) -> Result<()> {
    let handler = ctx
        .push
        .clone()
        .ok_or_else(|| ReplicationError::Internal("push cycle without push handler".into()))?;
    bump(&ctx.stats.push_initial_syncs);

    let batch_size = ctx.config.push.batch_size;
    let mut checkpoint = ctx.meta.checkpoint(Direction::Up).await?;
    let mut pages = 0usize;

    loop {
        ctx.ensure_active()?;
        let changed = ctx.fork.changed_since(checkpoint.clone(), batch_size).await?;
        if changed.documents.is_empty() {
            break;
        }
        pages += 1;

        let next = Checkpoint::stack(checkpoint.as_ref(), changed.checkpoint);
        let outcome = persist_to_master(ctx, &handler, changed.documents, checkpoint.as_ref(), next.clone()).await?;
        if outcome == PushOutcome::Halted {
            warn!(pages, "Push halted by unresolvable conflict");
            return Ok(());
        }
        checkpoint = next;
    }

    if pages > 0 {
        info!(pages, "Push cycle complete");
    }
    ctx.mark_first_sync(Direction::Up);
    Ok(())
}

async fn persist_to_master<F: ForkStore>(
    ctx: &ReplicationContext<F>,
    handler: &Arc<dyn PushHandler>,
    documents: Vec<StoredDocument>,
    previous: Option<&Checkpoint>,
    checkpoint: Option<Checkpoint>,
) -> Result<PushOutcome> {
    let documents = latest_per_id(documents);
    let ids: Vec<String> = documents.iter().map(|s| s.document.id.clone()).collect();
    let assumed = ctx.meta.assumed_master(ids).await?;

    let candidates: Vec<Candidate> = documents
        .into_iter()
        .filter_map(|stored| {
            let tracker = assumed.get(&stored.document.id);
            if tracker.is_some_and(|t| t.is_known_as(&stored.document, ctx.conflict.as_ref())) {
                return None;
            }
            let assumed = tracker.and_then(AssumedMasterState::document).cloned();
            Some(Candidate { stored, assumed })
        })
        .collect();

    let mut batch = MetaBatch::new(Direction::Up);
    let mut sent = Vec::new();
    let mut resolution_writes = Vec::new();
    let mut resolution_masters = Vec::new();
    let mut halted = false;

    for chunk in candidates.chunks(ctx.config.push.batch_size) {
        let rows: Vec<WriteRow> = chunk
            .iter()
            .map(|c| WriteRow {
                new_document_state: c.stored.document.clone(),
                assumed_master_state: c.assumed.clone(),
            })
            .collect();

        let started = Instant::now();
        let conflicts = ctx
            .call_with_retry(Direction::Up, || handler.push(rows.clone()))
            .await?;
        metrics::record_push_batch(&ctx.key, rows.len(), conflicts.len(), started.elapsed());
        bump(&ctx.stats.persisted_to_master);
        if !conflicts.is_empty() {
            bump(&ctx.stats.push_had_conflicts);
        }
        debug!(rows = rows.len(), conflicts = conflicts.len(), "Pushed batch");

        let mut conflicts: HashMap<String, Document> =
            conflicts.into_iter().map(|doc| (doc.id.clone(), doc)).collect();

        for candidate in chunk {
            let new_state = &candidate.stored.document;
            let Some(master) = conflicts.remove(&new_state.id) else {
                batch.assumed.push(AssumedMasterRow {
                    document: new_state.clone(),
                    push_checkpoint: checkpoint.clone(),
                });
                sent.push(new_state.clone());
                continue;
            };

            if ctx.conflict.is_equal(new_state, &master) {
                // Stale tracker: the master already holds our state.
                metrics::record_conflict(&ctx.key, "up", "equal");
                batch.assumed.push(AssumedMasterRow {
                    document: master,
                    push_checkpoint: checkpoint.clone(),
                });
                continue;
            }

            let input = ConflictInput {
                fork_state: new_state.clone(),
                real_master_state: master,
                assumed_master_state: candidate.assumed.clone(),
            };
            match ctx.conflict.resolve(&input) {
                Ok(output) => {
                    metrics::record_conflict(&ctx.key, "up", outcome_label(&output));
                    resolution_writes.push(ForkWriteRow {
                        previous_revision: Some(candidate.stored.revision),
                        document: resolved_state(&input, &output),
                    });
                    resolution_masters.push(input.real_master_state.clone());
                    let _ = ctx.events.resolved_conflicts.send(ResolvedConflict {
                        direction: Direction::Up,
                        input,
                        output,
                    });
                }
                Err(e) => {
                    metrics::record_conflict(&ctx.key, "up", "unresolvable");
                    ctx.emit_error(ReplicationError::ConflictUnresolvable {
                        document_id: new_state.id.clone(),
                        message: e.to_string(),
                    });
                    halted = true;
                }
            }
        }
    }

    if !resolution_writes.is_empty() {
        ctx.ensure_active()?;
        let outcomes = ctx
            .fork
            .bulk_write(resolution_writes, WriteContext::ConflictResolution)
            .await?;
        let mut write_conflicts = 0usize;
        for (outcome, master) in outcomes.into_iter().zip(resolution_masters) {
            match outcome {
                ForkWriteOutcome::Written(_) => {
                    bump(&ctx.stats.conflict_writes);
                    batch.assumed.push(AssumedMasterRow {
                        document: master,
                        push_checkpoint: checkpoint.clone(),
                    });
                }
                // The application wrote again meanwhile. That write is
                // pushed against the old tracker and conflicts anew.
                ForkWriteOutcome::Conflict { .. } => write_conflicts += 1,
            }
        }
        if write_conflicts > 0 {
            warn!(write_conflicts, "Fork changed during conflict resolution");
            metrics::record_fork_write_conflicts(&ctx.key, "up", write_conflicts);
        }
    }

    if !halted && checkpoint.as_ref() != previous {
        batch.checkpoint = checkpoint;
    }
    ctx.ensure_active()?;
    ctx.meta.commit(batch).await?;

    for document in sent {
        let _ = ctx.events.sent.send(document);
    }

    Ok(if halted {
        PushOutcome::Halted
    } else {
        PushOutcome::Persisted
    })
}
