// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull cycle: master → fork.
//!
//! A run consumes the queued pull tasks:
//!
//! - any [`PullStreamEvent::Resync`] turns the run into a full drain from
//!   the stored checkpoint, subsuming queued batches
//! - otherwise the queued stream batches are merged (latest document per
//!   id, checkpoints stacked) and applied as one batch
//!
//! # Per-Document Decision
//!
//! With fork state `F`, incoming master state `M` and tracker `T`:
//!
//! ```text
//! F == M                  → no fork write, record T := M if needed
//! T == M, F present       → skip, the pending local write is the push cycle's job
//! F absent or F == T      → write M, T := M
//! otherwise               → conflict handler, write the resolution, T := M,
//!                           trigger push when the resolution differs from M
//! ```
//!
//! The fork writes happen first, then tracker rows and the new checkpoint
//! are committed together. A crash in between leaves the checkpoint behind
//! and the same batch is replayed; the `F == M` rule makes the replay a
//! tracker repair instead of a conflict.

use super::{bump, ReplicationContext};
use crate::conflict::{resolved_state, ConflictHandler, ConflictInput, ConflictResult, ResolvedConflict};
use crate::document::{Checkpoint, Document};
use crate::error::{ReplicationError, Result};
use crate::handler::{PullBatch, PullStreamEvent};
use crate::meta::{AssumedMasterRow, AssumedMasterState, Direction, MetaBatch};
use crate::metrics;
use crate::storage::{ForkStore, ForkWriteOutcome, ForkWriteRow, WriteContext};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pull tasks waiting for the next run.
///
/// Tasks carry a logical time. Tasks older than the last pull request of a
/// drain are dropped: the drain already fetched what they describe, and
/// applying them afterwards would move the checkpoint backwards.
///
/// A batch that arrives while a drain is in flight may predate the page
/// the drain commits. The same holds after the drain until the stream has
/// handed over every event already buffered. Such batches are queued as a
/// [`PullStreamEvent::Resync`] instead, so the next run pages from the
/// stored checkpoint.
#[derive(Debug)]
pub(crate) struct PullTasks {
    clock: u64,
    last_requested: u64,
    window: DrainWindow,
    drains_finished: u64,
    open: Vec<(u64, PullStreamEvent)>,
}

/// Whether stream batches may overlap a drain's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainWindow {
    Closed,
    /// A drain has requested at least one page.
    Draining,
    /// The drain finished; the stream may still hold events it overlapped.
    Settling,
}

impl Default for PullTasks {
    fn default() -> Self {
        Self {
            clock: 1,
            last_requested: 0,
            window: DrainWindow::Closed,
            drains_finished: 0,
            open: Vec::new(),
        }
    }
}

impl PullTasks {
    pub fn add(&mut self, event: PullStreamEvent) {
        let time = self.tick();
        let event = match event {
            PullStreamEvent::Batch(_) if self.window != DrainWindow::Closed => PullStreamEvent::Resync,
            event => event,
        };
        self.open.push((time, event));
    }

    pub fn add_resync(&mut self) {
        self.add(PullStreamEvent::Resync);
    }

    fn tick(&mut self) -> u64 {
        let time = self.clock;
        self.clock += 1;
        time
    }

    fn mark_requested(&mut self) {
        self.last_requested = self.tick();
        self.window = DrainWindow::Draining;
    }

    fn finish_drain(&mut self) {
        if self.window == DrainWindow::Draining {
            self.window = DrainWindow::Settling;
            self.drains_finished += 1;
        }
    }

    /// Token to read before polling the stream for buffered events.
    pub fn drains_finished(&self) -> u64 {
        self.drains_finished
    }

    /// The pull stream had nothing buffered when polled after `token` was
    /// read. Batches from then on were emitted after the last drain read
    /// the master, unless another drain finished in between.
    pub fn stream_settled(&mut self, token: u64) {
        if self.window == DrainWindow::Settling && self.drains_finished == token {
            self.window = DrainWindow::Closed;
        }
    }

    /// Remove and return every task still relevant.
    pub fn take(&mut self) -> Vec<PullStreamEvent> {
        let last_requested = self.last_requested;
        std::mem::take(&mut self.open)
            .into_iter()
            .filter(|(time, _)| *time > last_requested)
            .map(|(_, event)| event)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }
}

/// Merge stream batches: latest document per id wins, checkpoints stack.
pub(crate) fn merge_batches(tasks: Vec<PullStreamEvent>) -> PullBatch {
    let mut merged = PullBatch::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for task in tasks {
        let PullStreamEvent::Batch(batch) = task else {
            continue;
        };
        for document in batch.documents {
            match index.get(&document.id) {
                Some(&position) => merged.documents[position] = document,
                None => {
                    index.insert(document.id.clone(), merged.documents.len());
                    merged.documents.push(document);
                }
            }
        }
        merged.checkpoint = Checkpoint::stack(merged.checkpoint.as_ref(), batch.checkpoint);
    }
    merged
}

/// What to do with one incoming master document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownAction {
    /// Fork already equals master; only the tracker is updated.
    Track,
    /// Nothing to do.
    Skip,
    /// Write the master state into the fork.
    WriteMaster,
    /// Fork diverged from what we last knew of the master.
    Conflict,
}

pub(crate) fn classify(
    fork: Option<&Document>,
    master: &Document,
    tracker: &AssumedMasterState,
    handler: &dyn ConflictHandler,
) -> DownAction {
    match fork {
        None => DownAction::WriteMaster,
        Some(fork) if handler.is_equal(fork, master) => {
            if tracker.is_known_as(master, handler) {
                DownAction::Skip
            } else {
                DownAction::Track
            }
        }
        Some(fork) => {
            if tracker.is_known_as(master, handler) {
                DownAction::Skip
            } else if tracker.is_known_as(fork, handler) {
                DownAction::WriteMaster
            } else {
                DownAction::Conflict
            }
        }
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    Applied,
    /// An unresolvable conflict kept the checkpoint from advancing.
    Halted,
}

/// A fork write waiting for its outcome.
struct PendingWrite {
    master: Document,
    /// The write applies the master state as is.
    from_master: bool,
}

/// One pull run.
pub(crate) async fn run<F: ForkStore>(ctx: &ReplicationContext<F>) -> Result<()> {
    let tasks = ctx.pull_tasks.lock().await.take();
    if tasks.is_empty() {
        return Ok(());
    }

    if tasks.iter().any(|task| matches!(task, PullStreamEvent::Resync)) {
        bump(&ctx.stats.pull_resyncs);
        let drained = drain(ctx).await;
        ctx.pull_tasks.lock().await.finish_drain();
        return drained;
    }

    bump(&ctx.stats.pull_batches_processed);
    let batch = merge_batches(tasks);
    if batch.documents.is_empty() {
        return Ok(());
    }
    let previous = ctx.meta.checkpoint(Direction::Down).await?;
    let checkpoint = Checkpoint::stack(previous.as_ref(), batch.checkpoint);
    debug!(documents = batch.documents.len(), "Applying streamed master changes");
    apply(ctx, batch.documents, previous.as_ref(), checkpoint).await?;
    Ok(())
}

/// Page through the master from the stored checkpoint until a short page.
async fn drain<F: ForkStore>(ctx: &ReplicationContext<F>) -> Result<()> {
    let handler = ctx
        .pull
        .clone()
        .ok_or_else(|| ReplicationError::Internal("pull cycle without pull handler".into()))?;
    let batch_size = ctx.config.pull.batch_size;
    let mut checkpoint = ctx.meta.checkpoint(Direction::Down).await?;
    let mut pages = 0usize;

    loop {
        ctx.ensure_active()?;
        ctx.pull_tasks.lock().await.mark_requested();

        let started = Instant::now();
        let request = checkpoint.clone();
        let batch = ctx
            .call_with_retry(Direction::Down, || handler.pull(request.clone(), batch_size))
            .await?;
        let count = batch.documents.len();
        metrics::record_pull_batch(&ctx.key, count, started.elapsed());

        if count == 0 {
            break;
        }
        pages += 1;

        let next = Checkpoint::stack(checkpoint.as_ref(), batch.checkpoint);
        if apply(ctx, batch.documents, checkpoint.as_ref(), next.clone()).await? == ApplyOutcome::Halted {
            warn!(pages, "Drain halted by unresolvable conflict");
            return Ok(());
        }
        checkpoint = next;

        if count < batch_size {
            break;
        }
    }

    info!(pages, "Pull drain complete");
    ctx.mark_first_sync(Direction::Down);
    Ok(())
}

/// Apply master documents to the fork and commit trackers plus checkpoint.
async fn apply<F: ForkStore>(
    ctx: &ReplicationContext<F>,
    documents: Vec<Document>,
    previous: Option<&Checkpoint>,
    checkpoint: Option<Checkpoint>,
) -> Result<ApplyOutcome> {
    let ids: Vec<String> = documents.iter().map(|doc| doc.id.clone()).collect();
    let fork_state = ctx.fork.find_by_ids(ids.clone()).await?;
    let assumed = ctx.meta.assumed_master(ids).await?;
    let push_checkpoint = ctx.meta.checkpoint(Direction::Up).await?;
    let handler = ctx.conflict.as_ref();

    let mut batch = MetaBatch::new(Direction::Down);
    let mut writes = Vec::new();
    let mut pending = Vec::new();
    let mut halted = false;

    for master in documents {
        let current = fork_state.get(&master.id);
        let tracker = assumed
            .get(&master.id)
            .cloned()
            .unwrap_or(AssumedMasterState::Unknown);

        match classify(current.map(|s| &s.document), &master, &tracker, handler) {
            DownAction::Skip => {}
            DownAction::Track => batch.assumed.push(AssumedMasterRow {
                document: master,
                push_checkpoint: push_checkpoint.clone(),
            }),
            DownAction::WriteMaster => {
                writes.push(ForkWriteRow {
                    previous_revision: current.map(|s| s.revision),
                    document: master.clone(),
                });
                pending.push(PendingWrite { master, from_master: true });
            }
            DownAction::Conflict => {
                // classify only reports conflicts for present fork documents
                let Some(current) = current else { continue };
                let input = ConflictInput {
                    fork_state: current.document.clone(),
                    real_master_state: master.clone(),
                    assumed_master_state: tracker.document().cloned(),
                };
                match handler.resolve(&input) {
                    Ok(output) => {
                        let resolved = resolved_state(&input, &output);
                        let from_master = handler.is_equal(&resolved, &master);
                        metrics::record_conflict(&ctx.key, "down", outcome_label(&output));
                        debug!(document_id = %master.id, from_master, "Resolved pull conflict");
                        writes.push(ForkWriteRow {
                            previous_revision: Some(current.revision),
                            document: resolved,
                        });
                        pending.push(PendingWrite { master, from_master });
                        let _ = ctx.events.resolved_conflicts.send(ResolvedConflict {
                            direction: Direction::Down,
                            input,
                            output,
                        });
                    }
                    Err(e) => {
                        metrics::record_conflict(&ctx.key, "down", "unresolvable");
                        ctx.emit_error(ReplicationError::ConflictUnresolvable {
                            document_id: master.id.clone(),
                            message: e.to_string(),
                        });
                        halted = true;
                    }
                }
            }
        }
    }

    let mut received = Vec::new();
    let mut needs_push = false;
    if !writes.is_empty() {
        ctx.ensure_active()?;
        let outcomes = ctx.fork.bulk_write(writes, WriteContext::Downstream).await?;
        let mut write_conflicts = 0usize;
        for (outcome, write) in outcomes.into_iter().zip(pending) {
            match outcome {
                ForkWriteOutcome::Written(_) => {
                    if write.from_master {
                        received.push(write.master.clone());
                    } else {
                        needs_push = true;
                    }
                    batch.assumed.push(AssumedMasterRow {
                        document: write.master,
                        push_checkpoint: push_checkpoint.clone(),
                    });
                }
                ForkWriteOutcome::Conflict { .. } => {
                    // Concurrent application write. Its push reconciles it.
                    write_conflicts += 1;
                }
            }
        }
        if write_conflicts > 0 {
            warn!(write_conflicts, "Fork changed during pull, rows skipped");
            metrics::record_fork_write_conflicts(&ctx.key, "down", write_conflicts);
        }
    }

    if !halted && checkpoint.as_ref() != previous {
        batch.checkpoint = checkpoint;
    }
    ctx.ensure_active()?;
    ctx.meta.commit(batch).await?;
    bump(&ctx.stats.persisted_from_master);

    if !received.is_empty() {
        metrics::record_documents_received(&ctx.key, received.len());
        for document in received {
            let _ = ctx.events.received.send(document);
        }
    }
    if needs_push {
        ctx.queue.trigger(Direction::Up);
    }

    Ok(if halted {
        ApplyOutcome::Halted
    } else {
        ApplyOutcome::Applied
    })
}

/// Metrics label of a conflict resolution.
pub(crate) fn outcome_label(output: &ConflictResult) -> &'static str {
    match output {
        ConflictResult::NoConflict => "no_conflict",
        ConflictResult::UseMaster => "use_master",
        ConflictResult::Resolved(_) => "resolved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::MasterWins;
    use serde_json::json;

    fn doc(id: &str, name: &str) -> Document {
        Document::new(id, json!({ "name": name }))
    }

    fn known(document: Document) -> AssumedMasterState {
        AssumedMasterState::Known {
            document,
            push_checkpoint: None,
        }
    }

    #[test]
    fn test_classify_absent_fork_writes_master() {
        let action = classify(None, &doc("a", "x"), &AssumedMasterState::Unknown, &MasterWins);
        assert_eq!(action, DownAction::WriteMaster);
    }

    #[test]
    fn test_classify_equal_states() {
        let m = doc("a", "x");
        assert_eq!(classify(Some(&m), &m, &AssumedMasterState::Unknown, &MasterWins), DownAction::Track);
        assert_eq!(classify(Some(&m), &m, &known(m.clone()), &MasterWins), DownAction::Skip);
        assert_eq!(classify(Some(&m), &m, &known(doc("a", "old")), &MasterWins), DownAction::Track);
    }

    #[test]
    fn test_classify_fork_in_sync_with_tracker() {
        let fork = doc("a", "x");
        let master = doc("a", "y");
        assert_eq!(
            classify(Some(&fork), &master, &known(fork.clone()), &MasterWins),
            DownAction::WriteMaster
        );
    }

    #[test]
    fn test_classify_pending_local_write() {
        let fork = doc("a", "z");
        let master = doc("a", "x");
        assert_eq!(
            classify(Some(&fork), &master, &known(master.clone()), &MasterWins),
            DownAction::Skip
        );
    }

    #[test]
    fn test_classify_divergence_is_conflict() {
        let fork = doc("a", "z");
        let master = doc("a", "w");
        assert_eq!(
            classify(Some(&fork), &master, &known(doc("a", "x")), &MasterWins),
            DownAction::Conflict
        );
        assert_eq!(
            classify(Some(&fork), &master, &AssumedMasterState::Unknown, &MasterWins),
            DownAction::Conflict
        );
    }

    #[test]
    fn test_merge_batches_latest_wins() {
        let merged = merge_batches(vec![
            PullStreamEvent::Batch(PullBatch {
                documents: vec![doc("a", "1"), doc("b", "1")],
                checkpoint: Some(Checkpoint(json!({ "sequence": 2, "lwt": 10 }))),
            }),
            PullStreamEvent::Batch(PullBatch {
                documents: vec![doc("a", "2")],
                checkpoint: Some(Checkpoint(json!({ "sequence": 3 }))),
            }),
        ]);

        assert_eq!(merged.documents, vec![doc("a", "2"), doc("b", "1")]);
        assert_eq!(merged.checkpoint, Some(Checkpoint(json!({ "sequence": 3, "lwt": 10 }))));
    }

    #[test]
    fn test_pull_tasks_drop_stale_events() {
        let mut tasks = PullTasks::default();
        tasks.add(PullStreamEvent::Batch(PullBatch::default()));
        tasks.mark_requested();
        tasks.add_resync();
        assert_eq!(tasks.len(), 2);

        let taken = tasks.take();
        assert_eq!(taken, vec![PullStreamEvent::Resync]);
        assert_eq!(tasks.len(), 0);
    }

    #[test]
    fn test_pull_tasks_batches_during_drain_become_resync() {
        let batch = PullBatch {
            documents: vec![Document::new("a", json!({ "v": 1 }))],
            checkpoint: Some(Checkpoint::new(json!({ "sequence": 1 }))),
        };
        let mut tasks = PullTasks::default();
        tasks.mark_requested();
        tasks.add(PullStreamEvent::Batch(batch.clone()));
        assert_eq!(tasks.take(), vec![PullStreamEvent::Resync]);

        // Polled empty while the drain still ran.
        let token = tasks.drains_finished();
        tasks.stream_settled(token);
        tasks.finish_drain();
        tasks.add(PullStreamEvent::Batch(batch.clone()));
        assert_eq!(tasks.take(), vec![PullStreamEvent::Resync]);

        // Token read before the drain finished does not close the window.
        tasks.stream_settled(token);
        tasks.add(PullStreamEvent::Batch(batch.clone()));
        assert_eq!(tasks.take(), vec![PullStreamEvent::Resync]);

        tasks.stream_settled(tasks.drains_finished());
        tasks.add(PullStreamEvent::Batch(batch.clone()));
        assert_eq!(tasks.take(), vec![PullStreamEvent::Batch(batch)]);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&ConflictResult::NoConflict), "no_conflict");
        assert_eq!(outcome_label(&ConflictResult::UseMaster), "use_master");
        assert_eq!(outcome_label(&ConflictResult::Resolved(doc("a", "m"))), "resolved");
    }
}
