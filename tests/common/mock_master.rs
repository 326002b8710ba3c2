//! Mock master for testing.
//!
//! Wraps a [`StorageReplicationHandler`] over a [`MemoryForkStore`] and adds
//! failure injection plus recording of every push call.

use replication_protocol::{
    Checkpoint, ConflictHandler, ConflictInput, ConflictResult, Document, HandlerError, MasterWins,
    MemoryForkStore, PullBatch, PullHandler, PullStreamEvent, PushHandler, StorageReplicationHandler,
    UnresolvableConflict, WriteRow,
};
use replication_protocol::handler::HandlerFuture;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Master handler with injectable failures.
///
/// # Example
/// ```rust,ignore
/// let master = FlakyMaster::new();
/// master.fail_next_pushes(3);
///
/// // Use as both handlers...
///
/// assert_eq!(master.push_calls().len(), 4);
/// ```
pub struct FlakyMaster {
    inner: StorageReplicationHandler<MemoryForkStore>,
    fail_pulls: AtomicUsize,
    fail_pushes: AtomicUsize,
    pull_count: AtomicUsize,
    /// Report the current state as a conflict whenever the assumed state
    /// is stale, even if the pushed state already matches.
    strict: bool,
    pushes: Mutex<Vec<Vec<WriteRow>>>,
}

impl FlakyMaster {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A master that never accepts a row with a stale assumed state.
    pub fn strict() -> Self {
        Self::build(true)
    }

    fn build(strict: bool) -> Self {
        Self {
            inner: StorageReplicationHandler::new(Arc::new(MemoryForkStore::new("master")), Arc::new(MasterWins)),
            fail_pulls: AtomicUsize::new(0),
            fail_pushes: AtomicUsize::new(0),
            pull_count: AtomicUsize::new(0),
            strict,
            pushes: Mutex::new(Vec::new()),
        }
    }

    /// The master's document store.
    pub fn store(&self) -> &Arc<MemoryForkStore> {
        self.inner.store()
    }

    pub fn fail_next_pulls(&self, n: usize) {
        self.fail_pulls.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pushes(&self, n: usize) {
        self.fail_pushes.store(n, Ordering::SeqCst);
    }

    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    /// Rows of every push call that reached the master.
    pub fn push_calls(&self) -> Vec<Vec<WriteRow>> {
        self.pushes.lock().unwrap().clone()
    }
}

impl PullHandler for FlakyMaster {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> HandlerFuture<'_, PullBatch> {
        Box::pin(async move {
            self.pull_count.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.fail_pulls) {
                return Err(HandlerError::new("master unreachable"));
            }
            self.inner.pull(checkpoint, batch_size).await
        })
    }

    fn stream(&self) -> Option<BoxStream<'static, PullStreamEvent>> {
        self.inner.stream()
    }
}

impl PushHandler for FlakyMaster {
    fn push(&self, rows: Vec<WriteRow>) -> HandlerFuture<'_, Vec<Document>> {
        Box::pin(async move {
            if take_one(&self.fail_pushes) {
                return Err(HandlerError::new("master unreachable"));
            }
            self.pushes.lock().unwrap().push(rows.clone());

            if self.strict {
                let ids: Vec<String> = rows.iter().map(|r| r.new_document_state.id.clone()).collect();
                let mut stale = Vec::new();
                for id in ids {
                    let current = self.store().get(&id).await;
                    let row = rows.iter().find(|r| r.new_document_state.id == id);
                    if let (Some(current), Some(row)) = (current, row) {
                        if row.assumed_master_state.as_ref() != Some(&current) {
                            stale.push(current);
                        }
                    }
                }
                if !stale.is_empty() {
                    let accepted: Vec<WriteRow> = rows
                        .into_iter()
                        .filter(|r| !stale.iter().any(|s| s.id == r.new_document_state.id))
                        .collect();
                    let mut conflicts = self.inner.push(accepted).await?;
                    conflicts.extend(stale);
                    return Ok(conflicts);
                }
            }
            self.inner.push(rows).await
        })
    }
}

/// Pull-only master without a change stream; only polling sees its writes.
pub struct PollingMaster {
    inner: StorageReplicationHandler<MemoryForkStore>,
    pull_count: AtomicUsize,
}

impl PollingMaster {
    pub fn new() -> Self {
        Self {
            inner: StorageReplicationHandler::new(Arc::new(MemoryForkStore::new("master")), Arc::new(MasterWins)),
            pull_count: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<MemoryForkStore> {
        self.inner.store()
    }

    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }
}

impl PullHandler for PollingMaster {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> HandlerFuture<'_, PullBatch> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        self.inner.pull(checkpoint, batch_size)
    }
}

/// Pull-only master whose stream delivers an already superseded change
/// while the first pull is in flight, as a slow event transport would.
pub struct ReplayingMaster {
    inner: StorageReplicationHandler<MemoryForkStore>,
    late: Mutex<Option<PullStreamEvent>>,
    events: mpsc::UnboundedSender<PullStreamEvent>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<PullStreamEvent>>>,
}

impl ReplayingMaster {
    /// `late` is sent on the stream during the first pull.
    pub fn new(late: PullStreamEvent) -> Self {
        let (events, stream) = mpsc::unbounded();
        Self {
            inner: StorageReplicationHandler::new(Arc::new(MemoryForkStore::new("master")), Arc::new(MasterWins)),
            late: Mutex::new(Some(late)),
            events,
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn store(&self) -> &Arc<MemoryForkStore> {
        self.inner.store()
    }
}

impl PullHandler for ReplayingMaster {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> HandlerFuture<'_, PullBatch> {
        Box::pin(async move {
            let page = self.inner.pull(checkpoint, batch_size).await?;
            let late = self.late.lock().unwrap().take();
            if let Some(late) = late {
                let _ = self.events.unbounded_send(late);
            }
            Ok(page)
        })
    }

    fn stream(&self) -> Option<BoxStream<'static, PullStreamEvent>> {
        self.stream.lock().unwrap().take().map(|stream| stream.boxed())
    }
}

/// Master-wins handler that records every input it saw.
#[derive(Default)]
pub struct RecordingConflicts {
    pub inputs: Mutex<Vec<ConflictInput>>,
}

impl RecordingConflicts {
    pub fn calls(&self) -> Vec<ConflictInput> {
        self.inputs.lock().unwrap().clone()
    }
}

impl ConflictHandler for RecordingConflicts {
    fn resolve(&self, input: &ConflictInput) -> Result<ConflictResult, UnresolvableConflict> {
        self.inputs.lock().unwrap().push(input.clone());
        Ok(ConflictResult::UseMaster)
    }
}

/// Handler that refuses every conflict.
pub fn refusing_conflicts() -> Arc<dyn ConflictHandler> {
    Arc::new(|input: &ConflictInput| -> Result<ConflictResult, UnresolvableConflict> {
        Err(UnresolvableConflict::new(format!("refusing to merge {}", input.fork_state.id)))
    })
}
