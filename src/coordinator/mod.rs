// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication orchestrator.
//!
//! [`ReplicationState`] ties together:
//! - the fork store and its change stream
//! - the pull and push handlers (and the optional master stream)
//! - the [`MetaInstance`] holding checkpoints and tracker rows
//! - one lane worker per direction, fed by the [`StreamQueue`](crate::queue::StreamQueue)
//!
//! # Lifecycle
//!
//! 1. [`ReplicationState::builder()`] validates the config and opens the
//!    meta store
//! 2. [`start()`](ReplicationState::start) waits for leadership, applies
//!    initial checkpoints and wires the triggers
//! 3. every trigger schedules a cycle on its lane; bursts coalesce
//! 4. [`cancel()`](ReplicationState::cancel) stops the triggers, lets the
//!    in-flight cycles notice the cancel flag and joins the workers
//!
//! Without `live`, the replication cancels itself once both directions are
//! in sync.
//!
//! # Triggers
//!
//! ```text
//! fork change bulk (not Downstream) ──→ Up lane
//! master stream event ──→ pull task ──→ Down lane
//! live_interval tick ──→ RESYNC task ──→ Down lane
//! pull cycle wrote a merge the master lacks ──→ Up lane
//! ```

mod types;

pub use types::{ReplicationPhase, ReplicationStats};

use crate::circuit_breaker::HandlerCircuitMetrics;
use crate::config::ReplicationConfig;
use crate::conflict::{ConflictHandler, MasterWins, ResolvedConflict};
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::handler::{PullHandler, PushHandler};
use crate::meta::{open_meta_store, replication_key, Direction, MetaBatch, MetaInstance, MetaStore};
use crate::metrics;
use crate::protocol::{bump, run_lane, FirstSync, ReplicationContext};
use crate::queue::LaneState;
use crate::registry::{RegisteredReplication, ReplicationRegistry};
use crate::storage::{ForkStore, WriteContext};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Awaited before the first cycle when leadership is required.
pub type LeadershipSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Time both lanes must stay idle, with no run completing, to count as in sync.
const IN_SYNC_SETTLE: Duration = Duration::from_millis(25);

/// Time a worker gets to notice the cancel flag before it is aborted.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A replication between one fork store and one master.
///
/// Several instances may replicate the same identifier against the same
/// fork at once. Their tracker writes are idempotent, so the worst case is
/// redundant handler calls.
pub struct ReplicationState<F: ForkStore> {
    ctx: Arc<ReplicationContext<F>>,
    instance_id: u64,
    phase_tx: watch::Sender<ReplicationPhase>,
    shutdown_tx: watch::Sender<bool>,
    leadership: Mutex<Option<LeadershipSignal>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    registry: Option<Arc<ReplicationRegistry>>,
}

/// Builder for [`ReplicationState`].
pub struct ReplicationBuilder<F: ForkStore> {
    fork: Arc<F>,
    config: ReplicationConfig,
    meta_store: Option<Arc<dyn MetaStore>>,
    pull: Option<Arc<dyn PullHandler>>,
    push: Option<Arc<dyn PushHandler>>,
    conflict: Arc<dyn ConflictHandler>,
    leadership: Option<LeadershipSignal>,
    registry: Option<Arc<ReplicationRegistry>>,
}

impl<F: ForkStore> ReplicationBuilder<F> {
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already opened meta store instead of `config.meta`.
    pub fn meta_store(mut self, store: Arc<dyn MetaStore>) -> Self {
        self.meta_store = Some(store);
        self
    }

    pub fn pull(mut self, handler: Arc<dyn PullHandler>) -> Self {
        self.pull = Some(handler);
        self
    }

    pub fn push(mut self, handler: Arc<dyn PushHandler>) -> Self {
        self.push = Some(handler);
        self
    }

    /// Defaults to [`MasterWins`].
    pub fn conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict = handler;
        self
    }

    /// Resolves once this process may replicate. Ignored unless
    /// `wait_for_leadership` is set.
    pub fn leadership(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.leadership = Some(Box::pin(signal));
        self
    }

    pub fn registry(mut self, registry: Arc<ReplicationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the config, open the meta store and register the replication.
    pub async fn build(self) -> Result<Arc<ReplicationState<F>>> {
        let config = self.config;
        config.validate()?;

        let pull = match (config.pull.enabled, self.pull) {
            (true, None) => {
                return Err(ReplicationError::Config(
                    "pull is enabled but no pull handler was given".to_string(),
                ))
            }
            (true, handler) => handler,
            (false, _) => None,
        };
        let push = match (config.push.enabled, self.push) {
            (true, None) => {
                return Err(ReplicationError::Config(
                    "push is enabled but no push handler was given".to_string(),
                ))
            }
            (true, handler) => handler,
            (false, _) => None,
        };

        let key = replication_key(self.fork.name(), &config.replication_identifier);
        let store = match self.meta_store {
            Some(store) => store,
            None => open_meta_store(&config.meta).await?,
        };
        let meta = MetaInstance::new(key.clone(), store);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ReplicationContext::new(
            key.clone(),
            config,
            self.fork,
            meta,
            pull,
            push,
            self.conflict,
            shutdown_rx,
        );

        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ReplicationState {
            ctx: Arc::new(ctx),
            instance_id,
            phase_tx: watch::Sender::new(ReplicationPhase::Created),
            shutdown_tx,
            leadership: Mutex::new(self.leadership),
            handles: Mutex::new(Vec::new()),
            registry: self.registry,
        });

        if let Some(registry) = &state.registry {
            let weak: Weak<dyn RegisteredReplication> = Arc::downgrade(&state) as Weak<dyn RegisteredReplication>;
            registry.register(instance_id, state.identifier(), weak);
        }

        metrics::set_replication_phase(&key, "Created");
        info!(
            replication = %key,
            identifier = %state.identifier(),
            instance_id,
            pull = state.ctx.pull.is_some(),
            push = state.ctx.push.is_some(),
            "Replication created"
        );
        Ok(state)
    }
}

impl<F: ForkStore> ReplicationState<F> {
    /// Start building a replication of `fork`.
    pub fn builder(fork: Arc<F>) -> ReplicationBuilder<F> {
        ReplicationBuilder {
            fork,
            config: ReplicationConfig::default(),
            meta_store: None,
            pull: None,
            push: None,
            conflict: Arc::new(MasterWins),
            leadership: None,
            registry: None,
        }
    }

    /// Replication key the meta rows are stored under.
    pub fn key(&self) -> &str {
        &self.ctx.key
    }

    pub fn identifier(&self) -> &str {
        &self.ctx.config.replication_identifier
    }

    /// Process-unique id of this instance.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.ctx.config
    }

    pub fn fork(&self) -> &Arc<F> {
        &self.ctx.fork
    }

    pub fn phase(&self) -> ReplicationPhase {
        *self.phase_tx.borrow()
    }

    /// Watch phase transitions.
    pub fn phase_receiver(&self) -> watch::Receiver<ReplicationPhase> {
        self.phase_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ReplicationPhase::Running
    }

    pub fn stats(&self) -> ReplicationStats {
        self.ctx.stats.snapshot()
    }

    pub fn circuit_metrics(&self) -> HandlerCircuitMetrics {
        self.ctx.circuit.metrics()
    }

    pub fn lane_state(&self, direction: Direction) -> LaneState {
        self.ctx.queue.lane_state(direction)
    }

    /// `true` while a pull or push cycle is in flight.
    pub fn active(&self) -> watch::Receiver<bool> {
        self.ctx.queue.active()
    }

    /// Master documents written to the fork.
    pub fn received(&self) -> broadcast::Receiver<Document> {
        self.ctx.events.received.subscribe()
    }

    /// Fork documents the master accepted.
    pub fn sent(&self) -> broadcast::Receiver<Document> {
        self.ctx.events.sent.subscribe()
    }

    /// Handler failures, unresolvable conflicts, storage errors and
    /// stuck-cycle reports.
    pub fn errors(&self) -> broadcast::Receiver<Arc<ReplicationError>> {
        self.ctx.events.errors.subscribe()
    }

    pub fn resolved_conflicts(&self) -> broadcast::Receiver<ResolvedConflict> {
        self.ctx.events.resolved_conflicts.subscribe()
    }

    /// In-flight cycle of `direction`, for tests and diagnostics.
    pub fn current_run(&self, direction: Direction) -> Option<impl Future<Output = ()> + Send + 'static> {
        self.ctx.queue.current_run(direction)
    }

    /// Start replicating.
    ///
    /// Calling it again, or after [`cancel()`](Self::cancel), does nothing.
    /// Failures while starting are reported on the error channel.
    pub async fn start(self: &Arc<Self>) {
        let entered = self.phase_tx.send_if_modified(|phase| {
            if *phase != ReplicationPhase::Created {
                return false;
            }
            *phase = ReplicationPhase::WaitingForLeadership;
            true
        });
        if !entered {
            debug!(replication = %self.key(), phase = %self.phase(), "Start ignored");
            return;
        }
        metrics::set_replication_phase(self.key(), "WaitingForLeadership");

        let leadership = self.leadership.lock().await.take();
        if let Some(signal) = leadership.filter(|_| self.ctx.config.wait_for_leadership) {
            info!(replication = %self.key(), "Waiting for leadership");
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::select! {
                _ = signal => {}
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    debug!(replication = %self.key(), "Cancelled while waiting for leadership");
                    return;
                }
            }
        }

        self.apply_initial_checkpoints().await;

        let running = self.phase_tx.send_if_modified(|phase| {
            if *phase != ReplicationPhase::WaitingForLeadership {
                return false;
            }
            *phase = ReplicationPhase::Running;
            true
        });
        if !running {
            return;
        }
        metrics::set_replication_phase(self.key(), "Running");

        {
            let mut handles = self.handles.lock().await;
            // cancel() raises the flag before taking the handles.
            if *self.shutdown_tx.borrow() {
                return;
            }
            self.spawn_workers(&mut handles);
        }

        if self.ctx.pull.is_some() {
            self.ctx.pull_tasks.lock().await.add_resync();
            bump(&self.ctx.stats.pull_tasks_added);
            self.ctx.queue.trigger(Direction::Down);
        }
        if self.ctx.push.is_some() {
            self.ctx.queue.trigger(Direction::Up);
        }

        info!(
            replication = %self.key(),
            live = self.ctx.config.live,
            "Replication running"
        );

        if !self.ctx.config.live {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if this.await_in_sync().await.is_ok() {
                    info!(replication = %this.key(), "One-shot replication in sync");
                }
                this.cancel().await;
            });
        }
    }

    /// Store the configured initial checkpoints where none is persisted.
    async fn apply_initial_checkpoints(&self) {
        let initial = &self.ctx.config.initial_checkpoint;
        let directions = [
            (Direction::Up, initial.upstream.clone()),
            (Direction::Down, initial.downstream.clone()),
        ];
        for (direction, checkpoint) in directions {
            let Some(checkpoint) = checkpoint else {
                continue;
            };
            let result = async {
                if self.ctx.meta.checkpoint(direction).await?.is_some() {
                    return Ok(());
                }
                let mut batch = MetaBatch::new(direction);
                batch.checkpoint = Some(checkpoint);
                self.ctx.meta.commit(batch).await?;
                debug!(replication = %self.key(), %direction, "Initial checkpoint applied");
                Ok::<(), ReplicationError>(())
            }
            .await;
            if let Err(e) = result {
                self.ctx.emit_error(e);
            }
        }
    }

    fn spawn_workers(&self, handles: &mut Vec<JoinHandle<()>>) {
        let ctx = &self.ctx;
        for direction in [Direction::Down, Direction::Up] {
            if ctx.queue.lane_state(direction).enabled {
                handles.push(tokio::spawn(run_lane(Arc::clone(ctx), direction)));
            }
        }

        if !ctx.config.live {
            return;
        }

        if ctx.push.is_some() {
            handles.push(tokio::spawn(forward_fork_changes(Arc::clone(ctx), ctx.fork.changes())));
        }

        if let Some(pull) = &ctx.pull {
            if let Some(stream) = pull.stream() {
                handles.push(tokio::spawn(forward_pull_stream(Arc::clone(ctx), stream)));
            }
            if let Some(period) = ctx.config.live_interval_duration() {
                handles.push(tokio::spawn(resync_every(Arc::clone(ctx), period)));
            }
        }

        debug!(replication = %self.key(), tasks = handles.len(), "Spawned replication tasks");
    }

    /// Stop replicating and wait until all workers stopped.
    ///
    /// In-flight cycles finish their current handler call but persist
    /// nothing after it. Calling it again waits for the first call.
    pub async fn cancel(&self) {
        let first = self.phase_tx.send_if_modified(|phase| {
            if phase.is_cancelled() {
                return false;
            }
            *phase = ReplicationPhase::Cancelling;
            true
        });
        if !first {
            let mut phase = self.phase_tx.subscribe();
            let _ = phase.wait_for(|p| *p == ReplicationPhase::Cancelled).await;
            return;
        }

        info!(replication = %self.key(), "Cancelling replication");
        metrics::set_replication_phase(self.key(), "Cancelling");
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task stopped"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during cancel"),
                Err(_) => {
                    warn!(task = i + 1, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.ctx.queue.clear_pending();
        if let Some(registry) = &self.registry {
            registry.unregister(self.instance_id);
        }

        self.phase_tx.send_replace(ReplicationPhase::Cancelled);
        metrics::set_replication_phase(self.key(), "Cancelled");
        info!(replication = %self.key(), "Replication cancelled");
    }

    /// Resolves once every enabled direction finished its first full drain.
    ///
    /// `Err(Shutdown)` when the replication is cancelled first.
    pub async fn await_initial_replication(&self) -> Result<()> {
        let mut first_sync = self.ctx.first_sync.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            biased;
            done = async { first_sync.wait_for(FirstSync::is_done).await.is_ok() } => {
                if done { Ok(()) } else { Err(ReplicationError::Shutdown) }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => Err(ReplicationError::Shutdown),
        }
    }

    /// Resolves once both directions have no pending work.
    ///
    /// Waits for the initial replication, then for two idle observations
    /// of both lanes, [`IN_SYNC_SETTLE`] apart, with no run completing in
    /// between. The settle window lets fork change events that are
    /// already in flight reach the push lane.
    pub async fn await_in_sync(&self) -> Result<()> {
        self.await_initial_replication().await?;
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let settled = async {
                self.ctx.queue.wait_idle(Direction::Up).await;
                self.ctx.queue.wait_idle(Direction::Down).await;
                let Some(before) = self.ctx.queue.idle_snapshot() else {
                    return false;
                };
                tokio::time::sleep(IN_SYNC_SETTLE).await;
                self.ctx.queue.idle_snapshot() == Some(before)
            };
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Err(ReplicationError::Shutdown),
                in_sync = settled => {
                    if in_sync {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Cancel and delete every checkpoint and tracker row of this
    /// replication. The next replication with the same key starts over.
    pub async fn remove(&self) -> Result<()> {
        self.cancel().await;
        self.ctx.meta.remove_all().await?;
        info!(replication = %self.key(), "Replication state removed");
        Ok(())
    }

    /// Forget tracker rows of documents purged from the fork.
    pub async fn purge_documents(&self, ids: Vec<String>) -> Result<usize> {
        let purged = self.ctx.meta.purge(ids).await?;
        debug!(replication = %self.key(), purged, "Purged tracker rows");
        Ok(purged)
    }
}

impl<F: ForkStore> RegisteredReplication for ReplicationState<F> {
    fn identifier(&self) -> &str {
        ReplicationState::identifier(self)
    }

    fn cancel_boxed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.cancel())
    }
}

impl<F: ForkStore> Drop for ReplicationState<F> {
    fn drop(&mut self) {
        // Workers hold the context, not the state; stop them.
        self.shutdown_tx.send_replace(true);
        if let Some(registry) = &self.registry {
            registry.unregister(self.instance_id);
        }
    }
}

/// Trigger the push lane for fork writes the pull cycle did not make.
async fn forward_fork_changes<F: ForkStore>(
    ctx: Arc<ReplicationContext<F>>,
    mut changes: broadcast::Receiver<crate::storage::ChangeEventBulk>,
) {
    let mut shutdown = ctx.cancel.clone();
    loop {
        let received = tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            received = changes.recv() => received,
        };
        match received {
            Ok(bulk) if bulk.context == WriteContext::Downstream => {}
            Ok(bulk) => {
                bump(&ctx.stats.fork_stream_emits);
                debug!(documents = bulk.documents.len(), context = %bulk.context, "Fork changed");
                ctx.queue.trigger(Direction::Up);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // The push cycle reads the change feed itself; one run covers
                // whatever was skipped.
                warn!(replication = %ctx.key, skipped, "Fork change stream lagged");
                ctx.queue.trigger(Direction::Up);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(replication = %ctx.key, "Fork change forwarder stopped");
}

/// Queue master stream events as pull tasks.
async fn forward_pull_stream<F: ForkStore>(
    ctx: Arc<ReplicationContext<F>>,
    mut stream: futures::stream::BoxStream<'static, crate::handler::PullStreamEvent>,
) {
    let mut shutdown = ctx.cancel.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let token = ctx.pull_tasks.lock().await.drains_finished();
        let event = match stream.next().now_or_never() {
            Some(event) => event,
            None => {
                ctx.pull_tasks.lock().await.stream_settled(token);
                tokio::select! {
                    biased;
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    event = stream.next() => event,
                }
            }
        };
        let Some(event) = event else {
            debug!(replication = %ctx.key, "Master stream ended");
            break;
        };
        bump(&ctx.stats.pull_stream_emits);
        bump(&ctx.stats.pull_tasks_added);
        ctx.pull_tasks.lock().await.add(event);
        ctx.queue.trigger(Direction::Down);
    }
}

/// Periodic RESYNC in live mode.
async fn resync_every<F: ForkStore>(ctx: Arc<ReplicationContext<F>>, period: Duration) {
    let mut shutdown = ctx.cancel.clone();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            _ = ticker.tick() => {
                ctx.pull_tasks.lock().await.add_resync();
                bump(&ctx.stats.pull_tasks_added);
                ctx.queue.trigger(Direction::Down);
            }
        }
    }
}
