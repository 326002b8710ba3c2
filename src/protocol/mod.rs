// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication cycles and the state they share.
//!
//! - [`downstream`]: pull cycle, master → fork
//! - [`upstream`]: push cycle, fork → master
//!
//! Both cycles run inside a lane worker ([`run_lane`]) that takes one
//! scheduled run at a time from the [`StreamQueue`], wraps it in a tracing
//! span and the stuck-cycle watchdog, and reports failures on the error
//! channel. A failed run is retried after the retry delay; the retry
//! re-derives everything from the stored checkpoint and tracker rows.
//!
//! # Cancellation
//!
//! Cooperative. Handler calls are never aborted, but every cycle checks
//! [`ReplicationContext::ensure_active`] before each fork write and each
//! meta commit, so a cancelled replication never advances a checkpoint.

pub(crate) mod downstream;
pub(crate) mod upstream;

use crate::circuit_breaker::{CircuitError, HandlerCircuit};
use crate::config::ReplicationConfig;
use crate::conflict::{ConflictHandler, ResolvedConflict};
use crate::coordinator::ReplicationStats;
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::handler::{HandlerError, PullHandler, PushHandler};
use crate::meta::{Direction, MetaInstance};
use crate::metrics;
use crate::queue::StreamQueue;
use crate::resilience::{backoff, RetryConfig};
use crate::storage::ForkStore;
use downstream::PullTasks;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info_span, warn, Instrument};

/// Capacity of each event channel before slow subscribers lag.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast channels of one replication.
#[derive(Clone)]
pub struct ReplicationEvents {
    /// Master documents written to the fork.
    pub received: broadcast::Sender<Document>,
    /// Fork documents accepted by the master.
    pub sent: broadcast::Sender<Document>,
    pub errors: broadcast::Sender<Arc<ReplicationError>>,
    pub resolved_conflicts: broadcast::Sender<ResolvedConflict>,
}

impl ReplicationEvents {
    pub fn new() -> Self {
        Self {
            received: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            sent: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            errors: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            resolved_conflicts: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }
}

impl Default for ReplicationEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Live counters behind [`ReplicationStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub pull_tasks_added: AtomicU64,
    pub pull_resyncs: AtomicU64,
    pub pull_batches_processed: AtomicU64,
    pub pull_stream_emits: AtomicU64,
    pub persisted_from_master: AtomicU64,
    pub push_initial_syncs: AtomicU64,
    pub fork_stream_emits: AtomicU64,
    pub persisted_to_master: AtomicU64,
    pub push_had_conflicts: AtomicU64,
    pub conflict_writes: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    pub fn snapshot(&self) -> ReplicationStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReplicationStats {
            pull_tasks_added: load(&self.pull_tasks_added),
            pull_resyncs: load(&self.pull_resyncs),
            pull_batches_processed: load(&self.pull_batches_processed),
            pull_stream_emits: load(&self.pull_stream_emits),
            persisted_from_master: load(&self.persisted_from_master),
            push_initial_syncs: load(&self.push_initial_syncs),
            fork_stream_emits: load(&self.fork_stream_emits),
            persisted_to_master: load(&self.persisted_to_master),
            push_had_conflicts: load(&self.push_had_conflicts),
            conflict_writes: load(&self.conflict_writes),
        }
    }
}

/// Which directions completed their first full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FirstSync {
    pub up: bool,
    pub down: bool,
}

impl FirstSync {
    pub fn is_done(&self) -> bool {
        self.up && self.down
    }
}

/// Everything a cycle needs. Shared by both lane workers.
pub(crate) struct ReplicationContext<F: ForkStore> {
    pub key: String,
    pub config: ReplicationConfig,
    pub fork: Arc<F>,
    pub meta: MetaInstance,
    /// `None` when the direction is disabled.
    pub pull: Option<Arc<dyn PullHandler>>,
    pub push: Option<Arc<dyn PushHandler>>,
    pub conflict: Arc<dyn ConflictHandler>,
    pub events: ReplicationEvents,
    pub cancel: watch::Receiver<bool>,
    pub circuit: HandlerCircuit,
    pub retry: RetryConfig,
    pub stats: StatsCounters,
    pub first_sync: watch::Sender<FirstSync>,
    pub queue: StreamQueue,
    pub pull_tasks: Mutex<PullTasks>,
}

impl<F: ForkStore> ReplicationContext<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: String,
        config: ReplicationConfig,
        fork: Arc<F>,
        meta: MetaInstance,
        pull: Option<Arc<dyn PullHandler>>,
        push: Option<Arc<dyn PushHandler>>,
        conflict: Arc<dyn ConflictHandler>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let circuit = HandlerCircuit::new(&key, config.circuit.clone());
        let retry = config.retry_config();
        // A disabled direction has nothing to sync.
        let first_sync = watch::Sender::new(FirstSync {
            up: push.is_none(),
            down: pull.is_none(),
        });
        let queue = StreamQueue::new(push.is_some(), pull.is_some());
        Self {
            key,
            config,
            fork,
            meta,
            pull,
            push,
            conflict,
            events: ReplicationEvents::new(),
            cancel,
            circuit,
            retry,
            stats: StatsCounters::default(),
            first_sync,
            queue,
            pull_tasks: Mutex::new(PullTasks::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// `Err(Shutdown)` once cancellation was requested.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ReplicationError::Shutdown);
        }
        Ok(())
    }

    /// Log, count and broadcast an error.
    pub fn emit_error(&self, error: ReplicationError) {
        error!(replication = %self.key, kind = error.kind(), error = %error, "Replication error");
        metrics::record_error(&self.key, error.kind());
        // No subscribers is fine.
        let _ = self.events.errors.send(Arc::new(error));
    }

    pub fn mark_first_sync(&self, direction: Direction) {
        self.first_sync.send_if_modified(|state| {
            let flag = match direction {
                Direction::Up => &mut state.up,
                Direction::Down => &mut state.down,
            };
            !std::mem::replace(flag, true)
        });
    }

    /// Call a handler through its circuit breaker, retrying failures until
    /// the retry policy gives up or the replication is cancelled.
    ///
    /// Every failed attempt is reported on the error channel.
    pub async fn call_with_retry<T, Fut, Call>(&self, direction: Direction, mut call: Call) -> Result<T>
    where
        Call: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, HandlerError>>,
    {
        let circuit = self.circuit.for_direction(direction);
        let mut cancel = self.cancel.clone();
        let mut attempt = 0usize;

        loop {
            self.ensure_active()?;
            attempt += 1;

            let failure = match circuit.call(|| call()).await {
                Ok(value) => return Ok(value),
                Err(CircuitError::Rejected) => {
                    debug!(replication = %self.key, %direction, attempt, "Handler circuit open");
                    None
                }
                Err(CircuitError::Inner(e)) => {
                    metrics::record_handler_error(&self.key, direction.as_str());
                    Some(ReplicationError::handler(direction, e.0))
                }
            };

            if !self.retry.should_retry(attempt) {
                return Err(failure.unwrap_or_else(|| {
                    ReplicationError::handler(direction, "circuit open, giving up")
                }));
            }

            let delay = self.retry.delay_for_attempt(attempt);
            if let Some(error) = failure {
                warn!(
                    replication = %self.key,
                    %direction,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Handler call failed, retrying"
                );
                self.emit_error(error);
            }
            if !backoff(delay, &mut cancel).await {
                return Err(ReplicationError::Shutdown);
            }
        }
    }

    /// Drive `cycle` to completion, reporting it on the error channel every
    /// watchdog period it stays in flight.
    pub async fn watch_cycle<T>(&self, direction: Direction, cycle: impl Future<Output = T>) -> T {
        let Some(threshold) = self.config.watchdog.threshold() else {
            return cycle.await;
        };

        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + threshold, threshold);
        tokio::pin!(cycle);

        loop {
            tokio::select! {
                output = &mut cycle => return output,
                _ = ticker.tick() => {
                    metrics::record_stuck_cycle(&self.key, direction.as_str());
                    self.emit_error(ReplicationError::StuckCycle {
                        direction,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }
    }

    /// Schedule a follow-up run after a failure.
    async fn schedule_retry(&self, direction: Direction) {
        if direction == Direction::Down {
            self.pull_tasks.lock().await.add_resync();
        }
        self.queue.trigger(direction);
    }
}

async fn run_cycle<F: ForkStore>(ctx: &ReplicationContext<F>, direction: Direction) -> Result<()> {
    match direction {
        Direction::Down => downstream::run(ctx).await,
        Direction::Up => upstream::run(ctx).await,
    }
}

/// Worker loop of one lane. Returns when the replication is cancelled.
pub(crate) async fn run_lane<F: ForkStore>(ctx: Arc<ReplicationContext<F>>, direction: Direction) {
    let mut shutdown = ctx.cancel.clone();
    debug!(replication = %ctx.key, %direction, "Lane worker started");

    while ctx.queue.begin_run(direction, &mut shutdown).await {
        let span = match direction {
            Direction::Down => info_span!("pull_cycle", replication = %ctx.key),
            Direction::Up => info_span!("push_cycle", replication = %ctx.key),
        };
        let started = Instant::now();
        let result = ctx
            .watch_cycle(direction, run_cycle(&ctx, direction))
            .instrument(span)
            .await;

        match result {
            Ok(()) => metrics::record_cycle(&ctx.key, direction.as_str(), started.elapsed()),
            Err(ReplicationError::Shutdown) => {
                debug!(replication = %ctx.key, %direction, "Cycle stopped by cancel");
            }
            Err(e) => {
                ctx.emit_error(e);
                // The lane stays busy while backing off so that in-sync
                // waiters do not see a false idle.
                if backoff(ctx.retry.initial_delay, &mut shutdown).await {
                    ctx.schedule_retry(direction).await;
                }
            }
        }
        ctx.queue.finish_run(direction);
    }

    debug!(replication = %ctx.key, %direction, "Lane worker stopped");
}
