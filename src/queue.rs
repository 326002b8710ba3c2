//! Per-direction cycle serialization.
//!
//! Each direction owns one lane. A lane runs at most one cycle at a time;
//! triggers that arrive while a cycle is in flight collapse into a single
//! pending flag, so exactly one follow-up cycle runs no matter how many
//! triggers arrived meanwhile.
//!
//! ```text
//! trigger ──→ pending ──begin_run──→ running ──finish_run──→ idle
//!                ↑                      │
//!                └──── trigger(s) ──────┘   (coalesced into one)
//! ```
//!
//! Lane state lives in a `watch` channel so observers can await
//! idleness or the end of the in-flight run without polling. A third
//! channel reports whether any lane is running.

use crate::meta::Direction;
use std::future::Future;
use tokio::sync::watch;
use tracing::trace;

/// Observable state of one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneState {
    /// Disabled lanes ignore triggers.
    pub enabled: bool,
    /// A cycle is in flight.
    pub running: bool,
    /// A cycle was requested and has not started yet.
    pub pending: bool,
    /// Cycles finished so far.
    pub completed_runs: u64,
}

impl LaneState {
    pub fn is_idle(&self) -> bool {
        !self.running && !self.pending
    }
}

/// Coalescing run queue, one lane per direction.
#[derive(Debug)]
pub struct StreamQueue {
    up: watch::Sender<LaneState>,
    down: watch::Sender<LaneState>,
    active: watch::Sender<bool>,
}

impl StreamQueue {
    pub fn new(up_enabled: bool, down_enabled: bool) -> Self {
        let lane = |enabled| {
            watch::Sender::new(LaneState {
                enabled,
                ..Default::default()
            })
        };
        Self {
            up: lane(up_enabled),
            down: lane(down_enabled),
            active: watch::Sender::new(false),
        }
    }

    fn lane(&self, direction: Direction) -> &watch::Sender<LaneState> {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// Request a cycle. Returns whether a new run was scheduled (`false`
    /// when one was already pending or the lane is disabled).
    pub fn trigger(&self, direction: Direction) -> bool {
        self.lane(direction).send_if_modified(|state| {
            if !state.enabled || state.pending {
                return false;
            }
            state.pending = true;
            trace!(%direction, running = state.running, "Cycle scheduled");
            true
        })
    }

    /// Current state of a lane.
    pub fn lane_state(&self, direction: Direction) -> LaneState {
        *self.lane(direction).borrow()
    }

    /// Subscribe to lane state changes.
    pub fn subscribe(&self, direction: Direction) -> watch::Receiver<LaneState> {
        self.lane(direction).subscribe()
    }

    /// `true` while a cycle runs in either lane.
    pub fn active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    fn refresh_active(&self) {
        let running = self.up.borrow().running || self.down.borrow().running;
        self.active.send_if_modified(|active| std::mem::replace(active, running) != running);
    }

    /// Wait for a pending trigger and mark the lane running.
    ///
    /// Returns `false` when `shutdown` fires first. Only the lane's single
    /// worker may call this.
    pub async fn begin_run(&self, direction: Direction, shutdown: &mut watch::Receiver<bool>) -> bool {
        let lane = self.lane(direction);
        let mut rx = lane.subscribe();
        let ready = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => false,
            res = rx.wait_for(|state| state.pending) => res.is_ok(),
        };
        if !ready {
            return false;
        }
        lane.send_modify(|state| {
            state.pending = false;
            state.running = true;
        });
        self.refresh_active();
        true
    }

    /// Mark the in-flight run finished.
    pub fn finish_run(&self, direction: Direction) {
        self.lane(direction).send_modify(|state| {
            state.running = false;
            state.completed_runs += 1;
        });
        self.refresh_active();
    }

    /// Completion of the in-flight run, or `None` when the lane is not
    /// running.
    pub fn current_run(&self, direction: Direction) -> Option<impl Future<Output = ()> + Send + 'static> {
        let lane = self.lane(direction);
        let state = *lane.borrow();
        if !state.running {
            return None;
        }
        let mut rx = lane.subscribe();
        let run = state.completed_runs;
        Some(async move {
            let _ = rx.wait_for(|s| s.completed_runs > run).await;
        })
    }

    /// Wait until the lane has nothing running or pending.
    pub async fn wait_idle(&self, direction: Direction) {
        let mut rx = self.lane(direction).subscribe();
        let _ = rx.wait_for(LaneState::is_idle).await;
    }

    /// Drop pending triggers in both lanes. Used on cancel so waiters
    /// are not left behind a run that will never start.
    pub fn clear_pending(&self) {
        for lane in [&self.up, &self.down] {
            lane.send_if_modified(|state| std::mem::take(&mut state.pending));
        }
    }

    /// Both lanes idle, plus the completed run counts observed.
    pub fn idle_snapshot(&self) -> Option<(u64, u64)> {
        let up = self.lane_state(Direction::Up);
        let down = self.lane_state(Direction::Down);
        (up.is_idle() && down.is_idle()).then_some((up.completed_runs, down.completed_runs))
    }
}
