//! # Per-runner run state.
//!
//! [`RunSlot`] is the single source of truth for "what is this runner doing":
//! the [`RunState`], the id of the run it belongs to and the cancellation token
//! of that run. State lives in a `watch` channel so callers can await `Idle`.
//!
//! ## Rules
//! - Only the run that owns the slot can move it (`mark_running`, `finish` check the id)
//! - At most one terminal transition per run: the first `finish` wins, later ones
//!   return `false` and must not publish an outcome
//! - Terminal states are recorded in [`RunSlot::last_terminal`] and the slot settles
//!   to `Idle` in the same step

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{MutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of one run on one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run in flight.
    Idle,
    /// Dispatched; waiting for the back-end to confirm.
    Starting,
    /// Back-end confirmed the process is live.
    Running,
    /// Script completed (with or without a script error).
    Finished,
    /// Transport failure.
    Failed,
    /// Cancelled by `kill`.
    Killed,
}

impl RunState {
    /// `Starting` or `Running`.
    pub fn is_busy(self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed | RunState::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Failed => "failed",
            RunState::Killed => "killed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    state: RunState,
    run_id: Option<u64>,
    last: Option<RunState>,
}

/// Shared state of one runner's current run.
pub struct RunSlot {
    tx: watch::Sender<Snapshot>,
    ops: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Default for RunSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSlot {
    /// Creates an idle slot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot {
            state: RunState::Idle,
            run_id: None,
            last: None,
        });
        Self {
            tx,
            ops: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        self.tx.borrow().state
    }

    /// True while a run is `Starting` or `Running`.
    pub fn is_running(&self) -> bool {
        self.state().is_busy()
    }

    /// Id of the run in flight, if any.
    pub fn current_run(&self) -> Option<u64> {
        let snap = *self.tx.borrow();
        snap.run_id.filter(|_| snap.state.is_busy())
    }

    /// How the most recent run ended.
    pub fn last_terminal(&self) -> Option<RunState> {
        self.tx.borrow().last
    }

    /// Resolves once no run is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| !s.state.is_busy()).await;
    }

    /// Serialises `start`/`kill` on the owning runner.
    pub(crate) async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    /// `Idle -> Starting` for `run_id`. Returns the run's cancellation token.
    pub(crate) fn begin(&self, run_id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel_guard() = Some(token.clone());
        self.tx.send_modify(|s| {
            s.state = RunState::Starting;
            s.run_id = Some(run_id);
        });
        token
    }

    /// `Starting -> Running`. Ignored unless `run_id` still owns the slot.
    pub(crate) fn mark_running(&self, run_id: u64) -> bool {
        self.tx.send_if_modified(|s| {
            if s.run_id == Some(run_id) && s.state == RunState::Starting {
                s.state = RunState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Records the terminal state of `run_id` and settles to `Idle`.
    ///
    /// Returns `false` if the run no longer owns the slot or already finished.
    pub(crate) fn finish(&self, run_id: u64, terminal: RunState) -> bool {
        debug_assert!(terminal.is_terminal());
        let done = self.tx.send_if_modified(|s| {
            if s.run_id == Some(run_id) && s.state.is_busy() {
                s.state = RunState::Idle;
                s.last = Some(terminal);
                true
            } else {
                false
            }
        });
        if done {
            *self.cancel_guard() = None;
        }
        done
    }

    /// Cancels the run in flight. Returns its id.
    pub(crate) fn cancel_current(&self) -> Option<u64> {
        let run_id = self.current_run()?;
        if let Some(token) = self.cancel_guard().as_ref() {
            token.cancel();
        }
        Some(run_id)
    }

    /// Kill-then-restart: cancels the run in flight and waits (bounded) for it to settle.
    pub(crate) async fn preempt(&self, wait: Duration) {
        let Some(run_id) = self.cancel_current() else {
            return;
        };
        debug!(run_id, "preempting run in flight");
        if tokio::time::timeout(wait, self.wait_idle()).await.is_err() {
            warn!(run_id, "previous run did not settle in time");
        }
    }

    fn cancel_guard(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}
