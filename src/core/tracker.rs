//! # Per-runner run tracker with sequence-based ordering.
//!
//! Remembers which run each runner is currently executing so that late or
//! duplicate events (a `Killed` for a run that was already replaced, a second
//! outcome for the same run) never reach subscribers.
//!
//! ## Architecture
//! ```text
//! Router::run() ──► RunTracker::dispatch(runner, request)
//!
//! Runners ──► Bus ──► router listener ──► RunTracker::update(&event)
//!                                              │ accepted → translated and emitted
//!                                              └ rejected → logged and dropped
//!                                     HashMap<RunnerKind, RunnerState>
//! ```
//!
//! ## Rules
//! - Only `RunnerRunning` / `RunnerOutcome` are tracked
//! - Events for a run other than the runner's current one are **stale**
//! - At most one outcome is accepted per run
//! - Events with `seq <= last_seq` are **rejected**

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::{Event, EventKind};
use crate::runners::{RunRequest, RunnerKind};

/// Per-runner state for ordering validation.
#[derive(Debug, Clone, Default)]
struct RunnerState {
    /// Last seen sequence number for this runner.
    last_seq: u64,
    /// Run dispatched most recently.
    request: Option<Arc<RunRequest>>,
    /// Outcome of `request` already accepted.
    settled: bool,
}

/// Thread-safe tracker of the run each runner is executing.
pub struct RunTracker {
    state: RwLock<HashMap<RunnerKind, RunnerState>>,
}

impl RunTracker {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Records that `request` was handed to `runner`; earlier runs become stale.
    pub async fn dispatch(&self, runner: RunnerKind, request: Arc<RunRequest>) {
        let mut state = self.state.write().await;
        let entry = state.entry(runner).or_default();
        entry.request = Some(request);
        entry.settled = false;
    }

    /// Forgets run `run_id` on `runner` (its start failed).
    pub async fn abandon(&self, runner: RunnerKind, run_id: u64) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.get_mut(&runner) {
            if entry.request.as_ref().is_some_and(|r| r.id == run_id) {
                entry.request = None;
            }
        }
    }

    /// Applies `ev` and returns the request it belongs to if it is current.
    ///
    /// ### State transitions
    /// - `RunnerRunning` for the current, unsettled run → accepted
    /// - `RunnerOutcome` for the current, unsettled run → accepted, run settled
    /// - Anything else → rejected
    ///
    /// ```text
    /// dispatch(Local, run 5)
    /// update(RunnerOutcome, Local, run 4)  → rejected (stale)
    /// update(RunnerOutcome, Local, run 5)  → accepted
    /// update(RunnerOutcome, Local, run 5)  → rejected (duplicate)
    /// ```
    pub async fn update(&self, ev: &Event) -> Option<Arc<RunRequest>> {
        let (Some(runner), Some(run_id)) = (ev.runner, ev.run_id) else {
            return None;
        };
        if !matches!(ev.kind, EventKind::RunnerRunning | EventKind::RunnerOutcome) {
            return None;
        }

        let mut state = self.state.write().await;
        let entry = state.get_mut(&runner)?;
        if ev.seq <= entry.last_seq {
            return None;
        }
        entry.last_seq = ev.seq;

        let request = entry.request.as_ref().filter(|r| r.id == run_id)?;
        if entry.settled {
            return None;
        }
        let request = Arc::clone(request);
        if ev.kind == EventKind::RunnerOutcome {
            entry.settled = true;
        }
        Some(request)
    }

    /// Sorted list of runners with an unsettled run.
    pub async fn active(&self) -> Vec<RunnerKind> {
        let state = self.state.read().await;
        let mut active: Vec<RunnerKind> = state
            .iter()
            .filter(|(_, st)| st.request.is_some() && !st.settled)
            .map(|(kind, _)| *kind)
            .collect();
        active.sort_unstable();
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::{Board, Geometry};
    use crate::error::RunOutcome;
    use crate::script::CombinedScript;
    use std::path::PathBuf;

    fn request(id: u64) -> Arc<RunRequest> {
        Arc::new(RunRequest {
            id,
            board: Arc::new(Board::new("Lightboard", Geometry::Ring { leds: 10 })),
            script: CombinedScript::combine("", "light.on()", ""),
            path: PathBuf::from("/tmp/x.py"),
        })
    }

    #[tokio::test]
    async fn stale_and_duplicate_outcomes_are_rejected() {
        let t = RunTracker::new();
        t.dispatch(RunnerKind::Local, request(4)).await;
        t.dispatch(RunnerKind::Local, request(5)).await;

        let stale = Event::runner_outcome(RunnerKind::Local, 4, RunOutcome::Killed);
        assert!(t.update(&stale).await.is_none());

        let running = Event::runner_running(RunnerKind::Local, 5);
        let done = Event::runner_outcome(RunnerKind::Local, 5, RunOutcome::Success);
        assert_eq!(t.update(&running).await.map(|r| r.id), Some(5));
        assert_eq!(t.active().await, vec![RunnerKind::Local]);
        assert_eq!(t.update(&done).await.map(|r| r.id), Some(5));

        let again = Event::runner_outcome(RunnerKind::Local, 5, RunOutcome::Success);
        assert!(t.update(&again).await.is_none());
        assert!(t.active().await.is_empty());
    }

    #[tokio::test]
    async fn older_sequence_numbers_are_rejected() {
        let t = RunTracker::new();
        t.dispatch(RunnerKind::Remote, request(1)).await;

        let early = Event::runner_running(RunnerKind::Remote, 1);
        let late = Event::runner_outcome(RunnerKind::Remote, 1, RunOutcome::Success);
        assert!(t.update(&late).await.is_some());
        assert!(t.update(&early).await.is_none());
    }

    #[tokio::test]
    async fn runners_are_tracked_independently() {
        let t = RunTracker::new();
        t.dispatch(RunnerKind::Simulation, request(1)).await;
        t.dispatch(RunnerKind::Local, request(1)).await;

        let sim = Event::runner_outcome(RunnerKind::Simulation, 1, RunOutcome::Success);
        assert!(t.update(&sim).await.is_some());
        assert_eq!(t.active().await, vec![RunnerKind::Local]);

        t.abandon(RunnerKind::Local, 1).await;
        assert!(t.active().await.is_empty());

        let unknown = Event::runner_outcome(RunnerKind::Remote, 1, RunOutcome::Killed);
        assert!(t.update(&unknown).await.is_none());
    }
}
