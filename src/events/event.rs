//! # Events emitted by the router and its runners.
//!
//! The [`EventKind`] enum classifies event types across three categories:
//! - **Public events**: what a UI subscribes to (board changes, finished runs, errors, status)
//! - **Internal events**: raw per-runner outcomes, translated by the router before delivery
//! - **Diagnostic events**: subscriber overflow and panics
//!
//! The [`Event`] struct carries additional metadata such as timestamps, runner,
//! run id, board name and human-readable messages.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use lightrun::{Event, EventKind, RunnerKind};
//!
//! let ev = Event::new(EventKind::FinishedRun)
//!     .with_runner(RunnerKind::Local)
//!     .with_run_id(3)
//!     .with_message("Error on Line 2: NameError: x");
//!
//! assert_eq!(ev.kind, EventKind::FinishedRun);
//! assert_eq!(ev.runner, Some(RunnerKind::Local));
//! assert_eq!(ev.message.as_deref(), Some("Error on Line 2: NameError: x"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::error::RunOutcome;
use crate::runners::{PlugError, RunnerKind};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Classification of router events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Public events ===
    /// A new board was selected.
    ///
    /// Sets:
    /// - `board`: new board name
    ChangedBoard,

    /// A run was dispatched to a runner.
    ///
    /// Sets:
    /// - `runner`, `run_id`
    RunStarted,

    /// A runner finished the script (successfully or with a script error).
    ///
    /// Sets:
    /// - `runner`, `run_id`
    /// - `message`: empty on success, otherwise the attributed error text
    FinishedRun,

    /// A run was cancelled by an explicit kill.
    ///
    /// Sets:
    /// - `runner`, `run_id`
    RunKilled,

    /// Transport or operational error with human-readable text.
    ///
    /// Sets:
    /// - `message`
    /// - `runner` (if the error belongs to one runner)
    Error,

    /// Remote kit availability (re-announced on every heartbeat tick).
    ///
    /// Sets:
    /// - `status`
    PowerupStatus,

    /// The animation host finished loading and is ready to render.
    PlugLoaded,

    /// The animation host reported a structured error.
    ///
    /// Sets:
    /// - `plug_error`
    PlugError,

    /// The animation host saved the recorded animation.
    GifEncoded,

    // === Internal events ===
    /// Raw outcome of one run on one runner; translated by the router.
    ///
    /// Sets:
    /// - `runner`, `run_id`, `outcome`
    RunnerOutcome,

    /// A runner's back-end confirmed the run (Starting -> Running).
    ///
    /// Sets:
    /// - `runner`, `run_id`
    RunnerRunning,

    // === Subscriber events ===
    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `message`: subscriber and reason
    SubscriberOverflow,

    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `message`: panic info
    SubscriberPanicked,
}

impl EventKind {
    /// Returns `true` for kinds that are only consumed inside the router.
    #[inline]
    pub fn is_internal(self) -> bool {
        matches!(self, EventKind::RunnerOutcome | EventKind::RunnerRunning)
    }

    /// Returns a stable kebab-case name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ChangedBoard => "changed-board",
            EventKind::RunStarted => "run-started",
            EventKind::FinishedRun => "finished-run",
            EventKind::RunKilled => "run-killed",
            EventKind::Error => "error",
            EventKind::PowerupStatus => "powerup-status",
            EventKind::PlugLoaded => "plug-loaded",
            EventKind::PlugError => "plug-error",
            EventKind::GifEncoded => "gif-encoded",
            EventKind::RunnerOutcome => "runner-outcome",
            EventKind::RunnerRunning => "runner-running",
            EventKind::SubscriberOverflow => "subscriber-overflow",
            EventKind::SubscriberPanicked => "subscriber-panicked",
        }
    }
}

/// Availability of the remote kit as seen by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerupStatus {
    /// The kit answered a ping at least once.
    pub detected: bool,
    /// SSH trust and library sync completed.
    pub setup_complete: bool,
    /// Scripts can be sent to the kit right now.
    pub available: bool,
}

/// Router event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Runner this event belongs to.
    pub runner: Option<RunnerKind>,
    /// Run this event belongs to.
    pub run_id: Option<u64>,
    /// Board name.
    pub board: Option<Arc<str>>,
    /// Human-readable text (attributed errors, transport failures).
    pub message: Option<Arc<str>>,
    /// Remote kit status.
    pub status: Option<PowerupStatus>,
    /// Structured error reported by the animation host.
    pub plug_error: Option<PlugError>,
    /// Raw run outcome (internal events only).
    pub outcome: Option<RunOutcome>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            runner: None,
            run_id: None,
            board: None,
            message: None,
            status: None,
            plug_error: None,
            outcome: None,
        }
    }

    /// Attaches the runner.
    #[inline]
    pub fn with_runner(mut self, runner: RunnerKind) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Attaches the run id.
    #[inline]
    pub fn with_run_id(mut self, run_id: u64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attaches a board name.
    #[inline]
    pub fn with_board(mut self, board: impl Into<Arc<str>>) -> Self {
        self.board = Some(board.into());
        self
    }

    /// Attaches a human-readable message.
    #[inline]
    pub fn with_message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches the remote kit status.
    #[inline]
    pub fn with_status(mut self, status: PowerupStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches a structured animation host error.
    #[inline]
    pub fn with_plug_error(mut self, err: PlugError) -> Self {
        self.plug_error = Some(err);
        self
    }

    /// Attaches a raw run outcome.
    #[inline]
    pub fn with_outcome(mut self, outcome: RunOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Creates a raw runner outcome event.
    #[inline]
    pub fn runner_outcome(runner: RunnerKind, run_id: u64, outcome: RunOutcome) -> Self {
        Event::new(EventKind::RunnerOutcome)
            .with_runner(runner)
            .with_run_id(run_id)
            .with_outcome(outcome)
    }

    /// Creates a Starting -> Running notification.
    #[inline]
    pub fn runner_running(runner: RunnerKind, run_id: u64) -> Self {
        Event::new(EventKind::RunnerRunning)
            .with_runner(runner)
            .with_run_id(run_id)
    }

    /// Creates an error event.
    #[inline]
    pub fn error(message: impl Into<Arc<str>>) -> Self {
        Event::new(EventKind::Error).with_message(message)
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_message(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_message(format!("subscriber={subscriber} panic={info}"))
    }

    /// Returns the message or an empty string.
    #[inline]
    pub fn message_or_empty(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::PlugLoaded);
        let b = Event::new(EventKind::PlugLoaded);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn internal_kinds() {
        assert!(EventKind::RunnerOutcome.is_internal());
        assert!(!EventKind::FinishedRun.is_internal());
        assert_eq!(EventKind::ChangedBoard.as_str(), "changed-board");
    }
}
