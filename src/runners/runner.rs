//! # Runner contract.
//!
//! ```text
//!            start()             backend confirms
//!   Idle ─────────────► Starting ────────────────► Running
//!    ▲                     │                          │
//!    │                     │ kill()                   ├── exit 0 / script error ──► Finished
//!    │                     ▼                          ├── copy / spawn failure ───► Failed
//!    └──────────────── Killed ◄───────── kill() ──────┘
//!                  (Finished | Failed | Killed all settle back to Idle)
//! ```
//!
//! ## Rules
//! - `start` returns once the run is dispatched; completion arrives as a
//!   `RunnerOutcome` event, never as the return value.
//! - `start` while busy kills the previous run first (kill-then-restart).
//! - `start` and `kill` on the same runner are serialised; `kill` issued while a
//!   `start` is still dispatching waits for it and then cancels the new run.
//! - `kill` on an idle runner returns [`RunError::NotStarted`] (benign).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::state::{RunSlot, RunState};
use crate::boards::Board;
use crate::error::RunError;
use crate::script::CombinedScript;

/// Identifies one execution back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunnerKind {
    /// On-screen animation host.
    Simulation,
    /// Hardware attached to this machine.
    Local,
    /// Hardware on the remote kit, reached over ssh.
    Remote,
}

impl RunnerKind {
    /// All kinds, in dispatch order.
    pub const ALL: [RunnerKind; 3] = [RunnerKind::Simulation, RunnerKind::Local, RunnerKind::Remote];

    /// Returns a stable lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Simulation => "simulation",
            RunnerKind::Local => "local",
            RunnerKind::Remote => "remote",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One "run this script" command, shared read-only by every runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Router-assigned run id (monotonic).
    pub id: u64,
    /// Board the script targets.
    pub board: Arc<Board>,
    /// Preamble + user script + postamble.
    pub script: CombinedScript,
    /// Where the combined script was written.
    pub path: PathBuf,
}

impl RunRequest {
    /// File name of the staged script.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Common interface of the execution back-ends.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Which back-end this is.
    fn kind(&self) -> RunnerKind;

    /// Shared state of the current run.
    fn slot(&self) -> &RunSlot;

    /// Whether this runner's precondition holds right now
    /// (hardware present, kit reachable, display attached).
    async fn detect(&self) -> bool;

    /// Dispatches `req`. Returns once the run is in flight.
    async fn start(&self, req: Arc<RunRequest>) -> Result<(), RunError>;

    /// Requests termination of the current run. Does not wait for the process to exit.
    async fn kill(&self) -> Result<(), RunError>;

    /// Kills everything this runner owns and stops its background tasks.
    async fn teardown(&self) -> Result<(), RunError> {
        match self.kill().await {
            Err(e) if e.is_benign() => Ok(()),
            other => other,
        }
    }

    /// Current state.
    fn state(&self) -> RunState {
        self.slot().state()
    }

    /// True while a run is `Starting` or `Running`.
    fn is_running(&self) -> bool {
        self.slot().is_running()
    }

    /// Resolves once the runner is back to `Idle`.
    async fn wait_idle(&self) {
        self.slot().wait_idle().await
    }
}
