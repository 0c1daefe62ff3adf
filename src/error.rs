//! Error types used by the router and its runners.
//!
//! This module defines two main error enums:
//!
//! - [`RouterError`] - errors raised by the router itself (board selection, script staging).
//! - [`RunError`] - errors raised by one runner's start/kill/transport operations.
//!
//! A finished run is not an error: it is described by [`RunOutcome`], which the runners
//! publish once per run and the router translates into user-facing events.
//!
//! Both error types provide helper methods (`as_label`, `as_message`) for logging.

use std::io;

use thiserror::Error;

/// # Errors produced by the router.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RouterError {
    /// The requested board is not in the registry; the previous selection is kept.
    #[error("board not supported: {name:?}")]
    UnsupportedBoard {
        /// Name that was looked up.
        name: String,
    },

    /// The combined script could not be staged for execution.
    #[error("could not prepare script: {error}")]
    Script {
        /// The underlying error message.
        error: String,
    },

    /// No board has been selected yet.
    #[error("no board selected")]
    NoBoard,

    /// A runner-specific operation failed (saving an animation, powering off the kit).
    #[error(transparent)]
    Run(#[from] RunError),

    /// Filesystem failure while preparing router resources.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use lightrun::RouterError;
    ///
    /// let err = RouterError::UnsupportedBoard { name: "Cube".into() };
    /// assert_eq!(err.as_label(), "router_unsupported_board");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RouterError::UnsupportedBoard { .. } => "router_unsupported_board",
            RouterError::Script { .. } => "router_script",
            RouterError::NoBoard => "router_no_board",
            RouterError::Run(e) => e.as_label(),
            RouterError::Io(_) => "router_io",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RouterError::UnsupportedBoard { name } => {
                format!("tried to change to board named {name:?}")
            }
            RouterError::Script { error } => format!("error preprocessing the code: {error}"),
            RouterError::NoBoard => "no board selected".to_string(),
            RouterError::Run(e) => e.as_message(),
            RouterError::Io(e) => format!("io: {e}"),
        }
    }
}

/// # Errors produced by runner operations.
///
/// Every external command failure is mapped to [`RunError::Transport`] with a
/// descriptive message at the boundary; raw OS errors never reach the router.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Process spawn, copy, ssh or signal delivery failed.
    #[error("transport error: {error}")]
    Transport {
        /// Descriptive error string.
        error: String,
    },

    /// The runner's precondition does not hold (no hardware, no network, no display).
    #[error("runner not available: {reason}")]
    NotAvailable {
        /// Why the runner cannot run right now.
        reason: String,
    },

    /// Operation requires a process that was never started.
    #[error("runner not started")]
    NotStarted,
}

impl RunError {
    /// Shorthand for [`RunError::Transport`].
    pub fn transport(error: impl Into<String>) -> Self {
        RunError::Transport {
            error: error.into(),
        }
    }

    /// Shorthand for [`RunError::NotAvailable`].
    pub fn not_available(reason: impl Into<String>) -> Self {
        RunError::NotAvailable {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use lightrun::RunError;
    ///
    /// assert_eq!(RunError::transport("scp failed").as_label(), "run_transport");
    /// assert_eq!(RunError::NotStarted.as_label(), "run_not_started");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RunError::Transport { .. } => "run_transport",
            RunError::NotAvailable { .. } => "run_not_available",
            RunError::NotStarted => "run_not_started",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RunError::Transport { error } => error.clone(),
            RunError::NotAvailable { reason } => format!("not available: {reason}"),
            RunError::NotStarted => "no script to kill".to_string(),
        }
    }

    /// Indicates whether the router should swallow this error silently.
    ///
    /// Killing a runner that never started is not worth reporting.
    pub fn is_benign(&self) -> bool {
        matches!(self, RunError::NotStarted | RunError::NotAvailable { .. })
    }
}

/// # Result of one run on one runner.
///
/// Produced exactly once per runner per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Script finished without error.
    Success,
    /// User script raised an error; carries the raw captured error text.
    ScriptError(String),
    /// Transport-level failure (copy failed, process could not be spawned).
    TransportError(String),
    /// Explicit user cancellation.
    Killed,
}

impl RunOutcome {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::ScriptError(_) => "script_error",
            RunOutcome::TransportError(_) => "transport_error",
            RunOutcome::Killed => "killed",
        }
    }

    /// Returns `true` for outcomes that should be surfaced as failures.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RunOutcome::ScriptError(_) | RunOutcome::TransportError(_)
        )
    }
}
