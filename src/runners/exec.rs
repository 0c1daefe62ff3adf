//! # Checked execution of external commands.
//!
//! Every OS command the runners shell out to (`scp`, `ssh`, `ssh-keygen`, `ping`,
//! the network bring-up) goes through here, so failures reach callers as a
//! descriptive [`RunError::Transport`] string and never as raw `io::Error`s.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RunError;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub(crate) struct Finished {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Finished {
    /// Exit code, or `128 + signal` when the command was killed by a signal.
    pub fn code(&self) -> i32 {
        exit_code(&self.status)
    }

    /// Last non-empty line of stderr (falls back to stdout).
    pub fn last_line(&self) -> &str {
        last_non_empty(&self.stderr)
            .or_else(|| last_non_empty(&self.stdout))
            .unwrap_or_default()
    }

    /// Text reported for a failed script: stderr, else stdout, else the exit status.
    pub fn error_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.clone()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("script exited with status {}", self.code())
        }
    }
}

pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

fn last_non_empty(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Runs `cmd` to completion and returns its status and output.
///
/// Only spawn failures and timeouts are errors; any exit code is returned.
pub(crate) async fn run_status(
    cmd: &mut Command,
    what: &str,
    timeout: Option<Duration>,
) -> Result<Finished, RunError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        warn!(what, error = %e, "could not spawn command");
        RunError::transport(format!("{what}: could not start command ({e})"))
    })?;

    let output = match timeout.filter(|d| *d > Duration::ZERO) {
        Some(dur) => match tokio::time::timeout(dur, child.wait_with_output()).await {
            Ok(out) => out,
            Err(_elapsed) => {
                warn!(what, timeout_ms = dur.as_millis() as u64, "command timed out");
                return Err(RunError::transport(format!(
                    "{what}: timed out after {}s",
                    dur.as_secs_f32()
                )));
            }
        },
        None => child.wait_with_output().await,
    }
    .map_err(|e| RunError::transport(format!("{what}: {e}")))?;

    let finished = Finished {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(what, code = finished.code(), "command finished");
    Ok(finished)
}

/// Like [`run_status`], but any non-zero exit is a transport error.
pub(crate) async fn run_checked(
    cmd: &mut Command,
    what: &str,
    timeout: Option<Duration>,
) -> Result<Finished, RunError> {
    let finished = run_status(cmd, what, timeout).await?;
    if finished.status.success() {
        return Ok(finished);
    }

    let code = finished.code();
    warn!(what, code, stderr = finished.last_line(), "command failed");
    let detail = finished.last_line();
    Err(RunError::transport(if detail.is_empty() {
        format!("{what} (rc={code})")
    } else {
        format!("{what} (rc={code}): {detail}")
    }))
}
