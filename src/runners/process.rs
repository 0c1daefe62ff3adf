//! # Child process lifecycle.
//!
//! Script processes are spawned as leaders of their own process group so that a
//! kill reaches the interpreter and everything it started:
//!
//! ```text
//! kill requested ──► SIGTERM to -pgid ──► exited within grace? ──► yes: done
//!                                                   │
//!                                                   └─► no: SIGKILL to -pgid, reap
//! ```
//!
//! Processes this runtime did not spawn (left over from an earlier session) are
//! matched by command line with `pkill -f -x`.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::exec::{Finished, exit_code};
use crate::error::RunError;

/// How long to keep draining pipes after the child exited.
const PIPE_DRAIN: Duration = Duration::from_millis(500);

/// Exit status a shell reports for a child terminated by SIGTERM.
pub(crate) const EXIT_TERMINATED: i32 = 128 + libc::SIGTERM;

/// Builds a command whose child leads a new process group.
pub(crate) fn group_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.process_group(0).kill_on_drop(true);
    cmd
}

/// Sends `sig` to the process group led by `pid`.
pub(crate) fn signal_group(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// SIGTERM the child's group, escalate to SIGKILL after `grace`, and reap it.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = signal_group(pid, libc::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM to process group failed");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_elapsed) => {
            if let Some(pid) = child.id() {
                warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, sending SIGKILL");
                if let Err(e) = signal_group(pid, libc::SIGKILL) {
                    debug!(pid, error = %e, "SIGKILL to process group failed");
                }
            }
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_elapsed) => {
            abort.abort();
            String::new()
        }
    }
}

/// Waits for `child` to exit, terminating it if `token` is cancelled first.
///
/// Returns the captured output and whether termination was requested.
pub(crate) async fn supervise(
    mut child: Child,
    token: &CancellationToken,
    grace: Duration,
) -> io::Result<(Finished, bool)> {
    let out = drain(child.stdout.take());
    let err = drain(child.stderr.take());

    let exited = tokio::select! {
        status = child.wait() => Some(status?),
        _ = token.cancelled() => None,
    };
    let (status, cancelled) = match exited {
        Some(status) => (status, false),
        None => (terminate(&mut child, grace).await?, true),
    };

    let finished = Finished {
        status,
        stdout: collect(out).await,
        stderr: collect(err).await,
    };
    debug!(code = exit_code(&finished.status), cancelled, "child exited");
    Ok((finished, cancelled))
}

/// `pkill -f -x` pattern matching `<interpreter> <path>` command lines.
pub(crate) fn interpreter_pattern(interpreter: &str, path: &str) -> String {
    format!("{interpreter}.{path}")
}

/// Kills processes whose full command line matches `pattern`.
///
/// Returns `true` if something was killed, `false` if nothing matched.
pub(crate) async fn pattern_kill(pkill: &str, pattern: &str) -> Result<bool, RunError> {
    let status = Command::new(pkill)
        .args(["-f", "-x", pattern])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| RunError::transport(format!("could not run {pkill}: {e}")))?;

    match exit_code(&status) {
        0 => {
            debug!(pattern, "killed matching processes");
            Ok(true)
        }
        1 => Ok(false),
        rc => {
            warn!(pattern, rc, "pattern kill failed");
            Err(RunError::transport(format!("Error killing code: rc={rc}")))
        }
    }
}
