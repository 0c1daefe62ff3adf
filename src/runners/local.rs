//! # Local hardware runner.
//!
//! Runs `<interpreter> <staged script>` as a child process on this machine.
//!
//! ## Flow
//! ```text
//! start(req)
//!   ├─ preempt run in flight (kill-then-restart)
//!   ├─ pkill -f -x "<interp>.<path>"   (strays from an earlier session)
//!   ├─ Idle → Starting, spawn in own process group
//!   ├─ Starting → Running               (process handle obtained)
//!   └─ wait task: exit / cancel ──► one RunnerOutcome
//! ```
//!
//! Exit code 0 is success, exit 143 (SIGTERM) is a kill, anything else is a
//! script error carrying the captured stderr (stdout when stderr is empty).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::exec::Finished;
use super::process::{self, EXIT_TERMINATED};
use super::runner::{RunRequest, Runner, RunnerKind};
use super::state::{RunSlot, RunState};
use crate::boards::Board;
use crate::core::LocalConfig;
use crate::error::{RunError, RunOutcome};
use crate::events::{Bus, Event};

/// Runs scripts on hardware attached to this machine.
pub struct LocalRunner {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: LocalConfig,
    board: Arc<Board>,
    bus: Bus,
    slot: RunSlot,
    last_path: Mutex<Option<PathBuf>>,
}

impl LocalRunner {
    /// Creates a runner for `board`. Nothing is spawned until [`Runner::start`].
    pub fn new(cfg: LocalConfig, board: Arc<Board>, bus: Bus) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                board,
                bus,
                slot: RunSlot::new(),
                last_path: Mutex::new(None),
            }),
        }
    }
}

impl Inner {
    fn remember_path(&self, path: PathBuf) {
        *self.last_path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path);
    }

    fn last_path(&self) -> Option<PathBuf> {
        self.last_path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Kills interpreters running `path` that this runner does not own.
    async fn sweep(&self, path: &std::path::Path) -> Result<bool, RunError> {
        let Some(pkill) = self.cfg.pattern_kill.as_deref() else {
            return Ok(false);
        };
        let pattern = process::interpreter_pattern(&self.cfg.interpreter, &path.to_string_lossy());
        process::pattern_kill(pkill, &pattern).await
    }

    async fn wait_run(self: Arc<Self>, run_id: u64, child: Child, token: CancellationToken) {
        let (state, outcome) =
            match process::supervise(child, &token, self.cfg.kill_grace).await {
                Ok((_, true)) => (RunState::Killed, RunOutcome::Killed),
                Ok((fin, false)) => classify(&fin),
                Err(e) => {
                    error!(run_id, error = %e, "lost track of local script");
                    (
                        RunState::Failed,
                        RunOutcome::TransportError(format!("Error executing code locally: {e}")),
                    )
                }
            };

        if self.slot.finish(run_id, state) {
            info!(run_id, outcome = outcome.as_label(), "local run finished");
            self.bus
                .publish(Event::runner_outcome(RunnerKind::Local, run_id, outcome));
        }
    }
}

fn classify(fin: &Finished) -> (RunState, RunOutcome) {
    if fin.status.success() {
        return (RunState::Finished, RunOutcome::Success);
    }
    let code = fin.code();
    if code == EXIT_TERMINATED {
        return (RunState::Killed, RunOutcome::Killed);
    }

    warn!(code, "local script exited with an error");
    (RunState::Finished, RunOutcome::ScriptError(fin.error_text()))
}

#[async_trait]
impl Runner for LocalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn slot(&self) -> &RunSlot {
        &self.inner.slot
    }

    async fn detect(&self) -> bool {
        self.inner.cfg.enabled && self.inner.board.detect().await
    }

    async fn start(&self, req: Arc<RunRequest>) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;
        inner.slot.preempt(inner.cfg.kill_grace * 2).await;

        match inner.sweep(&req.path).await {
            Ok(true) => debug!(path = %req.path.display(), "killed stray interpreter"),
            Ok(false) => {}
            Err(e) => warn!(error = %e.as_message(), "could not sweep stray interpreters"),
        }
        inner.remember_path(req.path.clone());

        let token = inner.slot.begin(req.id);
        let mut cmd = process::group_command(&inner.cfg.interpreter);
        cmd.arg(&req.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.slot.finish(req.id, RunState::Failed);
                error!(interpreter = %inner.cfg.interpreter, error = %e, "could not start local script");
                return Err(RunError::transport(format!(
                    "Error executing code locally: {e}"
                )));
            }
        };

        if inner.slot.mark_running(req.id) {
            inner
                .bus
                .publish(Event::runner_running(RunnerKind::Local, req.id));
        }
        debug!(run_id = req.id, pid = ?child.id(), "local script started");
        tokio::spawn(Arc::clone(inner).wait_run(req.id, child, token));
        Ok(())
    }

    async fn kill(&self) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;
        let cancelled = inner.slot.cancel_current();

        if let Some(path) = inner.last_path() {
            inner.sweep(&path).await?;
        }

        match cancelled {
            Some(run_id) => {
                debug!(run_id, "local run cancelled");
                Ok(())
            }
            None => Err(RunError::NotStarted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::Geometry;
    use crate::events::EventKind;
    use crate::script::CombinedScript;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn runner(bus: &Bus) -> LocalRunner {
        let cfg = LocalConfig {
            interpreter: "sh".to_string(),
            pattern_kill: None,
            kill_grace: Duration::from_millis(500),
            ..LocalConfig::default()
        };
        let board = Arc::new(Board::new("Lightboard", Geometry::Grid { width: 9, height: 14 }));
        LocalRunner::new(cfg, board, bus.clone())
    }

    async fn request(dir: &Path, id: u64, body: &str) -> Arc<RunRequest> {
        let path = dir.join(format!("script-{id}.sh"));
        let script = CombinedScript::combine("", body, "");
        script.write_to(&path).await.unwrap();
        Arc::new(RunRequest {
            id,
            board: Arc::new(Board::new("Lightboard", Geometry::Ring { leds: 10 })),
            script,
            path,
        })
    }

    async fn next_outcome(rx: &mut broadcast::Receiver<Event>) -> (u64, RunOutcome) {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("outcome in time")
                .unwrap();
            if ev.kind == EventKind::RunnerOutcome {
                return (ev.run_id.unwrap(), ev.outcome.unwrap());
            }
        }
    }

    #[tokio::test]
    async fn clean_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let r = runner(&bus);

        r.start(request(dir.path(), 1, "echo hello\n").await).await.unwrap();
        assert_eq!(next_outcome(&mut rx).await, (1, RunOutcome::Success));
        r.wait_idle().await;
        assert_eq!(r.slot().last_terminal(), Some(RunState::Finished));
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let r = runner(&bus);

        let body = "echo 'File \"x.py\", line 12, in <module>' >&2\necho 'NameError: x' >&2\nexit 1\n";
        r.start(request(dir.path(), 2, body).await).await.unwrap();
        let (id, outcome) = next_outcome(&mut rx).await;
        assert_eq!(id, 2);
        match outcome {
            RunOutcome::ScriptError(text) => assert!(text.contains("NameError: x")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn kill_terminates_without_leaking() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let r = runner(&bus);

        let body = format!("echo $$ > {}\nexec sleep 30\n", pidfile.display());
        r.start(request(dir.path(), 3, &body).await).await.unwrap();
        assert!(r.is_running());

        let mut pid = String::new();
        for _ in 0..100 {
            pid = std::fs::read_to_string(&pidfile).unwrap_or_default();
            if !pid.trim().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.trim().to_string();
        assert!(!pid.is_empty());

        r.kill().await.unwrap();
        r.wait_idle().await;
        assert_eq!(next_outcome(&mut rx).await, (3, RunOutcome::Killed));
        assert!(!Path::new(&format!("/proc/{pid}")).exists());

        assert_eq!(r.kill().await, Err(RunError::NotStarted));
    }

    #[tokio::test]
    async fn start_while_running_preempts() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let r = runner(&bus);

        r.start(request(dir.path(), 4, "exec sleep 30\n").await).await.unwrap();
        r.start(request(dir.path(), 5, "exit 0\n").await).await.unwrap();

        assert_eq!(next_outcome(&mut rx).await, (4, RunOutcome::Killed));
        assert_eq!(next_outcome(&mut rx).await, (5, RunOutcome::Success));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(8);
        let cfg = LocalConfig {
            interpreter: "/nonexistent/python".to_string(),
            pattern_kill: None,
            ..LocalConfig::default()
        };
        let board = Arc::new(Board::new("Lightboard", Geometry::Ring { leds: 10 }));
        let r = LocalRunner::new(cfg, board, bus);

        let err = r.start(request(dir.path(), 6, "x\n").await).await.unwrap_err();
        assert_eq!(err.as_label(), "run_transport");
        assert_eq!(r.state(), RunState::Idle);
        assert_eq!(r.slot().last_terminal(), Some(RunState::Failed));
    }
}
