//! # Remote kit runner.
//!
//! Sends the staged script to the Powerup Kit over `scp` and runs it through `ssh`.
//! A heartbeat task owns availability: the runner refuses to start until the kit
//! has answered a ping and SSH trust plus the library sync are in place.
//!
//! ## Flow
//! ```text
//! heartbeat ── ping ──► detected ──► ensure_ssh ──► ensure_lib ──► available
//!     │                                                               │
//!     └────────────── PowerupStatus every tick ◄──────────────────────┘
//!
//! start(req) ── scp script user@host: ──► ssh "pkill -fx ..; PYTHONPATH=.. python script"
//!                                            │ exit 0      → Success
//!                                            │ exit 255    → TransportError (ssh itself failed)
//!                                            │ cancelled   → Killed
//!                                            └ other       → ScriptError(stderr)
//! ```
//!
//! Killing a run terminates the local `ssh` and pattern-kills the interpreter on the kit.

mod heartbeat;
mod setup;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::exec::{run_checked, run_status};
use super::process::{self, EXIT_TERMINATED};
use super::runner::{RunRequest, Runner, RunnerKind};
use super::state::{RunSlot, RunState};
use crate::boards::Board;
use crate::core::RemoteConfig;
use crate::error::{RunError, RunOutcome};
use crate::events::{Bus, Event, PowerupStatus};

/// Exit code `ssh` uses for its own failures (connection refused, auth failed).
const SSH_FAILURE: i32 = 255;

/// Runs scripts on the Powerup Kit over ssh.
pub struct RemoteRunner {
    inner: Arc<Inner>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

struct Inner {
    cfg: RemoteConfig,
    board: Arc<Board>,
    work_dir: PathBuf,
    bus: Bus,
    slot: RunSlot,
    status: Mutex<PowerupStatus>,
    last_name: Mutex<Option<String>>,
}

impl RemoteRunner {
    /// Creates a runner for `board`. `work_dir` holds files staged for the kit.
    ///
    /// The kit is unavailable until [`RemoteRunner::start_heartbeat`] (or
    /// [`RemoteRunner::check_now`]) has reached it.
    pub fn new(cfg: RemoteConfig, board: Arc<Board>, work_dir: PathBuf, bus: Bus) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                board,
                work_dir,
                bus,
                slot: RunSlot::new(),
                status: Mutex::new(PowerupStatus::default()),
                last_name: Mutex::new(None),
            }),
            heartbeat: Mutex::new(None),
            stop: CancellationToken::new(),
        }
    }

    /// Starts the background heartbeat. Calling it again is a no-op.
    pub fn start_heartbeat(&self) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() && !self.stop.is_cancelled() {
            let task = heartbeat::run(Arc::clone(&self.inner), self.stop.child_token());
            *slot = Some(tokio::spawn(task));
        }
    }

    /// Runs one heartbeat tick immediately.
    pub async fn check_now(&self) -> PowerupStatus {
        self.inner.beat().await
    }

    /// Last status published by the heartbeat.
    pub fn status(&self) -> PowerupStatus {
        self.inner.status()
    }

    /// Turns the kit's LEDs off and shuts it down.
    pub async fn power_off(&self) -> Result<(), RunError> {
        if !self.inner.status().available {
            return Err(RunError::not_available("Powerup Kit not available"));
        }
        self.inner.power_off(&self.inner.board).await
    }

    async fn stop_heartbeat(&self) {
        self.stop.cancel();
        let task = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Inner {
    fn status(&self) -> PowerupStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store_status(&self, status: PowerupStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn last_name(&self) -> Option<String> {
        self.last_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Kills the interpreter running the last dispatched script on the kit.
    async fn kill_remote(&self) -> Result<(), RunError> {
        let Some(name) = self.last_name() else {
            return Ok(());
        };
        let pattern = process::interpreter_pattern(&self.cfg.interpreter, &name);
        let out = run_status(
            &mut self.ssh(true, &format!("pkill -fx {pattern}")),
            "Error killing Powerup Kit code",
            self.cfg.command_timeout(),
        )
        .await?;
        match out.code() {
            0 | 1 => Ok(()),
            rc => {
                error!(rc, "remote pattern kill failed");
                Err(RunError::transport(format!(
                    "Error killing Powerup Kit code: rc={rc}"
                )))
            }
        }
    }

    async fn run(self: Arc<Self>, req: Arc<RunRequest>, token: CancellationToken) {
        let (state, outcome) = self.execute(&req, &token).await;
        if self.slot.finish(req.id, state) {
            info!(run_id = req.id, outcome = outcome.as_label(), "remote run finished");
            self.bus
                .publish(Event::runner_outcome(RunnerKind::Remote, req.id, outcome));
        }
    }

    async fn execute(&self, req: &RunRequest, token: &CancellationToken) -> (RunState, RunOutcome) {
        let cfg = &self.cfg;

        let mut copy = self.scp(true, false, &req.path, "");
        let copied = tokio::select! {
            res = run_checked(&mut copy, "Error sending the code to the Powerup Kit", cfg.copy_timeout()) => res,
            _ = token.cancelled() => return (RunState::Killed, RunOutcome::Killed),
        };
        if let Err(e) = copied {
            return (RunState::Failed, RunOutcome::TransportError(e.as_message()));
        }
        if token.is_cancelled() {
            return (RunState::Killed, RunOutcome::Killed);
        }

        let name = req.file_name();
        let interp = &cfg.interpreter;
        let remote_cmd = format!(
            "pkill -fx {}; PYTHONPATH=~/{}/ {interp} {name}",
            process::interpreter_pattern(interp, &name),
            cfg.remote_dir
        );
        let mut cmd = process::group_command(&cfg.ssh);
        cmd.arg("-i")
            .arg(&cfg.key_file)
            .args(&cfg.ssh_options)
            .arg(cfg.address())
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(ssh = %cfg.ssh, error = %e, "could not start ssh");
                return (
                    RunState::Failed,
                    RunOutcome::TransportError(format!("Error executing code on the Powerup Kit: {e}")),
                );
            }
        };
        if self.slot.mark_running(req.id) {
            self.bus
                .publish(Event::runner_running(RunnerKind::Remote, req.id));
        }
        debug!(run_id = req.id, pid = ?child.id(), "remote script started");

        match process::supervise(child, token, cfg.kill_grace).await {
            Ok((_, true)) => (RunState::Killed, RunOutcome::Killed),
            Ok((fin, false)) if fin.status.success() => (RunState::Finished, RunOutcome::Success),
            Ok((fin, false)) => match fin.code() {
                SSH_FAILURE => {
                    warn!(detail = fin.last_line(), "ssh failed");
                    (
                        RunState::Failed,
                        RunOutcome::TransportError("Lost connection to the Powerup Kit".to_string()),
                    )
                }
                EXIT_TERMINATED => (RunState::Killed, RunOutcome::Killed),
                code => {
                    warn!(code, "remote script exited with an error");
                    (RunState::Finished, RunOutcome::ScriptError(fin.error_text()))
                }
            },
            Err(e) => {
                error!(run_id = req.id, error = %e, "lost track of ssh");
                (
                    RunState::Failed,
                    RunOutcome::TransportError(format!("Error executing code on the Powerup Kit: {e}")),
                )
            }
        }
    }
}

#[async_trait]
impl Runner for RemoteRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Remote
    }

    fn slot(&self) -> &RunSlot {
        &self.inner.slot
    }

    async fn detect(&self) -> bool {
        self.inner.cfg.enabled && self.inner.status().available
    }

    async fn start(&self, req: Arc<RunRequest>) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;
        if !inner.status().available {
            return Err(RunError::not_available("Powerup Kit not available"));
        }
        inner.slot.preempt(inner.cfg.kill_grace * 2).await;

        *inner.last_name.lock().unwrap_or_else(|e| e.into_inner()) = Some(req.file_name());
        let token = inner.slot.begin(req.id);
        debug!(run_id = req.id, host = %inner.cfg.host, "sending script to kit");
        tokio::spawn(Arc::clone(inner).run(req, token));
        Ok(())
    }

    async fn kill(&self) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;
        let Some(run_id) = inner.slot.cancel_current() else {
            return Err(RunError::NotStarted);
        };
        debug!(run_id, "remote run cancelled");
        inner.kill_remote().await
    }

    async fn teardown(&self) -> Result<(), RunError> {
        self.stop_heartbeat().await;
        match self.kill().await {
            Err(e) if e.is_benign() => Ok(()),
            other => other,
        }
    }
}
