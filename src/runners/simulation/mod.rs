//! # Simulation runner.
//!
//! Drives one long-lived animation host process that renders the board into the
//! attached display. The host is started once and reused for every run; a run is
//! one `START-ANIMATION` command.
//!
//! ## Architecture
//! ```text
//!                 stdin: START / SAVE / QUIT
//! SimulationRunner ─────────────────────────────► animation host
//!        ▲                                             │ stdout lines
//!        │ RunnerOutcome, PlugLoaded, PlugError,       ▼
//!        │ GifEncoded, frames                     listener task ──► pipe (error text)
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - `Starting -> Running` happens on `LOADING-COMPLETE`, or immediately when the
//!   host has already loaded.
//! - Killing a run kills the host and starts a fresh one; replies of the old host
//!   are never attributed to a later run (each host has a generation).
//! - `teardown` kills the host without restarting it.

mod frames;
mod pipe;
mod protocol;

pub use frames::{AnimationFrame, FrameBuffer, Rgb};
pub use protocol::PlugError;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::pipe::ErrorPipe;
use self::protocol::{Command, Reply};
use super::process;
use super::runner::{RunRequest, Runner, RunnerKind};
use super::state::{RunSlot, RunState};
use crate::boards::Board;
use crate::core::SimulationConfig;
use crate::error::{RunError, RunOutcome};
use crate::events::{Bus, Event, EventKind};
use crate::script::unescape_error_line;

/// How long to wait for the error text after `SCRIPT-ENCOUNTERED-ERROR`.
const PIPE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs scripts in the on-screen animation host.
pub struct SimulationRunner {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: SimulationConfig,
    board: Arc<Board>,
    display: u64,
    script_path: PathBuf,
    bus: Bus,
    slot: RunSlot,
    pipe: ErrorPipe,
    frames: Mutex<FrameBuffer>,
    host: tokio::sync::Mutex<Option<Host>>,
    loaded: AtomicBool,
    generation: AtomicU64,
}

struct Host {
    child: Child,
    stdin: ChildStdin,
    generation: u64,
    listener: JoinHandle<()>,
}

impl SimulationRunner {
    /// Creates a runner rendering `board` into display `display`.
    ///
    /// The host reads the staged script from `script_path`. Nothing is spawned
    /// until [`SimulationRunner::launch`] or the first [`Runner::start`].
    pub fn new(
        cfg: SimulationConfig,
        board: Arc<Board>,
        display: u64,
        script_path: PathBuf,
        bus: Bus,
    ) -> Self {
        let frames = FrameBuffer::new(cfg.max_frames);
        let pipe = ErrorPipe::new(cfg.pipe_path.clone());
        Self {
            inner: Arc::new(Inner {
                cfg,
                board,
                display,
                script_path,
                bus,
                slot: RunSlot::new(),
                pipe,
                frames: Mutex::new(frames),
                host: tokio::sync::Mutex::new(None),
                loaded: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts the animation host if it is not running.
    pub async fn launch(&self) -> Result<(), RunError> {
        let mut host = self.inner.host.lock().await;
        self.inner.ensure_host(&mut host)?;
        Ok(())
    }

    /// Display id the host draws into.
    pub fn display(&self) -> u64 {
        self.inner.display
    }

    /// True once the current host reported `LOADING-COMPLETE`.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::SeqCst)
    }

    /// Asks the host to save the recorded animation (answered by `GifEncoded` or `PlugError`).
    pub async fn save_animation(&self) -> Result<(), RunError> {
        self.inner.send_to_live_host(Command::Save).await
    }

    /// Asks the host to exit.
    pub async fn quit(&self) -> Result<(), RunError> {
        self.inner.send_to_live_host(Command::Quit).await
    }

    /// Frames of the current run, oldest first.
    pub fn frames(&self) -> Vec<AnimationFrame> {
        self.inner.frames().frames()
    }

    /// Frames of the current run trimmed for export.
    pub fn export_frames(&self) -> Result<Vec<AnimationFrame>, PlugError> {
        self.inner.frames().export()
    }
}

impl Inner {
    fn frames(&self) -> MutexGuard<'_, FrameBuffer> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Spawns a host unless a live one exists.
    fn ensure_host(self: &Arc<Self>, current: &mut Option<Host>) -> Result<(), RunError> {
        if let Some(host) = current.as_mut() {
            match host.child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => debug!(?status, "animation host is gone, respawning"),
                Err(e) => warn!(error = %e, "could not poll animation host, respawning"),
            }
            if let Some(old) = current.take() {
                old.listener.abort();
            }
        }
        *current = Some(self.spawn_host()?);
        Ok(())
    }

    fn spawn_host(self: &Arc<Self>) -> Result<Host, RunError> {
        self.pipe.recreate().map_err(|e| {
            RunError::transport(format!(
                "could not create pipe {}: {e}",
                self.pipe.path().display()
            ))
        })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.loaded.store(false, Ordering::SeqCst);

        let mut cmd = process::group_command(&self.cfg.host.program);
        cmd.args(&self.cfg.host.args);
        if self.cfg.debug {
            cmd.arg("debug");
        }
        cmd.env("BOARD", self.board.name())
            .env("PLUG_ID", self.display.to_string())
            .env("POWERUP_TEST", "1")
            .env("LIGHTRUN_SCRIPT", &self.script_path)
            .env("LIGHTRUN_PIPE", self.pipe.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            error!(program = %self.cfg.host.program, error = %e, "could not start animation host");
            RunError::transport(format!("could not start the simulator: {e}"))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RunError::transport("simulator pipes unavailable"));
        };

        info!(generation, pid = ?child.id(), board = self.board.name(), "animation host started");
        let listener = tokio::spawn(Arc::clone(self).listen(generation, stdout));
        Ok(Host {
            child,
            stdin,
            generation,
            listener,
        })
    }

    async fn stop_host(&self, host: Host) {
        let Host {
            mut child,
            mut stdin,
            generation,
            listener,
        } = host;
        listener.abort();
        let _ = stdin.write_all(Command::Quit.line()).await;
        drop(stdin);
        match process::terminate(&mut child, self.cfg.kill_grace).await {
            Ok(status) => debug!(generation, ?status, "animation host stopped"),
            Err(e) => warn!(generation, error = %e, "could not stop animation host"),
        }
        self.loaded.store(false, Ordering::SeqCst);
    }

    /// Kills the host and, if `respawn`, starts a fresh one.
    async fn replace_host(self: &Arc<Self>, respawn: bool) -> Result<(), RunError> {
        let mut current = self.host.lock().await;
        if let Some(host) = current.take() {
            self.stop_host(host).await;
        }
        if respawn {
            *current = Some(self.spawn_host()?);
        }
        Ok(())
    }

    async fn send_to_live_host(&self, cmd: Command) -> Result<(), RunError> {
        let mut current = self.host.lock().await;
        let host = current.as_mut().ok_or(RunError::NotStarted)?;
        write_command(host, cmd).await
    }

    /// Ends the current run with `outcome` unless it already ended.
    fn settle(&self, state: RunState, outcome: RunOutcome) {
        let Some(run_id) = self.slot.current_run() else {
            return;
        };
        if self.slot.finish(run_id, state) {
            info!(run_id, outcome = outcome.as_label(), "simulation run finished");
            self.bus.publish(Event::runner_outcome(
                RunnerKind::Simulation,
                run_id,
                outcome,
            ));
        }
    }

    async fn listen(self: Arc<Self>, generation: u64, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !self.is_current(generation) {
                        break;
                    }
                    self.on_reply(Reply::parse(&line)).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(generation, error = %e, "reading animation host output failed");
                    break;
                }
            }
        }

        if self.is_current(generation) {
            self.loaded.store(false, Ordering::SeqCst);
            warn!(generation, "animation host closed its output");
            self.settle(
                RunState::Failed,
                RunOutcome::TransportError("The simulator stopped unexpectedly".to_string()),
            );
        }
    }

    async fn on_reply(&self, reply: Reply) {
        match reply {
            Reply::LoadingComplete => {
                self.loaded.store(true, Ordering::SeqCst);
                self.bus.publish(Event::new(EventKind::PlugLoaded));
                if let Some(run_id) = self.slot.current_run() {
                    if self.slot.mark_running(run_id) {
                        self.bus
                            .publish(Event::runner_running(RunnerKind::Simulation, run_id));
                    }
                }
            }
            Reply::AnimationFinished => self.settle(RunState::Finished, RunOutcome::Success),
            Reply::ScriptError => {
                let text = match self.pipe.read_line(PIPE_TIMEOUT).await {
                    Ok(line) => unescape_error_line(&line),
                    Err(e) => {
                        warn!(error = %e, "error text unavailable");
                        "The script encountered an error".to_string()
                    }
                };
                self.settle(RunState::Finished, RunOutcome::ScriptError(text));
            }
            Reply::AnimationSaved => self.bus.publish(Event::new(EventKind::GifEncoded)),
            Reply::PlugError(err) => {
                warn!(title = %err.title, code = err.error_code, "animation host reported an error");
                self.bus
                    .publish(Event::new(EventKind::PlugError).with_plug_error(err));
            }
            Reply::Frame(frame) => {
                if self.frames().push(frame) {
                    debug!("frame buffer full, dropped oldest frame");
                }
            }
            Reply::Other(line) => debug!(line = %line, "animation host output"),
        }
    }
}

async fn write_command(host: &mut Host, cmd: Command) -> Result<(), RunError> {
    host.stdin.write_all(cmd.line()).await.map_err(|e| {
        RunError::transport(format!("could not send {} to the simulator: {e}", cmd.as_str()))
    })?;
    host.stdin
        .flush()
        .await
        .map_err(|e| RunError::transport(format!("could not send {}: {e}", cmd.as_str())))?;
    debug!(generation = host.generation, command = cmd.as_str(), "sent");
    Ok(())
}

#[async_trait]
impl Runner for SimulationRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Simulation
    }

    fn slot(&self) -> &RunSlot {
        &self.inner.slot
    }

    async fn detect(&self) -> bool {
        self.inner.cfg.enabled
    }

    async fn start(&self, req: Arc<RunRequest>) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;

        if inner.slot.is_running() {
            debug!("simulation busy, restarting host before the new run");
            inner.settle(RunState::Killed, RunOutcome::Killed);
            inner.replace_host(true).await?;
        }

        let mut current = inner.host.lock().await;
        inner.ensure_host(&mut current)?;
        let Some(host) = current.as_mut() else {
            return Err(RunError::NotStarted);
        };

        inner.frames().reset();
        let _token = inner.slot.begin(req.id);
        if let Err(e) = write_command(host, Command::Start).await {
            inner.slot.finish(req.id, RunState::Failed);
            return Err(e);
        }

        if inner.loaded.load(Ordering::SeqCst) && inner.slot.mark_running(req.id) {
            inner
                .bus
                .publish(Event::runner_running(RunnerKind::Simulation, req.id));
        }
        debug!(run_id = req.id, "simulation run dispatched");
        Ok(())
    }

    async fn kill(&self) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;
        if !inner.slot.is_running() {
            return Err(RunError::NotStarted);
        }
        inner.settle(RunState::Killed, RunOutcome::Killed);
        inner.replace_host(true).await
    }

    async fn teardown(&self) -> Result<(), RunError> {
        let inner = &self.inner;
        let _ops = inner.slot.lock_ops().await;
        inner.settle(RunState::Killed, RunOutcome::Killed);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.replace_host(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::Geometry;
    use crate::core::CommandSpec;
    use crate::script::CombinedScript;
    use std::path::Path;
    use tokio::sync::broadcast;

    const HOST: &str = r#"
echo LOADING-COMPLETE
while read -r cmd; do
  case "$cmd" in
    START-ANIMATION)
      if grep -q fail "$LIGHTRUN_SCRIPT"; then
        echo SCRIPT-ENCOUNTERED-ERROR
        printf '%s\n' 'Traceback:\n  File "x.py", line 12, in <module>\nNameError: x' > "$LIGHTRUN_PIPE"
      elif grep -q hang "$LIGHTRUN_SCRIPT"; then
        echo "debug: hanging"
      else
        echo 'FRAME {"leds":[[255,0,0]]}'
        echo ANIMATION-FINISHED
      fi ;;
    SAVE-ANIMATION) echo ANIMATION-SAVED ;;
    QUIT-ANIMATION) exit 0 ;;
  esac
done
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        script: PathBuf,
        runner: SimulationRunner,
        rx: broadcast::Receiver<Event>,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| HOST.to_string())
    }

    fn fixture_with(host_script: impl FnOnce(&Path) -> String) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host.sh");
        std::fs::write(&host, host_script(dir.path())).unwrap();
        let cfg = SimulationConfig {
            host: CommandSpec::new("sh", [host.to_string_lossy().into_owned()]),
            pipe_path: dir.path().join("sim.pipe"),
            kill_grace: Duration::from_millis(500),
            ..SimulationConfig::default()
        };
        let bus = Bus::new(256);
        let rx = bus.subscribe();
        let script = dir.path().join("powerup-code-all.py");
        let board = Arc::new(Board::new("Lightboard", Geometry::Grid { width: 9, height: 14 }));
        let runner = SimulationRunner::new(cfg, board, 42, script.clone(), bus);
        Fixture {
            dir,
            script,
            runner,
            rx,
        }
    }

    async fn request(path: &Path, id: u64, body: &str) -> Arc<RunRequest> {
        let script = CombinedScript::combine("", body, "");
        script.write_to(path).await.unwrap();
        Arc::new(RunRequest {
            id,
            board: Arc::new(Board::new("Lightboard", Geometry::Grid { width: 9, height: 14 })),
            script,
            path: path.to_path_buf(),
        })
    }

    async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .unwrap();
            if ev.kind == kind {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn finished_animation_is_success() {
        let mut f = fixture();
        f.runner.launch().await.unwrap();
        next_of(&mut f.rx, EventKind::PlugLoaded).await;
        assert!(f.runner.is_loaded());

        f.runner
            .start(request(&f.script, 1, "light.on(A1)\n").await)
            .await
            .unwrap();
        let ev = next_of(&mut f.rx, EventKind::RunnerOutcome).await;
        assert_eq!(ev.run_id, Some(1));
        assert_eq!(ev.outcome, Some(RunOutcome::Success));
        assert_eq!(f.runner.frames(), vec![AnimationFrame::new(vec![[255, 0, 0]])]);

        f.runner.save_animation().await.unwrap();
        next_of(&mut f.rx, EventKind::GifEncoded).await;
        f.runner.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn script_error_text_comes_from_the_pipe() {
        let mut f = fixture();
        f.runner
            .start(request(&f.script, 2, "fail()\n").await)
            .await
            .unwrap();
        let ev = next_of(&mut f.rx, EventKind::RunnerOutcome).await;
        match ev.outcome {
            Some(RunOutcome::ScriptError(text)) => {
                assert!(text.contains("line 12"));
                assert!(text.ends_with("NameError: x"));
                assert!(text.contains('\n'));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        f.runner.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn kill_restarts_the_host() {
        let mut f = fixture();
        f.runner
            .start(request(&f.script, 3, "hang()\n").await)
            .await
            .unwrap();
        next_of(&mut f.rx, EventKind::RunnerRunning).await;
        assert!(f.runner.is_running());

        f.runner.kill().await.unwrap();
        let ev = next_of(&mut f.rx, EventKind::RunnerOutcome).await;
        assert_eq!(ev.outcome, Some(RunOutcome::Killed));
        assert_eq!(f.runner.state(), RunState::Idle);
        assert_eq!(f.runner.kill().await, Err(RunError::NotStarted));

        // The fresh host loads and accepts the next run.
        next_of(&mut f.rx, EventKind::PlugLoaded).await;
        f.runner
            .start(request(&f.script, 4, "ok()\n").await)
            .await
            .unwrap();
        let ev = next_of(&mut f.rx, EventKind::RunnerOutcome).await;
        assert_eq!((ev.run_id, ev.outcome), (Some(4), Some(RunOutcome::Success)));
        f.runner.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn teardown_stops_without_restart() {
        let f = fixture();
        f.runner.launch().await.unwrap();
        f.runner.teardown().await.unwrap();
        assert_eq!(f.runner.save_animation().await, Err(RunError::NotStarted));
        assert!(!f.runner.is_loaded());
    }

    #[tokio::test]
    async fn kill_while_loading_leaves_no_host_behind() {
        let mut f = fixture_with(|dir| {
            let pids = dir.join("pids");
            format!("echo $$ >> '{}'\nsleep 1{}", pids.display(), HOST)
        });
        let pids = f.dir.path().join("pids");

        f.runner
            .start(request(&f.script, 5, "light.on(A1)\n").await)
            .await
            .unwrap();
        assert_eq!(f.runner.state(), RunState::Starting);

        let mut old = String::new();
        for _ in 0..100 {
            old = std::fs::read_to_string(&pids).unwrap_or_default();
            if !old.trim().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let old = old.trim().to_string();
        assert!(!old.is_empty(), "host never started");

        f.runner.kill().await.unwrap();
        let ev = next_of(&mut f.rx, EventKind::RunnerOutcome).await;
        assert_eq!((ev.run_id, ev.outcome), (Some(5), Some(RunOutcome::Killed)));
        assert!(!Path::new(&format!("/proc/{old}")).exists());

        // Only the fresh host is left, and it takes the next run.
        next_of(&mut f.rx, EventKind::PlugLoaded).await;
        f.runner
            .start(request(&f.script, 6, "light.on(A2)\n").await)
            .await
            .unwrap();
        let ev = next_of(&mut f.rx, EventKind::RunnerOutcome).await;
        assert_eq!((ev.run_id, ev.outcome), (Some(6), Some(RunOutcome::Success)));

        let started: Vec<String> = std::fs::read_to_string(&pids)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(started.len(), 2);
        assert_ne!(started[1], old);
        f.runner.teardown().await.unwrap();
    }
}
