//! # Router: owns the selected board and fans runs out to every runner.
//!
//! The [`Router`] owns the event bus, a [`SubscriberSet`], the board registry and
//! up to three runners (simulation, local, remote). It is the only component the
//! user-facing layer talks to.
//!
//! ## Key responsibilities
//! - select a board and rebuild the runners for it ([`Router::change_board`])
//! - stage the combined script and start it on every available runner concurrently
//! - forward kills to every runner, swallowing "nothing to kill"
//! - translate raw runner outcomes into user-facing events with error attribution
//! - tear every child process down on board change and on shutdown
//!
//! ## Event flow
//! ```text
//! runners ── RunnerOutcome / RunnerRunning ──► Bus ──► listener
//!                                                        │ RunTracker::update (stale → dropped)
//!                                                        ▼
//!                          FinishedRun / RunKilled / Error ──► Bus ──► listener ──► SubscriberSet
//!                                                                                   (one per kind)
//! ```
//!
//! ## Outcome translation
//! - `Success` → `FinishedRun` with empty message
//! - `ScriptError(text)` → `FinishedRun` with `"Error on Line {n}: {msg}"` / `"Error: {msg}"`,
//!   or a generic error message when `text` is blank
//! - `TransportError(text)` → `Error` with `text`
//! - `Killed` → `RunKilled`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::builder::RouterBuilder;
use super::config::RouterConfig;
use super::tracker::RunTracker;
use crate::boards::{Board, BoardRegistry};
use crate::error::{RouterError, RunError, RunOutcome};
use crate::events::{Bus, Event, EventKind, PowerupStatus};
use crate::runners::exec::run_checked;
use crate::runners::{
    AnimationFrame, LocalRunner, PlugError, RemoteRunner, RunRequest, Runner, RunnerKind,
    SimulationRunner,
};
use crate::script::CombinedScript;
use crate::subscribers::{Subscribe, SubscriberSet};

/// Reported for a failed script whose error text carries nothing to attribute.
const GENERIC_SCRIPT_ERROR: &str = "Error: The script encountered an error";

/// Runners built for the selected board.
#[derive(Default)]
struct Runners {
    simulation: Option<Arc<SimulationRunner>>,
    local: Option<Arc<LocalRunner>>,
    remote: Option<Arc<RemoteRunner>>,
}

impl Runners {
    fn all(&self) -> Vec<Arc<dyn Runner>> {
        let mut all: Vec<Arc<dyn Runner>> = Vec::with_capacity(3);
        if let Some(r) = &self.simulation {
            all.push(r.clone());
        }
        if let Some(r) = &self.local {
            all.push(r.clone());
        }
        if let Some(r) = &self.remote {
            all.push(r.clone());
        }
        all
    }
}

/// Coordinates the runners of the selected board and delivers their events.
pub struct Router {
    cfg: RouterConfig,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    registry: BoardRegistry,
    tracker: RunTracker,
    board: RwLock<Option<Arc<Board>>>,
    display: Mutex<Option<u64>>,
    runners: tokio::sync::Mutex<Runners>,
    outcomes: Mutex<BTreeMap<RunnerKind, RunOutcome>>,
    next_run: AtomicU64,
    token: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Returns a builder for a router using `cfg`.
    pub fn builder(cfg: RouterConfig) -> RouterBuilder {
        RouterBuilder::new(cfg)
    }

    pub(crate) fn new_internal(cfg: RouterConfig, registry: BoardRegistry) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(bus.clone()));
        Self {
            cfg,
            bus,
            subs,
            registry,
            tracker: RunTracker::new(),
            board: RwLock::new(None),
            display: Mutex::new(None),
            runners: tokio::sync::Mutex::new(Runners::default()),
            outcomes: Mutex::new(BTreeMap::new()),
            next_run: AtomicU64::new(1),
            token: CancellationToken::new(),
            listener: Mutex::new(None),
        }
    }

    /// Subscribes to the bus and spawns the listener that translates and fans out events.
    pub(crate) fn spawn_listener(self: &Arc<Self>) {
        let rx = self.bus.subscribe();
        let task = listen(Arc::downgrade(self), rx, self.token.clone());
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(tokio::spawn(task));
    }

    /// Configuration the router was built with.
    pub fn config(&self) -> &RouterConfig {
        &self.cfg
    }

    /// Currently selected board.
    pub fn current_board(&self) -> Option<Arc<Board>> {
        self.board.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True if `name` is the selected board.
    pub fn is_current_board(&self, name: &str) -> bool {
        self.current_board().is_some_and(|b| b.name() == name)
    }

    /// Names of all selectable boards.
    pub fn board_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Selects `name` and rebuilds every runner for it.
    ///
    /// An unknown name fails with [`RouterError::UnsupportedBoard`] and leaves the
    /// current selection and runners untouched. Runners that cannot be brought up
    /// are left out; that never fails the board change.
    pub async fn change_board(&self, name: &str) -> Result<(), RouterError> {
        let board = self.registry.get(name)?;
        let mut runners = self.runners.lock().await;

        self.teardown_runners(&mut runners).await;
        *self.board.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&board));

        let display = *self.display.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(display) = display {
            runners.simulation = self.simulation_for(&board, display).await;
        }
        runners.local = self.local_for(&board).await;
        runners.remote = self.remote_for(&board).await;

        info!(
            board = board.name(),
            simulation = runners.simulation.is_some(),
            local = runners.local.is_some(),
            remote = runners.remote.is_some(),
            "board changed"
        );
        self.bus
            .publish(Event::new(EventKind::ChangedBoard).with_board(board.name()));
        Ok(())
    }

    /// Attaches render target `display_id` and (re)starts the animation host on it.
    pub async fn set_display_socket(&self, display_id: u64) -> Result<(), RouterError> {
        let mut runners = self.runners.lock().await;
        *self.display.lock().unwrap_or_else(|e| e.into_inner()) = Some(display_id);

        if let Some(old) = runners.simulation.take() {
            self.teardown_one(old).await;
        }
        let Some(board) = self.current_board() else {
            debug!(display_id, "display attached before a board was selected");
            return Ok(());
        };
        if !self.cfg.simulation.enabled {
            return Ok(());
        }

        let sim = Arc::new(SimulationRunner::new(
            self.cfg.simulation.clone(),
            Arc::clone(&board),
            display_id,
            self.cfg.script_path(),
            self.bus.clone(),
        ));
        sim.launch().await?;
        runners.simulation = Some(sim);
        info!(display_id, board = board.name(), "display attached");
        Ok(())
    }

    /// Stages `script` for the selected board and starts it on every available runner.
    ///
    /// Runners whose precondition does not hold are skipped. A runner failing to
    /// start is reported through an `Error` event and does not affect the others.
    /// Returns the id of the new run.
    pub async fn run(&self, script: &str) -> Result<u64, RouterError> {
        let runners = self.runners.lock().await;
        let board = self.current_board().ok_or(RouterError::NoBoard)?;

        let combined = CombinedScript::combine(board.preamble(), script, board.postamble());
        let path = self.cfg.script_path();
        combined
            .write_to(&path)
            .await
            .map_err(|e| RouterError::Script {
                error: format!("{}: {e}", path.display()),
            })?;

        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let req = Arc::new(RunRequest {
            id,
            board,
            script: combined,
            path,
        });

        let starts = runners
            .all()
            .into_iter()
            .map(|runner| self.start_on(runner, Arc::clone(&req)));
        let started: Vec<RunnerKind> = join_all(starts).await.into_iter().flatten().collect();

        info!(run_id = id, runners = ?started, "run dispatched");
        Ok(id)
    }

    async fn start_on(&self, runner: Arc<dyn Runner>, req: Arc<RunRequest>) -> Option<RunnerKind> {
        let kind = runner.kind();
        if !runner.detect().await {
            debug!(runner = %kind, "runner not available, skipped");
            return None;
        }

        self.tracker.dispatch(kind, Arc::clone(&req)).await;
        match runner.start(Arc::clone(&req)).await {
            Ok(()) => {
                self.bus.publish(
                    Event::new(EventKind::RunStarted)
                        .with_runner(kind)
                        .with_run_id(req.id),
                );
                Some(kind)
            }
            Err(e) => {
                self.tracker.abandon(kind, req.id).await;
                if e.is_benign() {
                    debug!(runner = %kind, reason = %e.as_message(), "runner skipped");
                } else {
                    warn!(runner = %kind, error = %e.as_message(), "runner failed to start");
                    self.bus.publish(
                        Event::error(e.as_message())
                            .with_runner(kind)
                            .with_run_id(req.id),
                    );
                }
                None
            }
        }
    }

    /// Asks every runner to stop its current run.
    ///
    /// Each kill runs on its own task, so this returns without waiting for
    /// processes to exit or hosts to restart. Outcomes arrive as `RunKilled`.
    pub async fn kill(&self) {
        let runners = self.runners.lock().await.all();
        for runner in runners {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let kind = runner.kind();
                match runner.kill().await {
                    Ok(()) => debug!(runner = %kind, "kill requested"),
                    Err(e) if e.is_benign() => {}
                    Err(e) => {
                        warn!(runner = %kind, error = %e.as_message(), "kill failed");
                        bus.publish(Event::error(e.as_message()).with_runner(kind));
                    }
                }
            });
        }
    }

    /// True if any runner has a run in flight.
    pub async fn is_running(&self) -> bool {
        self.runners
            .lock()
            .await
            .all()
            .iter()
            .any(|r| r.is_running())
    }

    /// Runners built for the selected board, in dispatch order.
    pub async fn active_runners(&self) -> Vec<RunnerKind> {
        self.runners.lock().await.all().iter().map(|r| r.kind()).collect()
    }

    /// Runners whose latest run has not reported an outcome yet.
    pub async fn pending_runners(&self) -> Vec<RunnerKind> {
        self.tracker.active().await
    }

    /// Asks the animation host to save the recorded animation.
    pub async fn save_animation(&self) -> Result<(), RouterError> {
        let sim = self.runners.lock().await.simulation.clone();
        match sim {
            Some(sim) => Ok(sim.save_animation().await?),
            None => Err(RunError::not_available("no display attached").into()),
        }
    }

    /// Frames recorded by the simulation during the last run, trimmed for export.
    pub async fn export_frames(&self) -> Result<Vec<AnimationFrame>, PlugError> {
        let sim = self.runners.lock().await.simulation.clone();
        match sim {
            Some(sim) => sim.export_frames(),
            None => Err(PlugError::no_frames()),
        }
    }

    /// Turns the remote kit's LEDs off and shuts it down.
    pub async fn power_off_remote(&self) -> Result<(), RouterError> {
        let remote = self.runners.lock().await.remote.clone();
        match remote {
            Some(remote) => Ok(remote.power_off().await?),
            None => Err(RunError::not_available("remote execution is not set up").into()),
        }
    }

    /// Last status of the remote kit, if a remote runner exists.
    pub async fn powerup_status(&self) -> Option<PowerupStatus> {
        self.runners.lock().await.remote.as_ref().map(|r| r.status())
    }

    /// Most recent accepted outcome of every runner.
    pub fn last_outcomes(&self) -> BTreeMap<RunnerKind, RunOutcome> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Subscribes `sub` to `kind`, replacing any earlier subscriber of that kind.
    ///
    /// Returns the name of the replaced subscriber.
    pub fn subscribe(&self, kind: EventKind, sub: Arc<dyn Subscribe>) -> Option<&'static str> {
        self.subs.subscribe(kind, sub)
    }

    /// Removes the subscriber of `kind`. Returns `false` if there was none.
    pub fn unsubscribe(&self, kind: EventKind) -> bool {
        self.subs.unsubscribe(kind)
    }

    /// Kills every runner, waits up to `grace` for their last events, then
    /// stops event delivery.
    pub async fn shutdown(&self) {
        {
            let mut runners = self.runners.lock().await;
            self.teardown_runners(&mut runners).await;
        }

        // Let the listener drain what the teardown published.
        let drained = tokio::time::timeout(self.cfg.grace, async {
            while !self.tracker.active().await.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pending = ?self.tracker.active().await, "runners did not settle within grace");
        }

        self.token.cancel();
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        self.subs.shutdown().await;
        info!("router stopped");
    }

    async fn teardown_runners(&self, runners: &mut Runners) {
        let old = std::mem::take(runners);
        let teardowns = old.all().into_iter().map(|r| self.teardown_one(r));
        join_all(teardowns).await;
    }

    async fn teardown_one(&self, runner: Arc<dyn Runner>) {
        let kind = runner.kind();
        if let Err(e) = runner.teardown().await {
            warn!(runner = %kind, error = %e.as_message(), "runner teardown failed");
        }
        runner.wait_idle().await;
        debug!(runner = %kind, "runner torn down");
    }

    async fn simulation_for(&self, board: &Arc<Board>, display: u64) -> Option<Arc<SimulationRunner>> {
        if !self.cfg.simulation.enabled {
            return None;
        }
        let sim = Arc::new(SimulationRunner::new(
            self.cfg.simulation.clone(),
            Arc::clone(board),
            display,
            self.cfg.script_path(),
            self.bus.clone(),
        ));
        match sim.launch().await {
            Ok(()) => Some(sim),
            Err(e) => {
                error!(error = %e.as_message(), "could not start the animation host");
                self.bus.publish(
                    Event::error(e.as_message()).with_runner(RunnerKind::Simulation),
                );
                None
            }
        }
    }

    async fn local_for(&self, board: &Arc<Board>) -> Option<Arc<LocalRunner>> {
        if !self.cfg.local.enabled {
            return None;
        }
        if !board.detect().await {
            debug!(board = board.name(), "board hardware not attached");
            return None;
        }
        Some(Arc::new(LocalRunner::new(
            self.cfg.local.clone(),
            Arc::clone(board),
            self.bus.clone(),
        )))
    }

    async fn remote_for(&self, board: &Arc<Board>) -> Option<Arc<RemoteRunner>> {
        if !self.cfg.remote.enabled {
            return None;
        }
        if let Some(spec) = self.cfg.bring_up() {
            let mut cmd = spec.command();
            let timeout = Some(self.cfg.bring_up_timeout);
            if let Err(e) = run_checked(&mut cmd, "Network bring-up failed", timeout).await {
                warn!(error = %e.as_message(), "remote execution disabled for this board");
                return None;
            }
        }
        let remote = Arc::new(RemoteRunner::new(
            self.cfg.remote.clone(),
            Arc::clone(board),
            self.cfg.work_dir.clone(),
            self.bus.clone(),
        ));
        remote.start_heartbeat();
        Some(remote)
    }

    fn record(&self, runner: RunnerKind, outcome: &RunOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runner, outcome.clone());
    }

    /// Turns an accepted runner outcome into the event subscribers see.
    fn translate(&self, ev: &Event, req: &RunRequest) -> Option<Event> {
        let runner = ev.runner?;
        let outcome = ev.outcome.as_ref()?;
        self.record(runner, outcome);

        let base = |kind| {
            Event::new(kind)
                .with_runner(runner)
                .with_run_id(req.id)
                .with_board(req.board.name())
        };
        let out = match outcome {
            RunOutcome::Success => base(EventKind::FinishedRun).with_message(""),
            RunOutcome::ScriptError(text) => {
                let message = req
                    .script
                    .attribute(text)
                    .unwrap_or_else(|| GENERIC_SCRIPT_ERROR.to_string());
                info!(runner = %runner, run_id = req.id, %message, "script failed");
                base(EventKind::FinishedRun).with_message(message)
            }
            RunOutcome::TransportError(text) => {
                error!(runner = %runner, run_id = req.id, error = %text, "run failed");
                base(EventKind::Error).with_message(text.as_str())
            }
            RunOutcome::Killed => base(EventKind::RunKilled),
        };
        Some(out)
    }

    async fn on_event(&self, ev: Event) {
        if !ev.kind.is_internal() {
            self.subs.emit(&ev);
            return;
        }

        let Some(req) = self.tracker.update(&ev).await else {
            debug!(
                kind = ev.kind.as_str(),
                runner = ?ev.runner,
                run_id = ?ev.run_id,
                "stale runner event dropped"
            );
            return;
        };
        match ev.kind {
            EventKind::RunnerRunning => {
                debug!(runner = ?ev.runner, run_id = req.id, "run confirmed by back-end");
            }
            EventKind::RunnerOutcome => {
                if let Some(out) = self.translate(&ev, &req) {
                    self.bus.publish(out);
                }
            }
            _ => {}
        }
    }
}

/// Receives bus events until the router is dropped or shut down.
///
/// Buffered events are delivered before a shutdown request is honoured.
async fn listen(router: Weak<Router>, mut rx: broadcast::Receiver<Event>, token: CancellationToken) {
    loop {
        let ev = tokio::select! {
            biased;
            ev = rx.recv() => ev,
            _ = token.cancelled() => break,
        };
        match ev {
            Ok(ev) => {
                let Some(router) = router.upgrade() else { break };
                router.on_event(ev).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "router listener lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("router listener stopped");
}
