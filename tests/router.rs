use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lightrun::{
    Board, BoardRegistry, CommandSpec, Event, EventKind, FnSubscriber, Geometry, Router,
    RouterConfig, RunOutcome, RunnerKind,
};
use tokio::sync::mpsc;

/// Animation host speaking the line protocol; succeeds unless the staged script says `oops`.
const HOST: &str = r#"
echo LOADING-COMPLETE
while read -r cmd; do
  case "$cmd" in
    START-ANIMATION)
      if grep -q oops "$LIGHTRUN_SCRIPT"; then
        echo SCRIPT-ENCOUNTERED-ERROR
        printf '%s\n' 'Traceback:\n  File "x.py", line 13, in <module>\nValueError: oops' > "$LIGHTRUN_PIPE"
      elif grep -q silent "$LIGHTRUN_SCRIPT"; then
        echo SCRIPT-ENCOUNTERED-ERROR
        echo "" > "$LIGHTRUN_PIPE"
      else
        echo ANIMATION-FINISHED
      fi ;;
    SAVE-ANIMATION) echo ANIMATION-SAVED ;;
    QUIT-ANIMATION) exit 0 ;;
  esac
done
"#;

const FAILING_SCRIPT: &str = "echo 'File \"x.py\", line 12, in <module>' >&2
echo 'NameError: x' >&2
exit 1
";

struct Env {
    dir: tempfile::TempDir,
    router: Arc<Router>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn registry() -> BoardRegistry {
    let preamble: String = (1..=10).map(|i| format!("# preamble {i}\n")).collect();
    let mut reg = BoardRegistry::new();
    reg.register(
        Board::new("Lightboard", Geometry::Grid { width: 9, height: 14 })
            .with_preamble(preamble)
            .with_postamble("# postamble\n"),
    );
    reg.register(Board::new("LED Speaker", Geometry::Ring { leds: 10 }));
    reg
}

fn config(dir: &Path) -> RouterConfig {
    let host = dir.join("host.sh");
    std::fs::write(&host, HOST).unwrap();

    let mut cfg = RouterConfig::default();
    cfg.work_dir = dir.join("work");
    cfg.grace = Duration::from_secs(2);
    cfg.simulation.host = CommandSpec::new("sh", [host.to_string_lossy().into_owned()]);
    cfg.simulation.pipe_path = dir.join("sim.pipe");
    cfg.simulation.kill_grace = Duration::from_millis(500);
    cfg.local.interpreter = "sh".to_string();
    cfg.local.pattern_kill = None;
    cfg.local.kill_grace = Duration::from_millis(500);
    cfg.remote.enabled = false;
    cfg
}

fn env_with(tweak: impl FnOnce(&mut RouterConfig)) -> Env {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    tweak(&mut cfg);

    let router = Router::builder(cfg).with_registry(registry()).build();
    let (tx, events) = mpsc::unbounded_channel();
    for kind in [
        EventKind::ChangedBoard,
        EventKind::RunStarted,
        EventKind::FinishedRun,
        EventKind::RunKilled,
        EventKind::Error,
    ] {
        let tx = tx.clone();
        router.subscribe(
            kind,
            FnSubscriber::arc("collector", move |ev: &Event| {
                let _ = tx.send(ev.clone());
            }),
        );
    }
    Env { dir, router, events }
}

async fn next_of(rx: &mut mpsc::UnboundedReceiver<Event>, kind: EventKind) -> Event {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event in time")
            .expect("router alive");
        if ev.kind == kind {
            return ev;
        }
    }
}

async fn wait_for_pid(path: &PathBuf) -> Option<String> {
    for _ in 0..100 {
        let pid = std::fs::read_to_string(path).unwrap_or_default();
        if !pid.trim().is_empty() {
            return Some(pid.trim().to_string());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::test]
async fn unsupported_board_keeps_the_selection() {
    let mut env = env_with(|cfg| cfg.local.enabled = false);
    env.router.change_board("Lightboard").await.unwrap();
    let ev = next_of(&mut env.events, EventKind::ChangedBoard).await;
    assert_eq!(ev.board.as_deref(), Some("Lightboard"));

    let err = env.router.change_board("Cube").await.unwrap_err();
    assert_eq!(err.as_label(), "router_unsupported_board");
    assert!(env.router.is_current_board("Lightboard"));
    assert_eq!(
        env.router.current_board().map(|b| b.name().to_string()),
        Some("Lightboard".to_string())
    );

    env.router.shutdown().await;
}

#[tokio::test]
async fn run_without_board_is_rejected() {
    let env = env_with(|_| {});
    let err = env.router.run("light.on(A1)").await.unwrap_err();
    assert_eq!(err.as_label(), "router_no_board");
    env.router.shutdown().await;
}

#[tokio::test]
async fn finished_simulation_reports_empty_error_text() {
    let mut env = env_with(|cfg| cfg.local.enabled = false);
    env.router.change_board("Lightboard").await.unwrap();
    env.router.set_display_socket(7).await.unwrap();
    assert_eq!(env.router.active_runners().await, vec![RunnerKind::Simulation]);

    let id = env.router.run("light.on(A1)").await.unwrap();
    let ev = next_of(&mut env.events, EventKind::FinishedRun).await;
    assert_eq!(ev.runner, Some(RunnerKind::Simulation));
    assert_eq!(ev.run_id, Some(id));
    assert_eq!(ev.message_or_empty(), "");

    env.router.shutdown().await;
}

#[tokio::test]
async fn simulation_error_text_is_attributed() {
    let mut env = env_with(|cfg| cfg.local.enabled = false);
    env.router.change_board("Lightboard").await.unwrap();
    env.router.set_display_socket(7).await.unwrap();

    env.router
        .run("light.on(A1)\nlight.on(A2)\nraise ValueError('oops')\n")
        .await
        .unwrap();
    let ev = next_of(&mut env.events, EventKind::FinishedRun).await;
    assert_eq!(ev.message_or_empty(), "Error on Line 3: ValueError: oops");

    env.router.shutdown().await;
}

#[tokio::test]
async fn local_script_error_is_attributed_to_the_user_line() {
    let mut env = env_with(|_| {});
    env.router.change_board("Lightboard").await.unwrap();
    assert_eq!(env.router.active_runners().await, vec![RunnerKind::Local]);

    env.router.run(FAILING_SCRIPT).await.unwrap();
    let ev = next_of(&mut env.events, EventKind::FinishedRun).await;
    assert_eq!(ev.runner, Some(RunnerKind::Local));
    assert_eq!(ev.message_or_empty(), "Error on Line 2: NameError: x");

    env.router.shutdown().await;
}

#[tokio::test]
async fn concurrent_runners_report_independently() {
    let mut env = env_with(|_| {});
    env.router.change_board("Lightboard").await.unwrap();
    env.router.set_display_socket(3).await.unwrap();
    assert_eq!(
        env.router.active_runners().await,
        vec![RunnerKind::Simulation, RunnerKind::Local]
    );

    let id = env.router.run(FAILING_SCRIPT).await.unwrap();
    let mut finished = HashMap::new();
    for _ in 0..2 {
        let ev = next_of(&mut env.events, EventKind::FinishedRun).await;
        assert_eq!(ev.run_id, Some(id));
        finished.insert(ev.runner.unwrap(), ev.message_or_empty().to_string());
    }
    assert_eq!(finished[&RunnerKind::Simulation], "");
    assert_eq!(finished[&RunnerKind::Local], "Error on Line 2: NameError: x");

    let outcomes = env.router.last_outcomes();
    assert_eq!(outcomes.get(&RunnerKind::Simulation), Some(&RunOutcome::Success));
    assert!(matches!(
        outcomes.get(&RunnerKind::Local),
        Some(RunOutcome::ScriptError(_))
    ));

    env.router.shutdown().await;
}

#[tokio::test]
async fn kill_twice_is_quiet() {
    let mut env = env_with(|_| {});
    env.router.change_board("Lightboard").await.unwrap();

    env.router.run("sleep 30\n").await.unwrap();
    next_of(&mut env.events, EventKind::RunStarted).await;
    assert!(env.router.is_running().await);

    env.router.kill().await;
    let ev = next_of(&mut env.events, EventKind::RunKilled).await;
    assert_eq!(ev.runner, Some(RunnerKind::Local));

    env.router.kill().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(ev) = env.events.try_recv() {
        assert_ne!(ev.kind, EventKind::Error, "unexpected error: {:?}", ev.message);
        assert_ne!(ev.kind, EventKind::RunKilled);
    }
    assert!(!env.router.is_running().await);

    env.router.shutdown().await;
}

#[tokio::test]
async fn kill_right_after_start_leaves_no_process() {
    let mut env = env_with(|_| {});
    let pidfile = env.dir.path().join("pid");
    env.router.change_board("Lightboard").await.unwrap();

    let script = format!("echo $$ > {}\nsleep 30\n", pidfile.display());
    env.router.run(&script).await.unwrap();
    env.router.kill().await;
    next_of(&mut env.events, EventKind::RunKilled).await;

    if let Some(pid) = wait_for_pid(&pidfile).await {
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }
    assert!(env.router.pending_runners().await.is_empty());

    env.router.shutdown().await;
}

#[tokio::test]
async fn changing_board_tears_runs_down() {
    let mut env = env_with(|_| {});
    let pidfile = env.dir.path().join("pid");
    env.router.change_board("Lightboard").await.unwrap();

    let script = format!("echo $$ > {}\nsleep 30\n", pidfile.display());
    env.router.run(&script).await.unwrap();
    let pid = wait_for_pid(&pidfile).await.expect("script started");

    env.router.change_board("LED Speaker").await.unwrap();
    next_of(&mut env.events, EventKind::RunKilled).await;
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(env.router.is_current_board("LED Speaker"));

    env.router.shutdown().await;
}

#[tokio::test]
async fn failed_network_bring_up_only_disables_remote() {
    let mut env = env_with(|cfg| {
        cfg.remote.enabled = true;
        cfg.network_bring_up = Some(CommandSpec::new("false", Vec::<String>::new()));
    });
    env.router.change_board("Lightboard").await.unwrap();
    next_of(&mut env.events, EventKind::ChangedBoard).await;

    assert_eq!(env.router.active_runners().await, vec![RunnerKind::Local]);
    assert!(env.router.powerup_status().await.is_none());
    let err = env.router.power_off_remote().await.unwrap_err();
    assert_eq!(err.as_label(), "run_not_available");

    env.router.shutdown().await;
}

#[tokio::test]
async fn shutdown_kills_running_scripts() {
    let env = env_with(|_| {});
    let pidfile = env.dir.path().join("pid");
    env.router.change_board("Lightboard").await.unwrap();

    let script = format!("echo $$ > {}\nsleep 30\n", pidfile.display());
    env.router.run(&script).await.unwrap();
    let pid = wait_for_pid(&pidfile).await.expect("script started");

    env.router.shutdown().await;
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(env.router.active_runners().await.is_empty());
}

#[tokio::test]
async fn one_subscriber_per_kind() {
    let env = env_with(|_| {});
    let replaced = env.router.subscribe(
        EventKind::FinishedRun,
        FnSubscriber::arc("second", |_ev: &Event| {}),
    );
    assert_eq!(replaced, Some("collector"));
    assert!(env.router.unsubscribe(EventKind::FinishedRun));
    assert!(!env.router.unsubscribe(EventKind::FinishedRun));
    env.router.shutdown().await;
}

#[tokio::test]
async fn display_attached_before_board_is_used_once_selected() {
    let mut env = env_with(|cfg| cfg.local.enabled = false);
    env.router.set_display_socket(5).await.unwrap();
    assert!(env.router.active_runners().await.is_empty());

    env.router.change_board("Lightboard").await.unwrap();
    assert_eq!(env.router.active_runners().await, vec![RunnerKind::Simulation]);

    env.router.run("light.on(A1)").await.unwrap();
    let ev = next_of(&mut env.events, EventKind::FinishedRun).await;
    assert_eq!(ev.message_or_empty(), "");

    env.router.shutdown().await;
}

#[tokio::test]
async fn blank_error_text_still_reports_a_failure() {
    let mut env = env_with(|cfg| cfg.local.enabled = false);
    env.router.change_board("Lightboard").await.unwrap();
    env.router.set_display_socket(7).await.unwrap();

    env.router.run("silent()\n").await.unwrap();
    let ev = next_of(&mut env.events, EventKind::FinishedRun).await;
    assert_eq!(ev.message_or_empty(), "Error: The script encountered an error");
    assert_eq!(
        env.router.last_outcomes().get(&RunnerKind::Simulation),
        Some(&RunOutcome::ScriptError(String::new()))
    );

    env.router.shutdown().await;
}

#[tokio::test]
async fn kill_returns_before_slow_sweeps_finish() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("slow");
    let pkill = dir.path().join("pkill.sh");
    std::fs::write(
        &pkill,
        format!("#!/bin/sh\n[ -f '{}' ] && sleep 2\nexit 1\n", marker.display()),
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&pkill, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let pkill_path = pkill.to_string_lossy().into_owned();
    let mut env = env_with(move |cfg| cfg.local.pattern_kill = Some(pkill_path));
    env.router.change_board("Lightboard").await.unwrap();
    env.router.run("sleep 30\n").await.unwrap();
    next_of(&mut env.events, EventKind::RunStarted).await;

    std::fs::write(&marker, b"").unwrap();
    let started = Instant::now();
    env.router.kill().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let ev = next_of(&mut env.events, EventKind::RunKilled).await;
    assert_eq!(ev.runner, Some(RunnerKind::Local));

    std::fs::remove_file(&marker).unwrap();
    env.router.shutdown().await;
}

