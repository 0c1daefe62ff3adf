//! lightrun CLI.
//!
//! Selects a board, runs one script on every available back-end and prints the
//! resulting events until every runner has reported back (or a signal arrives).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use lightrun::{
    BoardRegistry, CommandSpec, Event, EventKind, FnSubscriber, Router, RouterConfig,
    RouterError, logging, wait_for_shutdown_signal,
};

#[derive(Parser)]
#[command(name = "lightrun")]
#[command(about = "Run LED board scripts on the simulator, local hardware and the Powerup Kit", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Options {
    /// Board to select
    #[arg(long, global = true, default_value = "Lightboard")]
    board: String,

    /// Directory with base_preamble.py / base_postamble.py and per-board wrappers
    #[arg(long, global = true)]
    wrappers: Option<PathBuf>,

    /// Directory the combined script is staged in
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Interpreter used to run scripts (locally and on the kit)
    #[arg(long, global = true)]
    interpreter: Option<String>,

    /// Do not run scripts on locally attached hardware
    #[arg(long, global = true)]
    no_local: bool,

    /// Display id to render the simulation into (simulation disabled when absent)
    #[arg(long, global = true)]
    display: Option<u64>,

    /// Animation host program
    #[arg(long, global = true)]
    sim_host: Option<String>,

    /// Argument passed to the animation host (repeatable)
    #[arg(long = "sim-arg", global = true)]
    sim_args: Vec<String>,

    /// Ask the animation host to log what it is doing
    #[arg(long, global = true)]
    sim_debug: bool,

    /// Also run on the Powerup Kit over ssh
    #[arg(long, global = true)]
    remote: bool,

    /// Kit hostname
    #[arg(long, global = true)]
    remote_host: Option<String>,

    /// Login user on the kit
    #[arg(long, global = true)]
    remote_user: Option<String>,

    /// Library directory copied to the kit (repeatable)
    #[arg(long = "lib", global = true)]
    libraries: Vec<PathBuf>,

    /// Fonts directory copied to the kit
    #[arg(long, global = true)]
    fonts: Option<PathBuf>,

    /// Skip the network bring-up command
    #[arg(long, global = true)]
    no_bring_up: bool,

    /// Seconds to wait for the kit to become available
    #[arg(long, global = true, default_value = "15")]
    remote_wait: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and wait for every runner to finish
    Run {
        /// Script file (user code only; board wrappers are added)
        script: PathBuf,

        /// Ask the animation host to save the animation after the run
        #[arg(long)]
        save: bool,
    },
    /// List the supported boards
    Boards,
    /// Turn the kit's LEDs off and shut it down
    PowerOff,
}

impl Options {
    fn config(&self) -> RouterConfig {
        let mut cfg = RouterConfig::default();
        if let Some(dir) = &self.work_dir {
            cfg.work_dir = dir.clone();
        }
        if let Some(interp) = &self.interpreter {
            cfg.local.interpreter = interp.clone();
            cfg.remote.interpreter = interp.clone();
        }
        cfg.local.enabled = !self.no_local;

        if let Some(host) = &self.sim_host {
            cfg.simulation.host = CommandSpec::new(host.clone(), self.sim_args.iter().cloned());
        }
        cfg.simulation.debug = self.sim_debug;

        cfg.remote.enabled = self.remote;
        if let Some(host) = &self.remote_host {
            cfg.remote.host = host.clone();
        }
        if let Some(user) = &self.remote_user {
            cfg.remote.user = user.clone();
        }
        cfg.remote.libraries = self.libraries.clone();
        cfg.remote.fonts_dir = self.fonts.clone();
        if self.no_bring_up {
            cfg.network_bring_up = None;
        }
        cfg
    }

    fn registry(&self) -> Result<BoardRegistry, RouterError> {
        let mut registry = BoardRegistry::builtin();
        if let Some(dir) = &self.wrappers {
            registry.load_wrappers(dir)?;
        }
        Ok(registry)
    }
}

fn print_event(ev: &Event) {
    let who = ev.runner.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
    match ev.kind {
        EventKind::FinishedRun if ev.message_or_empty().is_empty() => {
            println!("[{who}] finished");
        }
        EventKind::FinishedRun => println!("[{who}] {}", ev.message_or_empty()),
        EventKind::PowerupStatus => {
            if let Some(st) = ev.status {
                println!(
                    "[remote] detected={} setup_complete={} available={}",
                    st.detected, st.setup_complete, st.available
                );
            }
        }
        EventKind::PlugError => {
            if let Some(err) = &ev.plug_error {
                println!("[{who}] {}: {}", err.title, err.description);
            }
        }
        EventKind::ChangedBoard => {
            println!("board: {}", ev.board.as_deref().unwrap_or_default());
        }
        _ => println!("[{who}] {} {}", ev.kind.as_str(), ev.message_or_empty()),
    }
}

fn build_router(opts: &Options) -> Result<Arc<Router>, RouterError> {
    let mut builder = Router::builder(opts.config()).with_registry(opts.registry()?);
    for kind in [
        EventKind::ChangedBoard,
        EventKind::RunStarted,
        EventKind::FinishedRun,
        EventKind::RunKilled,
        EventKind::Error,
        EventKind::PowerupStatus,
        EventKind::PlugError,
        EventKind::GifEncoded,
    ] {
        builder = builder.with_subscriber(kind, FnSubscriber::arc("stdout", print_event));
    }
    Ok(builder.build())
}

async fn wait_for_kit(router: &Router, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if router.powerup_status().await.is_some_and(|st| st.available) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

async fn prepare(router: &Router, opts: &Options) -> Result<(), RouterError> {
    router.change_board(&opts.board).await?;
    if let Some(display) = opts.display {
        router.set_display_socket(display).await?;
    }
    if opts.remote && !wait_for_kit(router, Duration::from_secs(opts.remote_wait)).await {
        warn!(host = %router.config().remote.host, "kit not available, running without it");
    }
    Ok(())
}

/// Waits until no runner has an outstanding run. Returns `false` if interrupted.
async fn wait_settled(router: &Router) -> bool {
    let settle = async {
        // Give the runners a moment to register the run before polling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while !router.pending_runners().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::select! {
        _ = settle => true,
        res = wait_for_shutdown_signal() => {
            if let Err(e) = res {
                warn!(error = %e, "could not listen for signals");
            }
            false
        }
    }
}

async fn execute(cli: &Cli, router: &Router) -> Result<ExitCode, RouterError> {
    let opts = &cli.opts;
    match &cli.command {
        Commands::Boards => {
            for name in router.board_names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::PowerOff => {
            prepare(router, opts).await?;
            router.power_off_remote().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { script, save } => {
            prepare(router, opts).await?;
            let code = tokio::fs::read_to_string(script).await?;
            let run_id = router.run(&code).await?;
            info!(run_id, runners = ?router.active_runners().await, "running");

            if !wait_settled(router).await {
                info!("interrupted, killing runs");
                router.kill().await;
                return Ok(ExitCode::from(130));
            }
            if *save {
                if let Err(e) = router.save_animation().await {
                    warn!(error = %e.as_message(), "could not save the animation");
                }
            }

            let failed = router.last_outcomes().values().any(|o| o.is_failure());
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init_logging(&cli.opts.log_level) {
        eprintln!("lightrun: could not initialise logging: {e}");
    }

    let router = match build_router(&cli.opts) {
        Ok(router) => router,
        Err(e) => {
            error!(error = %e.as_message(), "could not start");
            return ExitCode::FAILURE;
        }
    };

    let code = match execute(&cli, &router).await {
        Ok(code) => code,
        Err(e) => {
            error!(label = e.as_label(), error = %e.as_message(), "lightrun failed");
            ExitCode::FAILURE
        }
    };
    router.shutdown().await;
    code
}
