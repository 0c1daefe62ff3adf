//! # lightrun
//!
//! **lightrun** runs LED board scripts on up to three back-ends at once: an
//! on-screen animation host, hardware attached to this machine and a remote
//! Powerup Kit reached over ssh. A single [`Router`] owns the selected board,
//! fans every run and kill out to the runners, and turns what they report into
//! one event stream.
//!
//! ## Architecture
//! ```text
//!                      Router::run(script)
//!                              │ preamble + script + postamble → staged file
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Simulation   │     │ Local        │     │ Remote       │
//! │ line protocol│     │ child process│     │ scp + ssh    │
//! │ + error FIFO │     │ group        │     │ + heartbeat  │
//! └──────┬───────┘     └──────┬───────┘     └──────┬───────┘
//!        │ RunnerOutcome      │ RunnerOutcome      │ RunnerOutcome, PowerupStatus
//!        ▼                    ▼                    ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                 Bus (broadcast channel)                   │
//! └─────────────────────────────┬─────────────────────────────┘
//!                               ▼
//!                    router listener (RunTracker)
//!               stale events dropped, errors attributed
//!                               ▼
//!                         SubscriberSet
//!                (at most one subscriber per kind)
//! ```
//!
//! ## Run lifecycle
//! ```text
//! Idle ──start──► Starting ──back-end confirms──► Running
//!   ▲                 │                              │
//!   │                 └──────────── kill ────────────┤
//!   │                                                ▼
//!   └──────────────── Finished / Failed / Killed ◄───┘
//! ```
//!
//! ## Features
//! | Area            | Description                                              | Key types                         |
//! |-----------------|----------------------------------------------------------|-----------------------------------|
//! | **Routing**     | Board selection, concurrent dispatch, kill fan-out        | [`Router`], [`RouterBuilder`]     |
//! | **Runners**     | Simulation, local and remote execution back-ends          | [`Runner`], [`RunState`]          |
//! | **Boards**      | Board descriptors, wrappers and detection                 | [`Board`], [`BoardRegistry`]      |
//! | **Scripts**     | Script combination and traceback attribution              | [`CombinedScript`]                |
//! | **Events**      | Unified event stream with one subscriber per kind         | [`Event`], [`EventKind`], [`Subscribe`] |
//! | **Errors**      | Typed router and runner errors, run outcomes              | [`RouterError`], [`RunError`], [`RunOutcome`] |
//! | **Config**      | Router and per-runner settings                            | [`RouterConfig`]                  |
//!
//! ## Example
//! ```rust,no_run
//! use lightrun::{EventKind, FnSubscriber, Router, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::builder(RouterConfig::default())
//!         .with_subscriber(
//!             EventKind::FinishedRun,
//!             FnSubscriber::arc("print", |ev| {
//!                 println!("finished: {:?}", ev.message_or_empty());
//!             }),
//!         )
//!         .build();
//!
//!     router.change_board("Lightboard").await?;
//!     router.set_display_socket(1).await?;
//!     router.run("light.on(A1)").await?;
//!
//!     lightrun::wait_for_shutdown_signal().await?;
//!     router.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod boards;
mod core;
mod error;
pub mod events;
pub mod logging;
pub mod runners;
pub mod script;
pub mod subscribers;

// ---- Public re-exports ----

pub use boards::{Board, BoardRegistry, Detection, Geometry};
pub use crate::core::{
    CommandSpec, LocalConfig, RemoteConfig, Router, RouterBuilder, RouterConfig,
    SimulationConfig, wait_for_shutdown_signal,
};
pub use error::{RouterError, RunError, RunOutcome};
pub use events::{Bus, Event, EventKind, PowerupStatus};
pub use runners::{
    AnimationFrame, LocalRunner, PlugError, RemoteRunner, RunRequest, RunSlot, RunState, Runner,
    RunnerKind, SimulationRunner,
};
pub use script::CombinedScript;
pub use subscribers::{FnSubscriber, Subscribe, SubscriberSet};
