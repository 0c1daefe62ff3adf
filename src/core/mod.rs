//! Router core: board selection, run dispatch and lifecycle.
//!
//! The public API from this module is [`Router`] (built through [`RouterBuilder`])
//! and its configuration types.
//!
//! Internal modules:
//! - [`router`]: owns the board and runners, translates runner outcomes into events;
//! - [`tracker`]: filters stale and duplicate runner events;
//! - [`builder`]: assembles a router with its registry and initial subscribers;
//! - [`shutdown`]: OS termination signal handling;
//! - [`config`]: router and per-runner settings.

mod builder;
mod config;
mod router;
mod shutdown;
mod tracker;

pub use builder::RouterBuilder;
pub use config::{CommandSpec, LocalConfig, RemoteConfig, RouterConfig, SimulationConfig};
pub use router::Router;
pub use shutdown::wait_for_shutdown_signal;
