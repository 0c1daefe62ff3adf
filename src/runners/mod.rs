//! # Execution back-ends.
//!
//! A [`Runner`] executes the combined script on one transport:
//! - [`SimulationRunner`]: long-lived animation host driven over a line protocol
//! - [`LocalRunner`]: interpreter child process on this machine
//! - [`RemoteRunner`]: copy + `ssh` to the remote kit, guarded by a heartbeat
//!
//! Every runner shares the same [`RunState`] machine (held in a [`RunSlot`]) and
//! reports exactly one [`RunOutcome`](crate::RunOutcome) per run as an internal
//! `RunnerOutcome` event on the bus.

pub(crate) mod exec;
mod local;
mod process;
mod remote;
mod runner;
mod simulation;
mod state;

pub use local::LocalRunner;
pub use remote::RemoteRunner;
pub use runner::{RunRequest, Runner, RunnerKind};
pub use simulation::{AnimationFrame, FrameBuffer, PlugError, SimulationRunner};
pub use state::{RunSlot, RunState};
