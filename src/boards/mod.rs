//! # Board descriptors and the board registry.
//!
//! - [`Board`] immutable descriptor: name, geometry, script wrappers, hardware detection
//! - [`Geometry`] ring or grid layout with an LED count
//! - [`Detection`] how a local runner decides the physical board is attached
//! - [`BoardRegistry`] name → board lookup used by `Router::change_board`

mod board;
mod registry;

pub use board::{Board, DETECTION_TIMEOUT, Detection, Geometry};
pub use registry::{BoardRegistry, LED_SPEAKER, LIGHTBOARD, board_dir_name};
