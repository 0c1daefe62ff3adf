//! # Board registry.
//!
//! Static name → [`Board`] table consulted by `Router::change_board`.
//!
//! Script wrappers can be loaded from a content directory laid out as:
//! ```text
//! <dir>/base_preamble.py
//! <dir>/base_postamble.py
//! <dir>/<board_dir>/preamble.py      (board_dir = lowercase name, spaces → '_')
//! <dir>/<board_dir>/postamble.py
//! ```
//! The effective preamble is `base_preamble + preamble`, the effective postamble is
//! `postamble + base_postamble`. Missing files contribute nothing.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::board::{Board, Detection, Geometry};
use crate::error::RouterError;

/// Name of the rectangular matrix board.
pub const LIGHTBOARD: &str = "Lightboard";
/// Name of the circular speaker board.
pub const LED_SPEAKER: &str = "LED Speaker";

/// Registry of supported boards.
#[derive(Debug, Clone, Default)]
pub struct BoardRegistry {
    boards: BTreeMap<String, Arc<Board>>,
}

impl BoardRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the two boards shipped with the kit.
    ///
    /// - `Lightboard`: 9×14 grid, assumed present once plugged in at start
    /// - `LED Speaker`: ring of 10, present iff `/dev/ttyACM0` exists
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(Board::new(
            LIGHTBOARD,
            Geometry::Grid {
                width: 9,
                height: 14,
            },
        ));
        reg.register(
            Board::new(LED_SPEAKER, Geometry::Ring { leds: 10 })
                .with_detection(Detection::DevicePath(PathBuf::from("/dev/ttyACM0"))),
        );
        reg
    }

    /// Adds or replaces a board.
    pub fn register(&mut self, board: Board) {
        self.boards.insert(board.name().to_string(), Arc::new(board));
    }

    /// Looks up a board by name.
    pub fn get(&self, name: &str) -> Result<Arc<Board>, RouterError> {
        self.boards
            .get(name)
            .cloned()
            .ok_or_else(|| RouterError::UnsupportedBoard {
                name: name.to_string(),
            })
    }

    /// Returns `true` if a board with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.boards.contains_key(name)
    }

    /// Sorted list of registered board names.
    pub fn names(&self) -> Vec<String> {
        self.boards.keys().cloned().collect()
    }

    /// Replaces every board's wrappers with the ones found under `dir`.
    pub fn load_wrappers(&mut self, dir: &Path) -> Result<(), RouterError> {
        let base_pre = read_optional(&dir.join("base_preamble.py"))?;
        let base_post = read_optional(&dir.join("base_postamble.py"))?;

        for board in self.boards.values_mut() {
            let board_dir = dir.join(board_dir_name(board.name()));
            let pre = read_optional(&board_dir.join("preamble.py"))?;
            let post = read_optional(&board_dir.join("postamble.py"))?;
            debug!(
                board = board.name(),
                dir = %board_dir.display(),
                "loaded script wrappers"
            );

            let updated = (**board)
                .clone()
                .with_preamble(format!("{base_pre}{pre}"))
                .with_postamble(format!("{post}{base_post}"));
            *board = Arc::new(updated);
        }
        Ok(())
    }
}

/// Directory name holding a board's wrapper files.
pub fn board_dir_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

fn read_optional(path: &Path) -> Result<String, RouterError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(RouterError::Io(e)),
    }
}
