//! # Recorded animation frames.
//!
//! The animation host reports every rendered board state as a `FRAME <json>` line.
//! [`FrameBuffer`] keeps the most recent ones for export:
//!
//! ```text
//! push(f151) with capacity 150:  [f1 f2 ... f150] ──► [f2 ... f150 f151]
//! ```
//!
//! Export trims dark padding: a run of dark frames at either end collapses to a
//! single dark frame.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::protocol::PlugError;

/// One LED colour.
pub type Rgb = [u8; 3];

/// One rendered board state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationFrame {
    /// Colour of every LED, in board order.
    pub leds: Vec<Rgb>,
}

impl AnimationFrame {
    pub fn new(leds: Vec<Rgb>) -> Self {
        Self { leds }
    }

    /// All LEDs off.
    pub fn is_dark(&self) -> bool {
        self.leds.iter().all(|px| *px == [0, 0, 0])
    }
}

/// Bounded buffer of the frames of the current run.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frames: VecDeque<AnimationFrame>,
    capacity: usize,
}

impl FrameBuffer {
    /// Creates a buffer holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a frame, dropping the oldest one when full. Returns `true` if a frame was dropped.
    pub fn push(&mut self, frame: AnimationFrame) -> bool {
        let dropped = if self.frames.len() == self.capacity {
            self.frames.pop_front();
            true
        } else {
            false
        };
        self.frames.push_back(frame);
        dropped
    }

    /// Forgets every frame (a new run starts).
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered frames, oldest first.
    pub fn frames(&self) -> Vec<AnimationFrame> {
        self.frames.iter().cloned().collect()
    }

    /// Buffered frames with dark padding collapsed.
    pub fn trimmed(&self) -> Vec<AnimationFrame> {
        let mut frames = self.frames();
        if frames.len() < 3 {
            return frames;
        }

        if frames[0].is_dark() {
            if let Some(dark_run) = frames.iter().skip(1).position(|f| !f.is_dark()) {
                // Keep frames[0] as the single leading dark frame.
                frames.drain(1..dark_run + 1);
            }
        }

        let last = frames.len() - 1;
        if last >= 2 && frames[last].is_dark() {
            if let Some(last_lit) = (1..last).rev().find(|&i| !frames[i].is_dark()) {
                frames.drain(last_lit + 1..last);
            }
        }
        frames
    }

    /// Frames ready for export, or the "nothing to save" error.
    pub fn export(&self) -> Result<Vec<AnimationFrame>, PlugError> {
        if self.frames.is_empty() {
            return Err(PlugError::no_frames());
        }
        Ok(self.trimmed())
    }
}
