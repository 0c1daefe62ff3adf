//! # Board descriptor.
//!
//! A [`Board`] is selected once per run configuration and owned by the router.
//! Runners only ever see it behind an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::runners::exec::run_checked;

/// Upper bound for a detection command; a detector that hangs means "absent".
pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Physical layout of the LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    /// Circular board (LED Speaker): `leds` evenly spaced on one ring.
    Ring {
        /// Number of LEDs on the ring.
        leds: u16,
    },
    /// Rectangular matrix (Lightboard).
    Grid {
        /// LEDs per row.
        width: u16,
        /// LEDs per column.
        height: u16,
    },
}

impl Geometry {
    /// Total number of LEDs.
    pub fn led_count(&self) -> usize {
        match *self {
            Geometry::Ring { leds } => usize::from(leds),
            Geometry::Grid { width, height } => usize::from(width) * usize::from(height),
        }
    }
}

/// How to tell whether the physical board is attached to this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Assume the board is present.
    Assume,
    /// Present iff the device node exists.
    DevicePath(PathBuf),
    /// Present iff the command exits with status 0.
    Command {
        /// Program to execute.
        program: String,
        /// Arguments.
        args: Vec<String>,
    },
}

impl Detection {
    /// Evaluates the detection rule.
    pub async fn probe(&self) -> bool {
        self.probe_within(DETECTION_TIMEOUT).await
    }

    /// Evaluates the detection rule, giving a detection command at most `timeout`.
    pub async fn probe_within(&self, timeout: Duration) -> bool {
        match self {
            Detection::Assume => true,
            Detection::DevicePath(path) => tokio::fs::metadata(path).await.is_ok(),
            Detection::Command { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                match run_checked(&mut cmd, "board detection", Some(timeout)).await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(program, error = %e.as_message(), "board not detected");
                        false
                    }
                }
            }
        }
    }
}

/// Immutable board descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    name: String,
    geometry: Geometry,
    preamble: String,
    postamble: String,
    detection: Detection,
}

impl Board {
    /// Creates a board with empty wrappers that is assumed to be present.
    pub fn new(name: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            name: name.into(),
            geometry,
            preamble: String::new(),
            postamble: String::new(),
            detection: Detection::Assume,
        }
    }

    /// Returns a new board with the given preamble.
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    /// Returns a new board with the given postamble.
    pub fn with_postamble(mut self, postamble: impl Into<String>) -> Self {
        self.postamble = postamble.into();
        self
    }

    /// Returns a new board with the given detection rule.
    pub fn with_detection(mut self, detection: Detection) -> Self {
        self.detection = detection;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn led_count(&self) -> usize {
        self.geometry.led_count()
    }

    /// Script text prepended to user code.
    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    /// Script text appended to user code.
    pub fn postamble(&self) -> &str {
        &self.postamble
    }

    pub fn detection(&self) -> &Detection {
        &self.detection
    }

    /// Whether the physical board is attached locally.
    pub async fn detect(&self) -> bool {
        self.detection.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_counts() {
        assert_eq!(Geometry::Ring { leds: 10 }.led_count(), 10);
        assert_eq!(Geometry::Grid { width: 9, height: 14 }.led_count(), 126);
    }

    #[tokio::test]
    async fn detection_rules() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("ttyACM0");
        std::fs::write(&present, b"").unwrap();

        assert!(Detection::Assume.probe().await);
        assert!(Detection::DevicePath(present).probe().await);
        assert!(!Detection::DevicePath(dir.path().join("missing")).probe().await);
        assert!(
            Detection::Command { program: "true".into(), args: vec![] }
                .probe()
                .await
        );
        assert!(
            !Detection::Command { program: "false".into(), args: vec![] }
                .probe()
                .await
        );
        assert!(
            !Detection::Command { program: "/nonexistent/detector".into(), args: vec![] }
                .probe()
                .await
        );
    }

    #[tokio::test]
    async fn hanging_detector_counts_as_absent() {
        let started = std::time::Instant::now();
        let detection = Detection::Command { program: "sleep".into(), args: vec!["30".into()] };
        assert!(!detection.probe_within(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
