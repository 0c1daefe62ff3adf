//! # Animation host line protocol.
//!
//! Newline-terminated UTF-8 over the host's stdin/stdout.
//!
//! ```text
//! parent ──► host (stdin)          host ──► parent (stdout)
//!   START-ANIMATION                  LOADING-COMPLETE
//!   SAVE-ANIMATION                   ANIMATION-FINISHED
//!   QUIT-ANIMATION                   ANIMATION-SAVED
//!                                    SCRIPT-ENCOUNTERED-ERROR   (text follows on the pipe)
//!                                    {"title":..,"description":..,"error_code":..}
//!                                    FRAME {"leds":[[r,g,b],..]}
//! ```
//! Anything else on stdout is debug chatter and ignored.

use serde::{Deserialize, Serialize};

use super::frames::AnimationFrame;

/// Commands sent to the animation host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Save,
    Quit,
}

impl Command {
    /// Wire form, newline included.
    pub fn line(self) -> &'static [u8] {
        match self {
            Command::Start => b"START-ANIMATION\n",
            Command::Save => b"SAVE-ANIMATION\n",
            Command::Quit => b"QUIT-ANIMATION\n",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "START-ANIMATION",
            Command::Save => "SAVE-ANIMATION",
            Command::Quit => "QUIT-ANIMATION",
        }
    }
}

/// Structured error reported by the animation host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugError {
    /// Dialog title.
    pub title: String,
    /// Dialog body.
    pub description: String,
    /// `0` for warnings; anything else is fatal to the application.
    #[serde(default)]
    pub error_code: i32,
}

impl PlugError {
    /// Saving was requested before anything was rendered.
    pub fn no_frames() -> Self {
        Self {
            title: "Nothing to save!".to_string(),
            description: "If you would like to save your animation, first click MAKE to see\n it in the Simulator.".to_string(),
            error_code: 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.error_code != 0
    }
}

/// One line received from the animation host.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    LoadingComplete,
    AnimationFinished,
    AnimationSaved,
    ScriptError,
    Frame(AnimationFrame),
    PlugError(PlugError),
    Other(String),
}

impl Reply {
    pub fn parse(line: &str) -> Reply {
        let line = line.trim_end_matches(['\n', '\r']);
        match line {
            "LOADING-COMPLETE" => Reply::LoadingComplete,
            "ANIMATION-FINISHED" => Reply::AnimationFinished,
            "ANIMATION-SAVED" => Reply::AnimationSaved,
            "SCRIPT-ENCOUNTERED-ERROR" => Reply::ScriptError,
            _ => {
                if let Some(json) = line.strip_prefix("FRAME ") {
                    if let Ok(frame) = serde_json::from_str(json) {
                        return Reply::Frame(frame);
                    }
                } else if line.trim_start().starts_with('{') {
                    if let Ok(err) = serde_json::from_str(line) {
                        return Reply::PlugError(err);
                    }
                }
                Reply::Other(line.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_tokens() {
        assert_eq!(Reply::parse("LOADING-COMPLETE\n"), Reply::LoadingComplete);
        assert_eq!(Reply::parse("ANIMATION-FINISHED"), Reply::AnimationFinished);
        assert_eq!(Reply::parse("ANIMATION-SAVED\r\n"), Reply::AnimationSaved);
        assert_eq!(Reply::parse("SCRIPT-ENCOUNTERED-ERROR"), Reply::ScriptError);
        assert_eq!(Command::Start.line(), b"START-ANIMATION\n");
    }

    #[test]
    fn structured_error_line() {
        let reply = Reply::parse(r#"{"title": "Nothing to save!", "description": "d", "error_code": 0}"#);
        match reply {
            Reply::PlugError(e) => {
                assert_eq!(e.title, "Nothing to save!");
                assert!(!e.is_fatal());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frames_and_chatter() {
        assert_eq!(
            Reply::parse(r#"FRAME {"leds":[[255,0,0]]}"#),
            Reply::Frame(AnimationFrame::new(vec![[255, 0, 0]]))
        );
        assert_eq!(Reply::parse("{not json"), Reply::Other("{not json".into()));
        assert_eq!(Reply::parse("FRAME garbage"), Reply::Other("FRAME garbage".into()));
        assert_eq!(Reply::parse("debug: mapped"), Reply::Other("debug: mapped".into()));
    }
}
