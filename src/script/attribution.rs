//! # Error attribution.
//!
//! Scripts run with the board preamble prepended, so tracebacks report line numbers
//! of the compiled file. The user's line is `compiled_line - preamble_lines`.
//! When that line falls outside the user's script (the failure happened in wrapper
//! code, typically a syntax error reported at the end of the file) only a generic
//! message is produced.
//!
//! ```text
//! Traceback (most recent call last):
//!   File "/tmp/make-light/powerup-code-all.py", line 12, in <module>
//!     foo()
//! NameError: name 'foo' is not defined
//!
//! preamble_lines = 10  ──►  "Error on Line 2: NameError: name 'foo' is not defined"
//! ```

use std::sync::LazyLock;

use regex::Regex;

static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "(?P<path>[^"]+)", line (?P<line>\d+)"#).expect("valid regex")
});

static EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<error>\b[A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Warning)\b.*)$")
        .expect("valid regex")
});

/// The innermost frame and final message of a traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceback {
    /// File named by the innermost frame.
    pub path: String,
    /// Compiled line number of the innermost frame.
    pub line: usize,
    /// Final exception line.
    pub message: String,
}

/// Extracts the innermost `File "<path>", line <n>` frame and the exception message.
pub fn parse_traceback(text: &str) -> Option<Traceback> {
    let caps = FILE_LINE.captures_iter(text).last()?;
    let line: usize = caps["line"].parse().ok()?;
    let path = caps["path"].to_string();
    let frame_end = caps.get(0).map_or(0, |m| m.end());

    let tail = &text[frame_end..];
    let rest_of_frame = tail.lines().next().unwrap_or_default().trim();
    let last = tail
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();

    let message = if last == rest_of_frame {
        // Nothing follows the frame line; the message, if any, shares it.
        match EXCEPTION.captures(last) {
            Some(c) => c["error"].trim().to_string(),
            None => last
                .trim_start_matches(|c: char| c == ',' || c == '.' || c.is_whitespace())
                .to_string(),
        }
    } else {
        last.to_string()
    };

    Some(Traceback {
        path,
        line,
        message,
    })
}

/// Formats captured error text for the user.
///
/// Returns `None` for blank input (a successful run).
pub fn attribute_error(text: &str, preamble_lines: usize, user_lines: usize) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    let Some(tb) = parse_traceback(text) else {
        let last = text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default();
        return Some(format!("Error: {last}"));
    };

    let message = tb.message;
    match tb.line.checked_sub(preamble_lines) {
        Some(n) if n >= 1 && n <= user_lines => Some(format!("Error on Line {n}: {message}")),
        _ => Some(format!("Error: {message}")),
    }
}

/// Decodes a backslash-escaped single-line error text.
///
/// The animation host escapes newlines, tabs, quotes, backslashes and
/// non-printable bytes (`\xhh`) so the whole traceback fits on one FIFO line.
pub fn unescape_error_line(line: &str) -> String {
    let line = line.trim_end_matches(['\n', '\r']);
    // `\xhh` escapes are single bytes of a UTF-8 sequence; decode at the end.
    let mut out: Vec<u8> = Vec::with_capacity(line.len());
    let mut chars = line.chars();
    let mut buf = [0u8; 4];

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('\\') => out.push(b'\\'),
            Some('\'') => out.push(b'\''),
            Some('"') => out.push(b'"'),
            Some('x') => {
                let hex: String = (0..2).filter_map(|_| chars.next()).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(b) => out.push(b),
                    Err(_) => {
                        out.extend_from_slice(b"\\x");
                        out.extend_from_slice(hex.as_bytes());
                    }
                }
            }
            Some(other) => {
                out.push(b'\\');
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEBACK: &str = "Traceback (most recent call last):\n  \
        File \"/tmp/make-light/powerup-code-all.py\", line 12, in <module>\n    \
        foo()\nNameError: name 'foo' is not defined\n";

    #[test]
    fn subtracts_preamble_lines() {
        let msg = attribute_error(TRACEBACK, 10, 5).unwrap();
        assert_eq!(msg, "Error on Line 2: NameError: name 'foo' is not defined");
    }

    #[test]
    fn single_line_capture() {
        let msg = attribute_error("File \"x.py\", line 12 ... NameError: x", 10, 3).unwrap();
        assert_eq!(msg, "Error on Line 2: NameError: x");
    }

    #[test]
    fn line_beyond_user_code_is_generic() {
        let msg = attribute_error(TRACEBACK, 10, 1).unwrap();
        assert_eq!(msg, "Error: NameError: name 'foo' is not defined");
    }

    #[test]
    fn line_inside_preamble_is_generic() {
        let msg = attribute_error(TRACEBACK, 12, 4).unwrap();
        assert!(msg.starts_with("Error: "));
    }

    #[test]
    fn syntax_error_uses_last_line() {
        let text = "  File \"a.py\", line 7\n    light.on(\n            ^\nSyntaxError: invalid syntax\n";
        let tb = parse_traceback(text).unwrap();
        assert_eq!(tb.line, 7);
        assert_eq!(tb.path, "a.py");
        assert_eq!(tb.message, "SyntaxError: invalid syntax");
        assert_eq!(
            attribute_error(text, 4, 10).unwrap(),
            "Error on Line 3: SyntaxError: invalid syntax"
        );
    }

    #[test]
    fn innermost_frame_wins() {
        let text = "File \"a.py\", line 20, in <module>\n  f()\nFile \"a.py\", line 15, in f\n  g()\nValueError: bad\n";
        assert_eq!(parse_traceback(text).unwrap().line, 15);
    }

    #[test]
    fn blank_and_unmatched_text() {
        assert_eq!(attribute_error("  \n", 3, 3), None);
        assert_eq!(
            attribute_error("Segmentation fault\n", 3, 3).as_deref(),
            Some("Error: Segmentation fault")
        );
    }

    #[test]
    fn unescape_roundtrips_python_escapes() {
        let line = r"Traceback:\n  File \'x.py\', line 3\n\tNameError: x\x21\\";
        assert_eq!(
            unescape_error_line(line),
            "Traceback:\n  File 'x.py', line 3\n\tNameError: x!\\"
        );
        assert_eq!(unescape_error_line("plain\n"), "plain");
    }

    #[test]
    fn unescape_decodes_multibyte_characters() {
        assert_eq!(
            unescape_error_line(r"NameError: name '\xc3\xa9' is not defined"),
            "NameError: name 'é' is not defined"
        );
        assert_eq!(unescape_error_line(r"café \xe2\x9c\x93"), "café ✓");
        assert_eq!(unescape_error_line(r"bad \xff"), "bad \u{fffd}");
    }
}
