//! # Script combination.
//!
//! The executable unit handed to every runner is `preamble + user_script + postamble`.
//! Two separators may be inserted so that the user's first and last lines never share
//! a line with wrapper code:
//! - a newline after a preamble that does not end with one,
//! - a newline before a non-empty postamble when the script does not end with one.
//!
//! Both separators belong to the wrapper regions, so stripping the wrappers always
//! recovers the user script byte-for-byte.

use std::io;
use std::path::Path;

use super::attribute_error;

/// Number of lines in `text` (a trailing newline does not open a new line).
pub fn count_lines(text: &str) -> usize {
    text.lines().count()
}

/// A user script wrapped in board preamble/postamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedScript {
    text: String,
    preamble_len: usize,
    postamble_len: usize,
    preamble_lines: usize,
    user_lines: usize,
}

impl CombinedScript {
    /// Wraps `script` between `preamble` and `postamble`.
    pub fn combine(preamble: &str, script: &str, postamble: &str) -> Self {
        let mut text = String::with_capacity(preamble.len() + script.len() + postamble.len() + 2);
        text.push_str(preamble);
        if !preamble.is_empty() && !preamble.ends_with('\n') {
            text.push('\n');
        }
        let preamble_len = text.len();
        let preamble_lines = count_lines(&text);

        text.push_str(script);
        let script_end = text.len();
        if !postamble.is_empty() && !script.is_empty() && !script.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(postamble);

        Self {
            postamble_len: text.len() - script_end,
            text,
            preamble_len,
            preamble_lines,
            user_lines: count_lines(script),
        }
    }

    /// Full executable text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The user's original script.
    pub fn user_script(&self) -> &str {
        &self.text[self.preamble_len..self.text.len() - self.postamble_len]
    }

    /// Lines occupied by the preamble (the attribution offset).
    pub fn preamble_lines(&self) -> usize {
        self.preamble_lines
    }

    /// Lines in the user's script.
    pub fn user_lines(&self) -> usize {
        self.user_lines
    }

    /// Formats captured error text relative to the user's script.
    ///
    /// See [`attribute_error`].
    pub fn attribute(&self, stderr: &str) -> Option<String> {
        attribute_error(stderr, self.preamble_lines, self.user_lines)
    }

    /// Writes the executable text to `path`, creating parent directories.
    pub async fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.text.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripping_wrappers_recovers_script() {
        let cases = [
            ("import os\n", "light.on(A1)\n", "\n# end\n"),
            ("import os", "light.on(A1)", "# end"),
            ("", "x = 1\ny = 2", ""),
            ("a\nb\n", "", "c\n"),
            ("p\n", "s\r\nt", "q"),
        ];
        for (pre, script, post) in cases {
            let c = CombinedScript::combine(pre, script, post);
            assert_eq!(c.user_script(), script, "pre={pre:?} post={post:?}");
            assert!(c.text().starts_with(pre));
            assert!(c.text().ends_with(post));
        }
    }

    #[test]
    fn offsets_count_lines() {
        let pre = "l1\nl2\nl3\n";
        let c = CombinedScript::combine(pre, "a\nb\n", "end\n");
        assert_eq!(c.preamble_lines(), 3);
        assert_eq!(c.user_lines(), 2);
        assert_eq!(c.text(), "l1\nl2\nl3\na\nb\nend\n");

        let c = CombinedScript::combine("l1\nl2", "a", "end");
        assert_eq!(c.preamble_lines(), 2);
        assert_eq!(c.text(), "l1\nl2\na\nend");
        assert_eq!(c.text().lines().nth(2), Some("a"));
    }

    #[test]
    fn attribution_uses_preamble_offset() {
        let pre = "l\n".repeat(10);
        let c = CombinedScript::combine(&pre, "a\nb\nc\n", "");
        let stderr = "File \"x.py\", line 12 ... NameError: x";
        assert_eq!(c.attribute(stderr).as_deref(), Some("Error on Line 2: NameError: x"));
        assert_eq!(c.attribute(""), None);
    }

    #[tokio::test]
    async fn writes_combined_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/powerup-code-all.py");
        let c = CombinedScript::combine("pre\n", "body\n", "post\n");
        c.write_to(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "pre\nbody\npost\n");
    }
}
