//! Logical line model shared by reads, edits and digests.
//!
//! A file is split into logical lines with their terminators stripped; the
//! detected line-ending convention and the presence of a final newline are
//! remembered separately so that a render after editing reproduces the
//! original byte layout everywhere the edit did not touch.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    lines: Vec<String>,
    ending: LineEnding,
    trailing_newline: bool,
}

impl LineBuffer {
    /// Split `text` into logical lines. `\r\n` anywhere selects the CRLF
    /// convention for the whole file; a final newline is recorded but not
    /// represented as an empty trailing line.
    pub fn parse(text: &str) -> Self {
        let ending = if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };
        if text.is_empty() {
            return Self {
                lines: Vec::new(),
                ending,
                trailing_newline: false,
            };
        }
        let trailing_newline = text.ends_with('\n');
        let mut lines: Vec<String> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        if trailing_newline {
            // The final newline produced an empty trailing element.
            lines.pop();
        }
        Self {
            lines,
            ending,
            trailing_newline,
        }
    }

    /// Render back to text using the detected convention.
    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self.lines.join(self.ending.as_str());
        if self.trailing_newline {
            out.push_str(self.ending.as_str());
        }
        out
    }

    pub fn line_count(&self) -> u32 {
        self.lines.len() as u32
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn ending(&self) -> LineEnding {
        self.ending
    }

    pub fn has_trailing_newline(&self) -> bool {
        self.trailing_newline
    }

    pub fn set_trailing_newline(&mut self, trailing: bool) {
        self.trailing_newline = trailing;
    }

    /// 1-based inclusive range slice. `(0, 0)` designates the empty range of
    /// a zero-line file. Callers must pass an in-bounds range.
    pub fn range(&self, start: u32, end: u32) -> &[String] {
        if start == 0 || self.lines.is_empty() {
            return &[];
        }
        let start = (start as usize).saturating_sub(1);
        let end = (end as usize).min(self.lines.len());
        if start >= end {
            return &[];
        }
        &self.lines[start..end]
    }

    /// Replace lines `start..=end` (1-based) with `replacement`.
    pub fn replace(&mut self, start: u32, end: u32, replacement: Vec<String>) {
        if self.lines.is_empty() {
            self.lines = replacement;
            return;
        }
        let start = (start as usize).saturating_sub(1);
        let end = (end as usize).min(self.lines.len());
        self.lines.splice(start..end, replacement);
    }

    /// Remove lines `start..=end` (1-based).
    pub fn delete(&mut self, start: u32, end: u32) {
        self.replace(start, end, Vec::new());
    }

    /// Insert `inserted` after line `after` (1-based); `after == 0` inserts
    /// at the top of the file.
    pub fn insert_after(&mut self, after: u32, inserted: Vec<String>) {
        let at = (after as usize).min(self.lines.len());
        self.lines.splice(at..at, inserted);
    }

    /// Insert `inserted` before line `before` (1-based).
    pub fn insert_before(&mut self, before: u32, inserted: Vec<String>) {
        self.insert_after(before.saturating_sub(1), inserted);
    }
}

/// Split an edit payload into logical lines. A trailing `\n` on the payload
/// is an explicit request for a final newline and is reported separately so
/// last-line edits can honour it; it does not produce an empty line.
pub fn payload_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), false);
    }
    let wants_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect();
    if wants_trailing_newline {
        lines.pop();
    }
    (lines, wants_trailing_newline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_render_round_trips_lf() {
        for text in ["", "a", "a\n", "a\nb", "a\nb\n", "\n", "a\n\nb\n"] {
            assert_eq!(LineBuffer::parse(text).render(), text, "text {text:?}");
        }
    }

    #[test]
    fn parse_render_round_trips_crlf() {
        for text in ["a\r\nb", "a\r\nb\r\n", "\r\n"] {
            assert_eq!(LineBuffer::parse(text).render(), text, "text {text:?}");
        }
    }

    #[test]
    fn no_trailing_newline_is_detected() {
        let buf = LineBuffer::parse("Hello World");
        assert_eq!(buf.line_count(), 1);
        assert!(!buf.has_trailing_newline());
    }

    #[test]
    fn empty_file_has_zero_lines() {
        let buf = LineBuffer::parse("");
        assert_eq!(buf.line_count(), 0);
        assert_eq!(buf.range(0, 0), &[] as &[String]);
    }

    #[test]
    fn range_is_one_based_inclusive() {
        let buf = LineBuffer::parse("a\nb\nc\n");
        assert_eq!(buf.range(2, 3), &lines(&["b", "c"])[..]);
        assert_eq!(buf.range(1, 1), &lines(&["a"])[..]);
    }

    #[test]
    fn replace_splices_lines() {
        let mut buf = LineBuffer::parse("a\nb\nc\n");
        buf.replace(2, 2, lines(&["B1", "B2"]));
        assert_eq!(buf.render(), "a\nB1\nB2\nc\n");
    }

    #[test]
    fn delete_removes_inclusive_range() {
        let mut buf = LineBuffer::parse("a\nb\nc\nd\n");
        buf.delete(2, 3);
        assert_eq!(buf.render(), "a\nd\n");
    }

    #[test]
    fn insert_after_zero_prepends() {
        let mut buf = LineBuffer::parse("b\n");
        buf.insert_after(0, lines(&["a"]));
        assert_eq!(buf.render(), "a\nb\n");
    }

    #[test]
    fn insert_before_and_after() {
        let mut buf = LineBuffer::parse("a\nc\n");
        buf.insert_after(1, lines(&["b"]));
        assert_eq!(buf.render(), "a\nb\nc\n");
        buf.insert_before(1, lines(&["zero"]));
        assert_eq!(buf.render(), "zero\na\nb\nc\n");
    }

    #[test]
    fn crlf_convention_is_preserved_through_edits() {
        let mut buf = LineBuffer::parse("a\r\nb\r\n");
        buf.replace(2, 2, lines(&["B"]));
        assert_eq!(buf.render(), "a\r\nB\r\n");
    }

    #[test]
    fn payload_trailing_newline_is_reported() {
        assert_eq!(payload_lines("x\ny\n"), (lines(&["x", "y"]), true));
        assert_eq!(payload_lines("x\ny"), (lines(&["x", "y"]), false));
        assert_eq!(payload_lines(""), (Vec::new(), false));
    }
}
