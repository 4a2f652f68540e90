//! Source locations for diagnostics and evaluation errors

use serde::{Deserialize, Serialize};

/// A region of a policy source, tracked through parsing, compilation, and
/// evaluation so that errors can point back at the offending text.
///
/// Offsets are byte offsets into the UTF-8 source; lines and columns are
/// 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub start_offset: usize,
    pub end_offset: usize,
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl SourceLocation {
    /// Compute a location from byte offsets into the given source.
    pub fn from_offsets(file: Option<&str>, source: &str, start: usize, end: usize) -> Self {
        let (start_line, start_col) = line_col(source, start);
        let (end_line, end_col) = line_col(source, end);
        Self {
            file: file.map(|f| f.to_string()),
            start_offset: start,
            end_offset: end,
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// Render a plain-text excerpt of the offending line with a caret
    /// underline, suitable for terminal output.
    pub fn caret_snippet(&self, source: &str) -> String {
        let line = source.lines().nth(self.start_line.saturating_sub(1)).unwrap_or("");
        let width = if self.end_line == self.start_line {
            (self.end_col.saturating_sub(self.start_col)).max(1)
        } else {
            line.chars().count().saturating_sub(self.start_col - 1).max(1)
        };
        let mut out = String::new();
        out.push_str(line);
        out.push('\n');
        out.push_str(&" ".repeat(self.start_col.saturating_sub(1)));
        out.push_str(&"^".repeat(width));
        out
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file, self.start_line, self.start_col),
            None => write!(f, "{}:{}", self.start_line, self.start_col),
        }
    }
}

/// 1-based line/column of a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(source.len());
    let mut line = 1;
    let mut col = 1;
    for (i, c) in source.char_indices() {
        if i >= clamped {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
