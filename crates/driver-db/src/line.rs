//! Line classification
//!
//! Strips comments and line terminators and measures the depth of a line.

/// A non-blank database line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// Number of leading tabs
    pub depth: usize,
    /// Line content after the leading whitespace
    pub body: &'a str,
}

/// Classify a raw line.
///
/// Returns `None` for empty, comment-only and whitespace-only lines.
/// Spaces between the leading tabs are skipped, not counted.
pub fn classify(raw: &str) -> Option<Line<'_>> {
    let end = raw.find(['#', '\r', '\n']).unwrap_or(raw.len());
    let content = &raw[..end];

    let mut depth = 0;
    let mut start = content.len();
    for (i, c) in content.char_indices() {
        match c {
            '\t' => depth += 1,
            ' ' => {}
            _ => {
                start = i;
                break;
            }
        }
    }

    let body = content[start..].trim_end();
    if body.is_empty() {
        return None;
    }
    Some(Line { depth, body })
}
