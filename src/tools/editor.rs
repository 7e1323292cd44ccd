//! Pure text-editing operations behind the editor tool.

use super::{ToolError, EDITOR_TOOL};

/// Result of a unique-match replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Replacement {
    NotFound,
    Ambiguous(usize),
    Replaced(String),
}

/// A path is treated as a directory if it ends in `/` or its last segment has no `.`.
pub(crate) fn looks_like_directory(path: &str) -> bool {
    if path.ends_with('/') {
        return true;
    }
    let last = path.rsplit('/').next().unwrap_or(path);
    !last.contains('.')
}

/// Lines `start..=end` (1-based); `end == -1` means through end of file.
pub(crate) fn view_range(content: &str, range: &[i64]) -> Result<String, ToolError> {
    let [start, end] = range else {
        return Err(ToolError::invalid_argument(
            EDITOR_TOOL,
            format!("view_range must have exactly 2 elements, got {}", range.len()),
        ));
    };

    let lines: Vec<&str> = content.lines().collect();
    let total = i64::try_from(lines.len()).unwrap_or(i64::MAX);

    let start = (*start).max(1);
    let end = if *end == -1 { total } else { (*end).min(total) };
    if start > end {
        return Ok(String::new());
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let selected = &lines[(start - 1) as usize..end as usize];
    Ok(selected.join("\n"))
}

/// Replaces `old` with `new` only if it occurs exactly once.
pub(crate) fn replace_unique(content: &str, old: &str, new: &str) -> Replacement {
    match content.matches(old).count() {
        0 => Replacement::NotFound,
        1 => Replacement::Replaced(content.replacen(old, new, 1)),
        n => Replacement::Ambiguous(n),
    }
}

/// Inserts `text` before line index `line` (0 inserts at the top).
pub(crate) fn insert_at(content: &str, line: i64, text: &str) -> String {
    let mut lines: Vec<&str> = content.split('\n').collect();
    let index = usize::try_from(line.max(0)).unwrap_or(usize::MAX).min(lines.len());
    lines.insert(index, text);
    lines.join("\n")
}
