//! Path helpers shared by the file tools

use std::path::{Path, PathBuf};

/// Resolve a user-supplied path: `~` expands to the home directory,
/// relative paths join `cwd`.
pub fn resolve(cwd: &Path, raw: &str) -> PathBuf {
    let expanded = if raw == "~" {
        dirs::home_dir()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir().map(|home| home.join(rest))
    } else {
        None
    };
    let path = expanded.unwrap_or_else(|| PathBuf::from(raw));
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

/// Display `path` relative to `base` when possible
pub fn display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Cut `line` to at most `max` characters without splitting one
pub fn truncate_chars(line: &str, max: usize) -> (&str, bool) {
    match line.char_indices().nth(max) {
        Some((idx, _)) => (&line[..idx], true),
        None => (line, false),
    }
}

/// Directories skipped by recursive walks
pub fn is_ignored_dir(name: &str) -> bool {
    matches!(name, ".git" | "node_modules" | "target")
}
