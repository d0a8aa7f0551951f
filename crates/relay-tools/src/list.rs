//! Directory listing tool

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_agent::{Decision, Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::paths;

const DEFAULT_LIMIT: usize = 200;

pub struct ListTool {
    cwd: PathBuf,
}

impl ListTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }
}

struct Listing<'a> {
    base: &'a Path,
    show_hidden: bool,
    limit: usize,
    cancel: &'a CancellationToken,
    entries: Vec<String>,
}

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List a directory. Directories end with '/', files show their size."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (defaults to the working directory)"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Descend into subdirectories (default: false)"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Include dotfiles (default: false)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of entries (default: 200)"
                }
            }
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn default_permission(&self) -> Option<Decision> {
        Some(Decision::Allow)
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        let path = match arguments.get("path").and_then(Value::as_str) {
            Some(raw) => paths::resolve(&self.cwd, raw),
            None => self.cwd.clone(),
        };
        if !path.is_dir() {
            return ToolResult::error(format!("Not a directory: {}", path.display()));
        }
        let recursive = arguments
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut listing = Listing {
            base: &path,
            show_hidden: arguments
                .get("show_hidden")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            limit: arguments
                .get("limit")
                .and_then(Value::as_u64)
                .map(|l| l as usize)
                .unwrap_or(DEFAULT_LIMIT),
            cancel: &cancel,
            entries: Vec::new(),
        };
        if let Err(e) = listing.walk(&path, recursive) {
            return ToolResult::error(format!("Failed to list {}: {}", path.display(), e));
        }
        if cancel.is_cancelled() {
            return ToolResult::error("List cancelled");
        }
        if listing.entries.is_empty() {
            return ToolResult::text("(empty directory)");
        }

        let limit = listing.limit;
        let truncated = listing.entries.len() >= limit;
        let mut output = listing.entries.join("\n");
        if truncated {
            output.push_str(&format!("\n\n(showing first {} entries)", limit));
        }
        ToolResult::text(output)
    }
}

impl Listing<'_> {
    fn full(&self) -> bool {
        self.cancel.is_cancelled() || self.entries.len() >= self.limit
    }

    fn walk(&mut self, dir: &Path, recursive: bool) -> std::io::Result<()> {
        let mut items: Vec<_> = fs::read_dir(dir)?.flatten().collect();
        items.sort_by_key(|e| e.file_name());

        for entry in items {
            if self.full() {
                break;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !self.show_hidden && name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let is_dir = path.is_dir();
            if recursive && is_dir && paths::is_ignored_dir(&name) {
                continue;
            }

            let shown = paths::display(self.base, &path);
            let line = if is_dir {
                format!("{}/", shown)
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                format!("{}\t{}", shown, format_size(size))
            };
            self.entries.push(line);

            if recursive && is_dir {
                // Unreadable subdirectories are skipped
                let _ = self.walk(&path, true);
            }
        }
        Ok(())
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["K", "M", "G"];
    let mut size = bytes as f64;
    let mut unit = None;
    for u in UNITS {
        if size < 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = Some(u);
    }
    match unit {
        Some(u) => format!("{:.1}{}", size, u),
        None => format!("{}B", bytes),
    }
}
