//! Glob file pattern matching tool

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use relay_agent::{Decision, Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::paths;

const DEFAULT_LIMIT: usize = 100;

/// Finds files by glob pattern, most recently modified first
pub struct GlobTool {
    cwd: PathBuf,
}

impl GlobTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern such as '**/*.rs' or 'src/*.ts'. \
         Results are sorted by modification time, newest first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search from (defaults to the working directory)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of results (default: 100)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn default_permission(&self) -> Option<Decision> {
        Some(Decision::Allow)
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        let Some(pattern) = arguments.get("pattern").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'pattern' argument");
        };
        let base = match arguments.get("path").and_then(Value::as_str) {
            Some(raw) => paths::resolve(&self.cwd, raw),
            None => self.cwd.clone(),
        };
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT);

        let full_pattern = base.join(pattern).to_string_lossy().to_string();
        let entries = match glob::glob(&full_pattern) {
            Ok(entries) => entries,
            Err(e) => return ToolResult::error(format!("Invalid glob pattern: {}", e)),
        };

        let mut matches: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                return ToolResult::error("Glob cancelled");
            }
            match entry {
                Ok(path) if path.is_file() => {
                    let skipped = path
                        .strip_prefix(&base)
                        .unwrap_or(&path)
                        .components()
                        .any(|c| paths::is_ignored_dir(&c.as_os_str().to_string_lossy()));
                    if skipped {
                        continue;
                    }
                    let modified = path
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    matches.push((modified, path));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping unreadable glob entry: {}", e),
            }
        }

        if matches.is_empty() {
            return ToolResult::text("No files matched the pattern");
        }

        matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let total = matches.len();
        let mut output = matches
            .iter()
            .take(limit)
            .map(|(_, path)| paths::display(&self.cwd, path))
            .collect::<Vec<_>>()
            .join("\n");
        if total > limit {
            output.push_str(&format!("\n\n(showing {} of {} files)", limit, total));
        }

        ToolResult::text(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_matches_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/bin")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/bin/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("target/gen.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        let tool = GlobTool::new(dir.path());

        let result = tool
            .execute("1", json!({"pattern": "**/*.rs"}), CancellationToken::new())
            .await;

        let text = result.text_content();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["src/bin/main.rs", "src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_limit_and_no_match() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let tool = GlobTool::new(dir.path());

        let limited = tool
            .execute("1", json!({"pattern": "*.txt", "limit": 2}), CancellationToken::new())
            .await;
        assert!(limited.text_content().contains("(showing 2 of 3 files)"));

        let none = tool
            .execute("2", json!({"pattern": "*.rs"}), CancellationToken::new())
            .await;
        assert_eq!(none.text_content(), "No files matched the pattern");
    }
}
