//! File writing tool

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_agent::{Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::paths;

/// Creates or overwrites a file. Asks unless the session auto-accepts writes.
pub struct WriteTool {
    cwd: PathBuf,
}

impl WriteTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a file, replacing any existing content. Parent directories are created as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to write (relative to the working directory or absolute)"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        let Some(raw) = arguments.get("path").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'path' argument");
        };
        let Some(content) = arguments.get("content").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'content' argument");
        };
        if raw == "~" {
            return ToolResult::error("Cannot write to the home directory itself");
        }
        let path = paths::resolve(&self.cwd, raw);

        if cancel.is_cancelled() {
            return ToolResult::error("Write cancelled");
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create {}: {}", parent.display(), e));
            }
        }

        let existed = fs::try_exists(&path).await.unwrap_or(false);
        match fs::write(&path, content).await {
            Ok(()) => {
                let verb = if existed { "Overwrote" } else { "Created" };
                ToolResult::text(format!("{} {} ({} bytes)", verb, raw, content.len())).with_details(
                    json!({
                        "path": path.display().to_string(),
                        "bytes": content.len(),
                        "created": !existed,
                    }),
                )
            }
            Err(e) => ToolResult::error(format!("Failed to write {}: {}", raw, e)),
        }
    }
}
