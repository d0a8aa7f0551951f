//! File reading tool

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_agent::{Decision, Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::paths;

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

/// Reads a text file as numbered lines
pub struct ReadTool {
    cwd: PathBuf,
}

impl ReadTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file. Lines are numbered from 1. For large files, page with offset and limit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to read (relative to the working directory or absolute)"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "First line to return (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn default_permission(&self) -> Option<Decision> {
        Some(Decision::Allow)
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        let Some(raw) = arguments.get("path").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'path' argument");
        };
        let path = paths::resolve(&self.cwd, raw);

        if cancel.is_cancelled() {
            return ToolResult::error("Read cancelled");
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", raw, e)),
        };
        if content.is_empty() {
            return ToolResult::text(format!("{} is empty", raw));
        }

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let offset = arguments
            .get("offset")
            .and_then(Value::as_u64)
            .map(|o| (o as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(MAX_LINES);

        if offset >= total {
            return ToolResult::error(format!(
                "Offset {} is past the end of {} ({} lines)",
                offset + 1,
                raw,
                total
            ));
        }

        let end = offset.saturating_add(limit).min(total);
        let mut truncated_lines = 0;
        let mut output = String::new();
        for (i, line) in lines[offset..end].iter().enumerate() {
            let (shown, cut) = paths::truncate_chars(line, MAX_LINE_LENGTH);
            if cut {
                truncated_lines += 1;
            }
            output.push_str(&format!("{:>6}\t{}\n", offset + i + 1, shown));
        }

        let mut notes = Vec::new();
        if truncated_lines > 0 {
            notes.push(format!(
                "{} lines cut at {} characters",
                truncated_lines, MAX_LINE_LENGTH
            ));
        }
        if end < total {
            notes.push(format!(
                "{} more lines, continue with offset={}",
                total - end,
                end + 1
            ));
        }
        if !notes.is_empty() {
            output.push_str(&format!("\n({})", notes.join("; ")));
        }

        ToolResult::text(output.trim_end()).with_details(json!({
            "path": path.display().to_string(),
            "lines": end - offset,
            "total_lines": total,
        }))
    }
}
