//! Exact-text replacement tool

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_agent::{Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use similar::TextDiff;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::paths;

const MAX_DIFF_LINES: usize = 60;

/// Replaces one exact occurrence of `old_text`, or all of them with
/// `replace_all`
pub struct EditTool {
    cwd: PathBuf,
}

impl EditTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing exact text. old_text must match exactly, whitespace included, \
         and must be unique unless replace_all is set."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to edit (relative to the working directory or absolute)"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default: false)"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Edit
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        let (Some(raw), Some(old_text), Some(new_text)) = (
            arguments.get("path").and_then(Value::as_str),
            arguments.get("old_text").and_then(Value::as_str),
            arguments.get("new_text").and_then(Value::as_str),
        ) else {
            return ToolResult::error("Arguments 'path', 'old_text' and 'new_text' are required");
        };
        let replace_all = arguments
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if old_text.is_empty() {
            return ToolResult::error("old_text must not be empty");
        }
        if old_text == new_text {
            return ToolResult::error("old_text and new_text are identical");
        }
        let path = paths::resolve(&self.cwd, raw);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", raw, e)),
        };

        let occurrences = content.matches(old_text).count();
        let updated = match occurrences {
            0 => {
                return ToolResult::error(format!(
                    "old_text not found in {}. It must match exactly, including whitespace and newlines.",
                    raw
                ));
            }
            1 => content.replacen(old_text, new_text, 1),
            n if replace_all => {
                tracing::debug!("Replacing {} occurrences in {}", n, raw);
                content.replace(old_text, new_text)
            }
            n => {
                return ToolResult::error(format!(
                    "old_text occurs {} times in {}. Add surrounding context to make it unique, or set replace_all.",
                    n, raw
                ));
            }
        };

        if cancel.is_cancelled() {
            return ToolResult::error("Edit cancelled");
        }

        if let Err(e) = fs::write(&path, &updated).await {
            return ToolResult::error(format!("Failed to write {}: {}", raw, e));
        }

        let diff = unified_diff(raw, &content, &updated);
        ToolResult::text(format!(
            "Edited {} ({} replacement{})\n\n{}",
            raw,
            occurrences,
            if occurrences == 1 { "" } else { "s" },
            diff
        ))
        .with_details(json!({ "diff": diff }))
    }
}

/// Unified diff of the change, capped to keep results small
fn unified_diff(name: &str, old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let text = diff
        .unified_diff()
        .context_radius(2)
        .header(name, name)
        .to_string();
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= MAX_DIFF_LINES {
        return text;
    }
    let mut capped = lines[..MAX_DIFF_LINES].join("\n");
    capped.push_str(&format!("\n... ({} more diff lines)", lines.len() - MAX_DIFF_LINES));
    capped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(content: &str) -> (tempfile::TempDir, EditTool) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), content).unwrap();
        let tool = EditTool::new(dir.path());
        (dir, tool)
    }

    #[tokio::test]
    async fn test_replaces_unique_text_and_reports_diff() {
        let (dir, tool) = setup("fn main() {\n    old();\n}\n");
        let result = tool
            .execute(
                "1",
                json!({"path": "lib.rs", "old_text": "old()", "new_text": "new()"}),
                CancellationToken::new(),
            )
            .await;

        assert!(!result.is_error, "{}", result.text_content());
        assert!(result.text_content().contains("+    new();"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn main() {\n    new();\n}\n"
        );
    }

    #[tokio::test]
    async fn test_ambiguous_text_needs_replace_all() {
        let (dir, tool) = setup("a\na\n");
        let args = json!({"path": "lib.rs", "old_text": "a", "new_text": "b"});

        let ambiguous = tool.execute("1", args.clone(), CancellationToken::new()).await;
        assert!(ambiguous.is_error);
        assert!(ambiguous.text_content().contains("occurs 2 times"));

        let mut all = args;
        all["replace_all"] = json!(true);
        let result = tool.execute("2", all, CancellationToken::new()).await;
        assert!(!result.is_error);
        assert_eq!(std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "b\nb\n");
    }

    #[tokio::test]
    async fn test_missing_text_leaves_file_alone() {
        let (dir, tool) = setup("keep\n");
        let result = tool
            .execute(
                "1",
                json!({"path": "lib.rs", "old_text": "gone", "new_text": "x"}),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert_eq!(std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "keep\n");
    }
}
