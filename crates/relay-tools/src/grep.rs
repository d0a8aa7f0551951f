//! Regex content search tool

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use relay_agent::{Decision, Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::paths;

const DEFAULT_LIMIT: usize = 50;
const MAX_LINE_LENGTH: usize = 500;

/// Searches file contents; matches print as `path:line: text`
pub struct GrepTool {
    cwd: PathBuf,
}

impl GrepTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }
}

struct Search {
    regex: Regex,
    root: PathBuf,
    cwd: PathBuf,
    glob: Option<String>,
    context: usize,
    limit: usize,
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines with paths and line numbers."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (defaults to the working directory)"
                },
                "glob": {
                    "type": "string",
                    "description": "Only search files matching this glob, e.g. '**/*.rs'"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Ignore case (default: false)"
                },
                "context": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Lines of context around each match (default: 0)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of matches (default: 50)"
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
        let regex = match RegexBuilder::new(pattern)
            .case_insensitive(
                arguments
                    .get("case_insensitive")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            )
            .build()
        {
            Ok(regex) => regex,
            Err(e) => return ToolResult::error(format!("Invalid regex: {}", e)),
        };

        let search = Search {
            regex,
            root: match arguments.get("path").and_then(Value::as_str) {
                Some(raw) => paths::resolve(&self.cwd, raw),
                None => self.cwd.clone(),
            },
            cwd: self.cwd.clone(),
            glob: arguments.get("glob").and_then(Value::as_str).map(String::from),
            context: arguments.get("context").and_then(Value::as_u64).unwrap_or(0) as usize,
            limit: arguments
                .get("limit")
                .and_then(Value::as_u64)
                .map(|l| l as usize)
                .unwrap_or(DEFAULT_LIMIT),
        };

        let walk_cancel = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || search.run(&walk_cancel)).await;
        if cancel.is_cancelled() {
            return ToolResult::error("Search cancelled");
        }
        match outcome {
            Ok(Ok((lines, hit_limit, limit))) if !lines.is_empty() => {
                let mut output = lines.join("\n");
                if hit_limit {
                    output.push_str(&format!("\n\n(showing first {} matches)", limit));
                }
                ToolResult::text(output)
            }
            Ok(Ok(_)) => ToolResult::text("No matches found"),
            Ok(Err(e)) => ToolResult::error(e),
            Err(e) => ToolResult::error(format!("Search failed: {}", e)),
        }
    }
}

impl Search {
    /// Returns output lines, whether the limit cut the search short, and the limit
    fn run(&self, cancel: &CancellationToken) -> Result<(Vec<String>, bool, usize), String> {
        let files = self.files()?;
        let mut output = Vec::new();
        let mut matches = 0;
        for file in files {
            if cancel.is_cancelled() || matches >= self.limit {
                break;
            }
            // Unreadable and binary files are skipped
            let Ok(lines) = read_lines(&file) else {
                continue;
            };
            let shown = paths::display(&self.cwd, &file);
            for (idx, line) in lines.iter().enumerate() {
                if !self.regex.is_match(line) {
                    continue;
                }
                if self.context > 0 {
                    let start = idx.saturating_sub(self.context);
                    let end = (idx + self.context + 1).min(lines.len());
                    for (i, text) in lines.iter().enumerate().take(end).skip(start) {
                        let marker = if i == idx { '>' } else { ':' };
                        output.push(format!("{}:{}{} {}", shown, i + 1, marker, clip(text)));
                    }
                    output.push("--".to_string());
                } else {
                    output.push(format!("{}:{}: {}", shown, idx + 1, clip(line)));
                }
                matches += 1;
                if matches >= self.limit {
                    break;
                }
            }
        }
        if output.last().is_some_and(|l| l == "--") {
            output.pop();
        }
        Ok((output, matches >= self.limit, self.limit))
    }

    fn files(&self) -> Result<Vec<PathBuf>, String> {
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }
        if !self.root.is_dir() {
            return Err(format!("Path does not exist: {}", self.root.display()));
        }
        let pattern = self
            .root
            .join(self.glob.as_deref().unwrap_or("**/*"))
            .to_string_lossy()
            .to_string();
        let entries = glob::glob(&pattern).map_err(|e| format!("Invalid glob: {}", e))?;
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .filter(|path| path.is_file())
            .filter(|path| {
                !path
                    .strip_prefix(&self.root)
                    .unwrap_or(path)
                    .components()
                    .any(|c| paths::is_ignored_dir(&c.as_os_str().to_string_lossy()))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    BufReader::new(File::open(path)?).lines().collect()
}

fn clip(line: &str) -> String {
    match paths::truncate_chars(line, MAX_LINE_LENGTH) {
        (shown, true) => format!("{}...", shown),
        (shown, false) => shown.to_string(),
    }
}
