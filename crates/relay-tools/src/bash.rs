//! Shell command tool

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use relay_agent::{Decision, ProgressSender, Tool, ToolCategory, ToolResult};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_TIMEOUT_SECS: u64 = 600;
const MAX_OUTPUT_BYTES: usize = 100_000;
const MAX_OUTPUT_LINES: usize = 1000;

/// Runs a command with `sh -c` in the working directory. Asks by default;
/// session approvals and `bash(prefix:*)` rules are matched on the command.
pub struct BashTool {
    cwd: PathBuf,
}

impl BashTool {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }

    async fn run(&self, arguments: &Value, cancel: CancellationToken, progress: Option<ProgressSender>) -> ToolResult {
        let Some(command) = arguments.get("command").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'command' argument");
        };
        let timeout_secs = arguments
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let (shell, flag) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        let mut child = match Command::new(shell)
            .arg(flag)
            .arg(command)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolResult::error(format!("Failed to spawn command: {}", e)),
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ToolResult::error("Failed to capture command output");
        };
        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');

        let mut out = Capture::default();
        let mut err = Capture::default();
        let (mut stdout_open, mut stderr_open) = (true, true);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return ToolResult::error("Command cancelled");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return ToolResult::error(format!(
                        "{}\n\nCommand timed out after {} seconds",
                        combine(&out, &err),
                        timeout_secs
                    ));
                }
                line = stdout.next_segment(), if stdout_open => match line {
                    Ok(Some(bytes)) => {
                        let line = decode_line(&bytes);
                        if let Some(progress) = &progress {
                            progress.send(line.clone());
                        }
                        out.push(line);
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        err.push(format!("stdout read error: {}", e));
                        stdout_open = false;
                    }
                },
                line = stderr.next_segment(), if stderr_open => match line {
                    Ok(Some(bytes)) => err.push(decode_line(&bytes)),
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        err.push(format!("stderr read error: {}", e));
                        stderr_open = false;
                    }
                },
                status = child.wait(), if !stdout_open && !stderr_open => break status,
            }
        };

        let output = combine(&out, &err);
        match status {
            Ok(status) if status.success() => ToolResult::text(output),
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                ToolResult::error(format!("{}\n\nCommand exited with code {}", output, code))
                    .with_details(json!({ "exit_code": code }))
            }
            Err(e) => ToolResult::error(format!("Failed to wait for command: {}", e)),
        }
    }
}

/// Commands may print arbitrary bytes; invalid UTF-8 is replaced, not fatal
fn decode_line(bytes: &[u8]) -> String {
    let line = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(line).into_owned()
}

/// One output stream, capped by lines and bytes
#[derive(Default)]
struct Capture {
    text: String,
    lines: usize,
    dropped: usize,
}

impl Capture {
    fn push(&mut self, line: String) {
        if self.lines >= MAX_OUTPUT_LINES || self.text.len() + line.len() > MAX_OUTPUT_BYTES {
            self.dropped += 1;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(&line);
        self.lines += 1;
    }

    fn render(&self, name: &str) -> String {
        if self.dropped == 0 {
            return self.text.clone();
        }
        format!("{}\n\n... ({} {} lines omitted)", self.text, self.dropped, name)
    }
}

fn combine(out: &Capture, err: &Capture) -> String {
    let parts: Vec<String> = [out.render("stdout"), err.render("stderr")]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        "(no output)".to_string()
    } else {
        parts.join("\n")
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory. Returns stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command to run"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds (default 120, max 600)"
                }
            },
            "required": ["command"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }

    fn default_permission(&self) -> Option<Decision> {
        Some(Decision::Ask)
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        self.run(&arguments, cancel, None).await
    }

    async fn execute_with_progress(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> ToolResult {
        self.run(&arguments, cancel, Some(progress)).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(dir.path());
        let result = tool
            .execute("1", json!({"command": "echo out; echo err 1>&2"}), CancellationToken::new())
            .await;
        assert!(!result.is_error);
        assert_eq!(result.text_content(), "out\nerr");
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let tool = BashTool::new(dir.path());
        let result = tool
            .execute("1", json!({"command": "ls"}), CancellationToken::new())
            .await;
        assert_eq!(result.text_content(), "marker.txt");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(dir.path());
        let result = tool
            .execute("1", json!({"command": "exit 3"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.text_content().ends_with("Command exited with code 3"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_keeps_draining_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(dir.path());
        let command = "printf 'bad \\377\\n'; head -c 300000 /dev/zero | tr '\\0' a; echo; echo done";
        let started = std::time::Instant::now();
        let result = tool
            .execute("1", json!({"command": command, "timeout": 30}), CancellationToken::new())
            .await;

        assert!(!result.is_error, "{}", result.text_content());
        assert!(started.elapsed() < Duration::from_secs(30));
        let text = result.text_content();
        assert!(text.starts_with("bad \u{FFFD}\ndone"));
        assert!(text.contains("(1 stdout lines omitted)"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = tool
            .execute("1", json!({"command": "sleep 10"}), cancel)
            .await;
        assert_eq!(result.text_content(), "Command cancelled");
    }
}
