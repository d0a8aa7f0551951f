//! Pre-tool hooks backed by shell commands

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use relay_agent::HookEngine;
use relay_agent::permission::{HookEvent, HookOutcome};
use serde_json::Value;
use wait_timeout::ChildExt;

/// Exit status a hook uses to block the call
const BLOCK_STATUS: i32 = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs each configured command with the hook payload as JSON on stdin.
/// The first command exiting with status 2 blocks, its stderr becoming the
/// reason. Other failures, and hooks that outlive the timeout, are logged
/// and ignored.
pub struct CommandHookEngine {
    pre_tool_use: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandHookEngine {
    pub fn new(pre_tool_use: Vec<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            pre_tool_use,
            cwd: cwd.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, command: &str, payload: &str) -> HookOutcome {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Hook {:?} failed to start: {}", command, e);
                return HookOutcome::default();
            }
        };

        // Pipes get their own threads; only the deadline bounds the wait
        if let Some(mut stdin) = child.stdin.take() {
            let payload = payload.to_string();
            let name = command.to_string();
            thread::spawn(move || {
                // A hook may exit without reading its input
                if let Err(e) = stdin.write_all(payload.as_bytes()) {
                    tracing::debug!("Hook {:?} closed stdin early: {}", name, e);
                }
            });
        }
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::warn!("Hook {:?} still running after {:?}; killed", command, self.timeout);
                let _ = child.kill();
                let _ = child.wait();
                return HookOutcome::default();
            }
            Err(e) => {
                tracing::warn!("Hook {:?} failed: {}", command, e);
                let _ = child.kill();
                return HookOutcome::default();
            }
        };
        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        match status.code() {
            Some(0) => HookOutcome::default(),
            Some(BLOCK_STATUS) => {
                let reason = String::from_utf8_lossy(&stderr).trim().to_string();
                if reason.is_empty() {
                    HookOutcome::block(format!("{} exited with status 2", command))
                } else {
                    HookOutcome::block(reason)
                }
            }
            status => {
                tracing::warn!(
                    "Hook {:?} exited with {:?}; ignoring: {}",
                    command,
                    status,
                    String::from_utf8_lossy(&stderr).trim()
                );
                HookOutcome::default()
            }
        }
    }
}

impl HookEngine for CommandHookEngine {
    fn execute(&self, event: HookEvent, payload: &Value) -> HookOutcome {
        let commands = match event {
            HookEvent::PreToolUse => &self.pre_tool_use,
        };
        if commands.is_empty() {
            return HookOutcome::default();
        }
        let payload = payload.to_string();
        commands
            .iter()
            .map(|command| self.run(command, &payload))
            .find(|outcome| outcome.should_block)
            .unwrap_or_default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "hook_event_name": "PreToolUse",
            "tool_name": "bash",
            "tool_input": { "command": "rm -rf build" },
        })
    }

    fn engine(commands: &[&str]) -> (CommandHookEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let commands = commands.iter().map(|c| c.to_string()).collect();
        (CommandHookEngine::new(commands, dir.path()), dir)
    }

    #[test]
    fn test_status_two_blocks_with_stderr() {
        let (hooks, _dir) = engine(&["echo 'no deletes' >&2; exit 2"]);
        let outcome = hooks.execute(HookEvent::PreToolUse, &payload());
        assert_eq!(outcome, HookOutcome::block("no deletes"));
    }

    #[test]
    fn test_hook_sees_the_payload() {
        let (hooks, _dir) =
            engine(&["if grep -q 'rm -rf'; then echo matched >&2; exit 2; fi"]);
        let outcome = hooks.execute(HookEvent::PreToolUse, &payload());
        assert_eq!(outcome.block_reason.as_deref(), Some("matched"));
    }

    #[test]
    fn test_other_failures_are_ignored() {
        let (hooks, _dir) = engine(&["exit 1", "cat > /dev/null"]);
        let outcome = hooks.execute(HookEvent::PreToolUse, &payload());
        assert!(!outcome.should_block);
    }

    #[test]
    fn test_hung_hook_is_killed_and_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = CommandHookEngine::new(
            vec!["exec sleep 30".into(), "echo after >&2; exit 2".into()],
            dir.path(),
        )
        .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = hooks.execute(HookEvent::PreToolUse, &payload());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.block_reason.as_deref(), Some("after"));
    }

    #[test]
    fn test_hook_ignoring_a_large_payload_finishes() {
        let (hooks, _dir) = engine(&["exit 0"]);
        let big = json!({ "tool_input": { "content": "x".repeat(1 << 20) } });
        assert!(!hooks.execute(HookEvent::PreToolUse, &big).should_block);
    }

    #[test]
    fn test_first_blocking_hook_wins() {
        let (hooks, _dir) = engine(&["true", "echo first >&2; exit 2", "echo second >&2; exit 2"]);
        let outcome = hooks.execute(HookEvent::PreToolUse, &payload());
        assert_eq!(outcome.block_reason.as_deref(), Some("first"));
    }
}
