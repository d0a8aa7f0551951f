//! Line-oriented boundary: renders controller events on a writer and turns
//! input lines into submissions, commands and interaction answers

use std::io::Write;
use std::path::Path;

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use relay_agent::interaction::{
    EnterPlanResolution, PermissionAnswer, PlanResolution, Question, QuestionAnswer,
    QuestionResolution,
};
use relay_agent::{
    AgentEvent, CompactionReason, ControllerHandle, InteractionRequest, OperatingMode, Resolution,
};
use relay_ai::{Content, Message, NoticeLevel};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast::{self, error::RecvError};

const HELP: &str = "\
Commands:
  /compact [focus]          Summarize the conversation, optionally around a topic
  /image <file> [message]   Send an image (png, jpg, gif, webp) with a message
  /mode normal|auto|plan    Switch operating mode
  /help                     Show this help
  /quit                     Exit";

/// A line typed at the idle prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(String),
    Compact(Option<String>),
    Image { path: String, text: String },
    Mode(OperatingMode),
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Submit(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        "compact" => Command::Compact((!arg.is_empty()).then(|| arg.to_string())),
        "image" if !arg.is_empty() => {
            let (path, text) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
            Command::Image {
                path: path.to_string(),
                text: text.trim().to_string(),
            }
        }
        "mode" => match arg {
            "normal" => Command::Mode(OperatingMode::Normal),
            "auto" | "auto-accept" => Command::Mode(OperatingMode::AutoAccept),
            "plan" => Command::Mode(OperatingMode::Plan),
            _ => Command::Unknown(line.to_string()),
        },
        _ => Command::Unknown(line.to_string()),
    }
}

/// Read an image file as base64 content, typed by its extension
pub fn load_image(path: &Path) -> anyhow::Result<Content> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let mime_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => bail!("Unsupported image type: {}", path.display()),
    };
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Content::image(STANDARD.encode(bytes), mime_type))
}

pub fn parse_permission(line: &str) -> Option<PermissionAnswer> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(PermissionAnswer::Approve),
        "a" | "always" => Some(PermissionAnswer::ApproveForSession),
        "n" | "no" => Some(PermissionAnswer::Deny),
        _ => None,
    }
}

fn parse_yes_no(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Option numbers (`2` or `1,3`) select labels; anything else is a free answer
pub fn parse_answer(question: &Question, line: &str) -> Option<QuestionAnswer> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let picks: Option<Vec<String>> = line
        .split(',')
        .map(|part| {
            let index: usize = part.trim().parse().ok()?;
            let option = question.options.get(index.checked_sub(1)?)?;
            Some(option.label.clone())
        })
        .collect();
    Some(match picks {
        Some(selected) => QuestionAnswer {
            selected,
            other: None,
        },
        None => QuestionAnswer::other(line),
    })
}

pub fn parse_plan(line: &str) -> Option<PlanResolution> {
    let line = line.trim();
    if let Some(text) = line.strip_prefix("e ").or_else(|| line.strip_prefix("edit ")) {
        let text = text.trim();
        return (!text.is_empty()).then(|| PlanResolution::Resubmit(text.to_string()));
    }
    match line.to_lowercase().as_str() {
        "1" => Some(PlanResolution::ClearContextAndAutoAccept),
        "2" => Some(PlanResolution::KeepContextAndAutoAccept),
        "3" => Some(PlanResolution::KeepContextAndAsk),
        "n" | "no" | "reject" => Some(PlanResolution::Reject),
        _ => None,
    }
}

/// The interaction currently shown to the human
#[derive(Debug)]
struct Prompting {
    id: String,
    request: InteractionRequest,
    answers: Vec<QuestionAnswer>,
    /// A resolution was sent and awaits confirmation
    answered: bool,
}

pub struct Boundary<W: Write> {
    out: W,
    handle: ControllerHandle,
    show_usage: bool,
    busy: bool,
    streamed_chars: usize,
    prompting: Option<Prompting>,
    once: bool,
}

impl<W: Write> Boundary<W> {
    pub fn new(out: W, handle: ControllerHandle) -> Self {
        Self {
            out,
            handle,
            show_usage: false,
            busy: false,
            streamed_chars: 0,
            prompting: None,
            once: false,
        }
    }

    /// Print token totals after each turn
    pub fn with_usage(mut self, show: bool) -> Self {
        self.show_usage = show;
        self
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Submit `command`, answer interactions from `input`, and stop once the
    /// controller is idle again
    pub async fn run_once<R>(
        &mut self,
        command: &str,
        events: broadcast::Receiver<AgentEvent>,
        input: R,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.once = true;
        writeln!(self.out, "relay> {}\n", command)?;
        self.submit(command.to_string());
        self.drive(events, input).await
    }

    /// Interactive loop until `/quit` or end of input
    pub async fn run<R>(&mut self, events: broadcast::Receiver<AgentEvent>, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.print_prompt()?;
        self.drive(events, input).await
    }

    async fn drive<R>(&mut self, mut events: broadcast::Receiver<AgentEvent>, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let wants_input = match &self.prompting {
                Some(prompting) => !prompting.answered,
                None => !self.busy,
            };
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if !self.on_event(event)? {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Boundary fell behind; {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                line = lines.next_line(), if wants_input => match line? {
                    Some(line) => {
                        if !self.on_line(&line)? {
                            self.handle.shutdown();
                            return Ok(());
                        }
                    }
                    None => {
                        self.handle.shutdown();
                        return Ok(());
                    }
                },
            }
        }
    }

    fn submit(&mut self, text: String) {
        self.busy = true;
        self.handle.submit(text);
    }

    fn print_prompt(&mut self) -> std::io::Result<()> {
        write!(self.out, "> ")?;
        self.out.flush()
    }

    /// Returns false when the boundary should stop
    fn on_line(&mut self, line: &str) -> anyhow::Result<bool> {
        if self.prompting.is_some() {
            self.on_answer(line)?;
            return Ok(true);
        }

        match parse_command(line) {
            Command::Submit(text) if text.is_empty() => self.print_prompt()?,
            Command::Submit(text) => {
                writeln!(self.out)?;
                self.submit(text);
            }
            Command::Compact(focus) => self.handle.compact(focus),
            Command::Image { path, text } => match load_image(Path::new(&path)) {
                Ok(image) => {
                    writeln!(self.out)?;
                    let mut content = vec![image];
                    if !text.is_empty() {
                        content.push(Content::text(text));
                    }
                    self.busy = true;
                    self.handle.submit_content(content);
                }
                Err(e) => {
                    writeln!(self.out, "Error: {:#}", e)?;
                    self.print_prompt()?;
                }
            },
            Command::Mode(mode) => {
                self.handle.set_mode(mode);
                self.print_prompt()?;
            }
            Command::Help => {
                writeln!(self.out, "{}", HELP)?;
                self.print_prompt()?;
            }
            Command::Quit => return Ok(false),
            Command::Unknown(command) => {
                writeln!(self.out, "Unknown command: {}. Type /help for commands.", command)?;
                self.print_prompt()?;
            }
        }
        Ok(true)
    }

    fn on_answer(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(prompting) = self.prompting.as_mut() else {
            return Ok(());
        };
        let resolution = match &prompting.request {
            InteractionRequest::Permission(_) => parse_permission(line).map(Resolution::Permission),
            InteractionRequest::EnterPlanMode { .. } => parse_yes_no(line).map(|yes| {
                Resolution::EnterPlanMode(if yes {
                    EnterPlanResolution::Approve
                } else {
                    EnterPlanResolution::Deny
                })
            }),
            InteractionRequest::Plan { .. } => parse_plan(line).map(Resolution::Plan),
            InteractionRequest::Question { .. } if line.trim() == "/cancel" => {
                Some(Resolution::Question(QuestionResolution::Cancelled))
            }
            InteractionRequest::Question { questions } => {
                match parse_answer(&questions[prompting.answers.len()], line) {
                    Some(answer) => {
                        prompting.answers.push(answer);
                        let complete = prompting.answers.len() == questions.len();
                        complete.then(|| {
                            Resolution::Question(QuestionResolution::Answered(
                                prompting.answers.clone(),
                            ))
                        })
                    }
                    None => {
                        writeln!(self.out, "Not a valid answer.")?;
                        None
                    }
                }
            }
        };

        match resolution {
            Some(resolution) => {
                prompting.answered = true;
                self.handle.resolve(prompting.id.clone(), resolution);
                Ok(())
            }
            None => {
                if !matches!(prompting.request, InteractionRequest::Question { .. }) {
                    writeln!(self.out, "Not a valid answer.")?;
                }
                self.render_pending()?;
                Ok(())
            }
        }
    }

    /// Show the pending request, or its next unanswered question
    fn render_pending(&mut self) -> std::io::Result<()> {
        let Some(prompting) = &self.prompting else {
            return Ok(());
        };
        let text = match &prompting.request {
            InteractionRequest::Permission(prompt) => format!(
                "Allow {}? [y]es / [a]lways this session / [n]o",
                prompt.summary
            ),
            InteractionRequest::EnterPlanMode { task } => {
                format!("Enter plan mode to plan {}? [y/n]", task)
            }
            InteractionRequest::Plan { plan } => format!(
                "Proposed plan:\n\n{}\n\n  1. Approve, clear context and auto-accept edits\n  \
                 2. Approve and auto-accept edits\n  3. Approve and ask before each edit\n  \
                 e <text>. Keep planning from this revised plan\n  n. Reject",
                plan
            ),
            InteractionRequest::Question { questions } => {
                render_question(&questions[prompting.answers.len()])
            }
        };
        write!(self.out, "\n{}\n? ", text)?;
        self.out.flush()
    }

    /// Returns false when the boundary should stop
    fn on_event(&mut self, event: AgentEvent) -> anyhow::Result<bool> {
        match event {
            AgentEvent::StateChanged { to, .. } => {
                if to != relay_agent::TurnState::Idle {
                    self.busy = true;
                }
            }
            AgentEvent::MessageStart { .. } => self.streamed_chars = 0,
            AgentEvent::MessageUpdate { message } => {
                let text = message.text();
                let new: String = text.chars().skip(self.streamed_chars).collect();
                if !new.is_empty() {
                    self.streamed_chars += new.chars().count();
                    write!(self.out, "{}", new)?;
                    self.out.flush()?;
                }
            }
            AgentEvent::MessageEnd { message } => {
                if self.streamed_chars > 0 {
                    writeln!(self.out)?;
                }
                if let Message::Assistant { metadata, .. } = &message {
                    if let Some(error) = &metadata.error_message {
                        writeln!(self.out, "[response failed: {}]", error)?;
                    }
                }
                self.streamed_chars = 0;
            }
            AgentEvent::ToolExecutionStart {
                tool_name,
                arguments,
                ..
            } => match argument_summary(&arguments) {
                Some(summary) => writeln!(self.out, "[{} {}]", tool_name, summary)?,
                None => writeln!(self.out, "[{}]", tool_name)?,
            },
            AgentEvent::ToolExecutionUpdate { content, .. } => writeln!(self.out, "  {}", content)?,
            AgentEvent::ToolExecutionEnd {
                result, is_error, ..
            } => {
                let first = result.lines().next().unwrap_or("");
                let preview: String = first.chars().take(80).collect();
                let more = result.lines().count().saturating_sub(1);
                let label = if is_error { "error: " } else { "" };
                if more > 0 {
                    writeln!(self.out, "  {}{} (+{} lines)", label, preview, more)?;
                } else {
                    writeln!(self.out, "  {}{}", label, preview)?;
                }
            }
            AgentEvent::InteractionRequested { id, request, .. } => {
                self.prompting = Some(Prompting {
                    id,
                    request,
                    answers: Vec::new(),
                    answered: false,
                });
                self.render_pending()?;
            }
            AgentEvent::InteractionResolved { id, .. } => {
                if self.prompting.as_ref().is_some_and(|p| p.id == id) {
                    self.prompting = None;
                }
            }
            AgentEvent::ModeChanged { to, .. } => writeln!(self.out, "[mode: {}]", mode_name(to))?,
            AgentEvent::ContextUsage {
                percent,
                should_warn: true,
                ..
            } => writeln!(
                self.out,
                "[context {:.0}% full; /compact to summarize]",
                percent * 100.0
            )?,
            AgentEvent::CompactionStart { reason } => {
                self.busy = true;
                let reason = match reason {
                    CompactionReason::Manual => "manual",
                    CompactionReason::Threshold => "threshold",
                };
                writeln!(self.out, "[compacting context ({})]", reason)?;
            }
            AgentEvent::CompactionEnd {
                messages_before,
                tokens_before,
            } => writeln!(
                self.out,
                "[compacted {} messages (~{} tokens) into a summary]",
                messages_before, tokens_before
            )?,
            AgentEvent::CompactionFailed { message } => {
                writeln!(self.out, "[compaction failed: {}]", message)?
            }
            AgentEvent::Notice { level, text } => {
                writeln!(self.out, "[{}] {}", level_name(level), text)?
            }
            AgentEvent::Error { message } => {
                writeln!(self.out, "Error: {}", message)?;
                // A rejected answer leaves the interaction pending
                if let Some(prompting) = self.prompting.as_mut().filter(|p| p.answered) {
                    prompting.answered = false;
                    prompting.answers.clear();
                    self.render_pending()?;
                }
            }
            AgentEvent::TurnEnd { total_usage } if self.show_usage => writeln!(
                self.out,
                "[{} in, {} out]",
                total_usage.input, total_usage.output
            )?,
            AgentEvent::Idle => {
                self.busy = false;
                if self.once {
                    self.handle.shutdown();
                    return Ok(false);
                }
                writeln!(self.out)?;
                self.print_prompt()?;
            }
            _ => {}
        }
        Ok(true)
    }
}

fn render_question(question: &Question) -> String {
    let mut text = if question.header.is_empty() {
        question.question.clone()
    } else {
        format!("[{}] {}", question.header, question.question)
    };
    for (index, option) in question.options.iter().enumerate() {
        text.push_str(&format!("\n  {}. {}", index + 1, option.label));
        if !option.description.is_empty() {
            text.push_str(&format!(" - {}", option.description));
        }
    }
    text.push_str(if question.multi_select {
        "\n(numbers separated by commas, or type your own answer; /cancel to skip)"
    } else {
        "\n(a number, or type your own answer; /cancel to skip)"
    });
    text
}

/// The argument worth showing next to a tool name
fn argument_summary(arguments: &serde_json::Value) -> Option<String> {
    ["command", "path", "file_path", "pattern", "url"]
        .iter()
        .find_map(|key| arguments.get(*key).and_then(|v| v.as_str()))
        .map(|value| {
            let line = value.lines().next().unwrap_or("");
            line.chars().take(80).collect()
        })
}

fn mode_name(mode: OperatingMode) -> &'static str {
    match mode {
        OperatingMode::Normal => "normal",
        OperatingMode::AutoAccept => "auto-accept edits",
        OperatingMode::Plan => "plan",
    }
}

fn level_name(level: NoticeLevel) -> &'static str {
    match level {
        NoticeLevel::Info => "info",
        NoticeLevel::Warning => "warning",
        NoticeLevel::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_agent::interaction::QuestionOption;
    use relay_agent::{ControllerConfig, PermissionArbiter, TurnController};
    use relay_ai::ModelInfo;
    use relay_tools::{ToolOptions, builtin_registry};

    use crate::replay::ReplayTransport;

    fn question() -> Question {
        Question {
            question: "Which database?".into(),
            header: "DB".into(),
            options: vec![
                QuestionOption {
                    label: "Postgres".into(),
                    description: String::new(),
                },
                QuestionOption {
                    label: "SQLite".into(),
                    description: "embedded".into(),
                },
            ],
            multi_select: true,
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("fix the build"), Command::Submit("fix the build".into()));
        assert_eq!(parse_command("/compact"), Command::Compact(None));
        assert_eq!(parse_command("/compact auth flow"), Command::Compact(Some("auth flow".into())));
        assert_eq!(parse_command("/mode plan"), Command::Mode(OperatingMode::Plan));
        assert_eq!(parse_command("/mode auto"), Command::Mode(OperatingMode::AutoAccept));
        assert_eq!(parse_command("/exit"), Command::Quit);
        assert!(matches!(parse_command("/mode sideways"), Command::Unknown(_)));
        assert_eq!(
            parse_command("/image shot.png why is the header cut off"),
            Command::Image {
                path: "shot.png".into(),
                text: "why is the header cut off".into(),
            }
        );
        assert!(matches!(parse_command("/image"), Command::Unknown(_)));
    }

    #[test]
    fn test_load_image() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("Shot.PNG");
        std::fs::write(&png, [0x89, b'P', b'N', b'G']).unwrap();
        assert_eq!(load_image(&png).unwrap(), Content::image("iVBORw==", "image/png"));

        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "text").unwrap();
        assert!(load_image(&notes).is_err());
        assert!(load_image(&dir.path().join("missing.jpg")).is_err());
    }

    #[test]
    fn test_parse_answers() {
        assert_eq!(parse_permission("Y"), Some(PermissionAnswer::Approve));
        assert_eq!(parse_permission("always"), Some(PermissionAnswer::ApproveForSession));
        assert_eq!(parse_permission("maybe"), None);

        let q = question();
        assert_eq!(parse_answer(&q, "2"), Some(QuestionAnswer::select("SQLite")));
        assert_eq!(
            parse_answer(&q, "1, 2").unwrap().selected,
            vec!["Postgres", "SQLite"]
        );
        assert_eq!(parse_answer(&q, "3"), Some(QuestionAnswer::other("3")));
        assert_eq!(parse_answer(&q, "DuckDB"), Some(QuestionAnswer::other("DuckDB")));
        assert_eq!(parse_answer(&q, "  "), None);

        assert_eq!(parse_plan("2"), Some(PlanResolution::KeepContextAndAutoAccept));
        assert_eq!(
            parse_plan("e 1. Smaller steps"),
            Some(PlanResolution::Resubmit("1. Smaller steps".into()))
        );
        assert_eq!(parse_plan("e  "), None);
        assert_eq!(parse_plan("reject"), Some(PlanResolution::Reject));
    }

    #[test]
    fn test_render_question() {
        let text = render_question(&question());
        assert!(text.starts_with("[DB] Which database?"));
        assert!(text.contains("\n  2. SQLite - embedded"));
    }

    fn controller(dir: &std::path::Path, script: &str) -> TurnController {
        let transport = ReplayTransport::new(serde_json::from_str(script).unwrap());
        let options = ToolOptions {
            cwd: dir.to_path_buf(),
            trusted_domains: vec![],
        };
        TurnController::new(
            ControllerConfig::new(ModelInfo::new("replay")),
            Arc::new(transport),
            builtin_registry(&options),
            PermissionArbiter::default(),
        )
    }

    #[tokio::test]
    async fn test_permission_prompt_is_answered_from_input() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(
            dir.path(),
            r#"[
                { "text": "Writing it.", "tool_calls": [
                    { "id": "w1", "name": "write", "arguments": { "path": "notes.txt", "content": "hello" } }
                ] },
                { "text": "Done." }
            ]"#,
        );
        let events = ctl.subscribe();
        let mut boundary = Boundary::new(Vec::new(), ctl.handle());
        let running = tokio::spawn(ctl.run());

        boundary
            .run(events, &b"create notes\ny\n"[..])
            .await
            .unwrap();
        running.await.unwrap();

        let output = String::from_utf8(boundary.into_inner()).unwrap();
        assert!(output.contains("Allow "), "{}", output);
        assert!(output.contains("Done."), "{}", output);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_once_mode_answers_a_question_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(
            dir.path(),
            r#"[
                { "tool_calls": [{ "id": "q1", "name": "ask_user_question", "arguments": {
                    "questions": [{ "question": "Which database?", "options": [
                        { "label": "Postgres" }, { "label": "SQLite" }
                    ] }]
                } }] },
                { "text": "SQLite it is." }
            ]"#,
        );
        let events = ctl.subscribe();
        let mut boundary = Boundary::new(Vec::new(), ctl.handle());
        let running = tokio::spawn(ctl.run());

        boundary
            .run_once("pick a database", events, &b"2\n"[..])
            .await
            .unwrap();
        running.await.unwrap();

        let output = String::from_utf8(boundary.into_inner()).unwrap();
        assert!(output.contains("1. Postgres"), "{}", output);
        assert!(
            output.contains("The user answered: \"Which database?\" = \"SQLite\""),
            "{}",
            output
        );
        assert!(output.contains("SQLite it is."), "{}", output);
    }

    #[tokio::test]
    async fn test_invalid_answer_asks_again() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(
            dir.path(),
            r#"[
                { "tool_calls": [{ "id": "p1", "name": "enter_plan_mode", "arguments": { "task": "the refactor" } }] },
                { "text": "Planning." }
            ]"#,
        );
        let events = ctl.subscribe();
        let mut boundary = Boundary::new(Vec::new(), ctl.handle());
        let running = tokio::spawn(ctl.run());

        boundary
            .run_once("refactor", events, &b"perhaps\nyes\n"[..])
            .await
            .unwrap();
        running.await.unwrap();

        let output = String::from_utf8(boundary.into_inner()).unwrap();
        assert_eq!(output.matches("Enter plan mode to plan the refactor?").count(), 2);
        assert!(output.contains("Not a valid answer."));
        assert!(output.contains("[mode: plan]"), "{}", output);
    }
}
