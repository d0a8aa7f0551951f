//! Fake tools and a scripted transport shared by the unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_ai::{ModelStream, StopReason, StreamEvent, ToolCall, Usage};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::interaction::{
    InteractionRequest, PermissionPrompt, PlanResolution, Question, QuestionOption,
    QuestionResolution, Resolution,
};
use crate::permission::{Decision, ToolCategory};
use crate::tool::{Interactive, PermissionAware, Tool, ToolResult};
use crate::transport::{StreamRequest, Transport};

/// Names of executed calls, in completion order
pub type ExecLog = Arc<Mutex<Vec<String>>>;

pub fn exec_log() -> ExecLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

pub fn text(delta: &str) -> StreamEvent {
    StreamEvent::TextDelta {
        delta: delta.to_string(),
    }
}

pub fn done() -> StreamEvent {
    done_with(vec![])
}

pub fn done_with(tool_calls: Vec<ToolCall>) -> StreamEvent {
    done_using(tool_calls, 0)
}

/// `Done` reporting `input_tokens` of context use
pub fn done_using(tool_calls: Vec<ToolCall>, input_tokens: u32) -> StreamEvent {
    StreamEvent::Done {
        stop_reason: if tool_calls.is_empty() {
            StopReason::Stop
        } else {
            StopReason::ToolUse
        },
        tool_calls,
        usage: Usage {
            input: input_tokens,
            output: 10,
            ..Default::default()
        },
    }
}

/// Plain tool that records its call id and sleeps for `delay`
pub struct MockTool {
    pub name: &'static str,
    pub category: ToolCategory,
    pub default: Option<Decision>,
    pub delay: Duration,
    pub log: ExecLog,
}

impl MockTool {
    /// Read-category tool that never asks
    pub fn read(name: &'static str, log: &ExecLog) -> Self {
        Self {
            name,
            category: ToolCategory::Read,
            default: Some(Decision::Allow),
            delay: Duration::ZERO,
            log: log.clone(),
        }
    }

    /// Shell-category tool that always asks
    pub fn shell(name: &'static str, log: &ExecLog) -> Self {
        Self {
            name,
            category: ToolCategory::Shell,
            default: Some(Decision::Ask),
            delay: Duration::ZERO,
            log: log.clone(),
        }
    }

    /// Edit-category tool with no declared default
    pub fn edit(name: &'static str, log: &ExecLog) -> Self {
        Self {
            name,
            category: ToolCategory::Edit,
            default: None,
            delay: Duration::ZERO,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "mock tool"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn category(&self) -> ToolCategory {
        self.category
    }
    fn default_permission(&self) -> Option<Decision> {
        self.default
    }
    async fn execute(&self, tool_call_id: &str, arguments: Value, _cancel: CancellationToken) -> ToolResult {
        // Per-call delay overrides the tool's own
        let delay = arguments
            .get("delay_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.log.lock().push(tool_call_id.to_string());
        ToolResult::text(format!("{} {} ok", self.name, tool_call_id))
    }
}

pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "explode"
    }
    fn description(&self) -> &str {
        "panics"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn default_permission(&self) -> Option<Decision> {
        Some(Decision::Allow)
    }
    async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
        panic!("boom")
    }
}

/// Permission-aware tool that asks for every call
pub struct GatedTool {
    pub log: ExecLog,
}

#[async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        "fetch"
    }
    fn description(&self) -> &str {
        "fetches a url"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"url": {"type": "string"}},
            "required": ["url"]
        })
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
    async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
        ToolResult::error("fetch must be approved first")
    }
}

#[async_trait]
impl PermissionAware for GatedTool {
    fn requires_permission(&self, _arguments: &Value) -> bool {
        true
    }
    fn prepare_permission(&self, tool_call_id: &str, arguments: &Value) -> PermissionPrompt {
        PermissionPrompt {
            tool_name: "fetch".into(),
            tool_call_id: tool_call_id.into(),
            summary: format!("Fetch {}", arguments["url"].as_str().unwrap_or("?")),
            arguments: arguments.clone(),
            category: ToolCategory::Network,
        }
    }
    async fn execute_approved(&self, tool_call_id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
        self.log.lock().push(tool_call_id.to_string());
        ToolResult::text("fetched")
    }
}

/// Interactive tool covering the question, plan and enter-plan shapes,
/// selected by the `kind` argument
pub struct AskTool {
    pub name: &'static str,
    pub log: ExecLog,
}

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "asks the human"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
        ToolResult::error("needs an answer")
    }
}

#[async_trait]
impl Interactive for AskTool {
    fn prepare_interaction(&self, _id: &str, arguments: &Value) -> Result<InteractionRequest, String> {
        match arguments.get("kind").and_then(Value::as_str) {
            Some("plan") => Ok(InteractionRequest::Plan {
                plan: arguments["plan"].as_str().unwrap_or("1. do it").to_string(),
            }),
            Some("enter_plan") => Ok(InteractionRequest::EnterPlanMode {
                task: "refactor".into(),
            }),
            Some("question") | None => Ok(InteractionRequest::Question {
                questions: vec![Question {
                    question: "Which?".into(),
                    header: "Pick".into(),
                    options: vec![
                        QuestionOption {
                            label: "A".into(),
                            description: String::new(),
                        },
                        QuestionOption {
                            label: "B".into(),
                            description: String::new(),
                        },
                    ],
                    multi_select: false,
                }],
            }),
            Some(other) => Err(format!("unknown kind {}", other)),
        }
    }

    async fn execute_with_response(
        &self,
        tool_call_id: &str,
        _arguments: Value,
        resolution: &Resolution,
        _cancel: CancellationToken,
    ) -> ToolResult {
        self.log.lock().push(tool_call_id.to_string());
        match resolution {
            Resolution::Question(QuestionResolution::Answered(answers)) => {
                ToolResult::text(format!("answered: {}", answers[0].render()))
            }
            Resolution::Plan(PlanResolution::KeepContextAndAsk)
            | Resolution::Plan(PlanResolution::KeepContextAndAutoAccept)
            | Resolution::Plan(PlanResolution::ClearContextAndAutoAccept) => {
                ToolResult::text("plan approved")
            }
            Resolution::EnterPlanMode(_) => ToolResult::text("entered plan mode"),
            other => ToolResult::text(format!("{:?}", other)),
        }
    }
}

pub enum ScriptedTurn {
    /// Fragments to stream. Without a terminal fragment the stream stays
    /// open until cancelled.
    Events(Vec<StreamEvent>),
    /// `Transport::stream` itself fails
    OpenError(String),
    /// `Transport::stream` fails with an already classified error
    OpenFailure(relay_ai::Error),
}

/// Transport that replays scripted responses and records every request
#[derive(Default)]
pub struct ScriptedTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    pub requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into_iter().map(ScriptedTurn::Events).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn stream(&self, request: StreamRequest, cancel: CancellationToken) -> relay_ai::Result<ModelStream> {
        self.requests.lock().push(request);
        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::OpenError("no scripted response".into()));
        let events = match turn {
            ScriptedTurn::Events(events) => events,
            ScriptedTurn::OpenError(message) => return Err(relay_ai::Error::Stream(message)),
            ScriptedTurn::OpenFailure(error) => return Err(error),
        };
        Ok(Box::pin(async_stream::stream! {
            let mut terminal = false;
            for event in events {
                if cancel.is_cancelled() {
                    return;
                }
                terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
            if !terminal {
                cancel.cancelled().await;
            }
        }))
    }
}
