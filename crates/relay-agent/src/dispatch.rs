//! Tool dispatch: mode selection, per-call planning and batch bookkeeping
//!
//! A batch is the set of tool calls from one finalized assistant message.
//! Results are keyed by call index and only reach the conversation log as a
//! single ordered write once every call has one.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use relay_ai::{Message, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::interaction::{InteractionRequest, InteractionRoute, PermissionPrompt, Resolution};
use crate::permission::{Authorization, Decision, PermissionArbiter, PermissionSubject};
use crate::registry::{Capability, RegisteredTool, ToolRegistry};
use crate::tool::{Interactive, PermissionAware, ProgressSender, Tool, ToolResult};

pub const CANCELLED_BY_USER: &str = "Execution cancelled by user";
pub const PERMISSION_DENIED: &str = "User denied permission";
pub const QUESTION_CANCELLED: &str = "User cancelled the question prompt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One call at a time, in order
    Sequential,
    /// Every call at once
    Parallel,
}

/// Normalize raw model arguments into a JSON object
pub fn parse_arguments(raw: &Value) -> Result<Value, String> {
    match raw {
        Value::Object(_) => Ok(raw.clone()),
        Value::Null => Ok(Value::Object(Default::default())),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Object(Default::default())),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => Ok(parsed),
            Ok(_) => Err("Tool arguments must be a JSON object".to_string()),
            Err(e) => Err(format!("Failed to parse tool arguments: {}", e)),
        },
        _ => Err("Tool arguments must be a JSON object".to_string()),
    }
}

/// Permission subject for a registered tool. A permission-aware tool that
/// wants explicit permission defaults to Ask instead of its declared default.
pub fn subject_for<'a>(tool: &'a RegisteredTool, arguments: &'a Value) -> PermissionSubject<'a> {
    let subject = PermissionSubject::for_tool(tool.tool.as_ref(), arguments);
    match &tool.capability {
        Capability::PermissionAware(gated) if gated.requires_permission(arguments) => {
            subject.with_default(Some(Decision::Ask))
        }
        _ => subject,
    }
}

/// Pick the mode for a whole batch. Any call that may stop for a human
/// serializes every call in the batch.
pub fn select_mode(
    calls: &[ToolCall],
    registry: &ToolRegistry,
    arbiter: &PermissionArbiter,
) -> DispatchMode {
    if calls.len() <= 1 {
        return DispatchMode::Sequential;
    }
    for call in calls {
        // Unknown tools and bad arguments become error results; they never gate
        let Some(tool) = registry.get(&call.name) else {
            continue;
        };
        let Ok(arguments) = parse_arguments(&call.arguments) else {
            continue;
        };
        let gating = match &tool.capability {
            Capability::Interactive(_) => true,
            Capability::PermissionAware(gated) => gated.requires_permission(&arguments),
            Capability::Plain => false,
        } || arbiter.evaluate(&subject_for(tool, &arguments)) == Decision::Ask;
        if gating {
            tracing::debug!("{} ({}) forces sequential dispatch", call.name, call.id);
            return DispatchMode::Sequential;
        }
    }
    DispatchMode::Parallel
}

/// Work ready to run for one call
pub enum Execution {
    Plain {
        tool: Arc<dyn Tool>,
        arguments: Value,
    },
    Approved {
        tool: Arc<dyn PermissionAware>,
        arguments: Value,
    },
    WithResponse {
        tool: Arc<dyn Interactive>,
        arguments: Value,
        resolution: Resolution,
    },
}

impl Execution {
    /// Execution for a call whose permission was granted
    pub fn approved(tool: &RegisteredTool, arguments: Value) -> Self {
        match &tool.capability {
            Capability::PermissionAware(gated) => Self::Approved {
                tool: gated.clone(),
                arguments,
            },
            _ => Self::Plain {
                tool: tool.tool.clone(),
                arguments,
            },
        }
    }

    pub fn arguments(&self) -> &Value {
        match self {
            Self::Plain { arguments, .. }
            | Self::Approved { arguments, .. }
            | Self::WithResponse { arguments, .. } => arguments,
        }
    }

    /// Run the call. A panic inside the tool becomes an error result.
    pub async fn run(
        self,
        tool_call_id: &str,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> ToolResult {
        let future = async move {
            match self {
                Self::Plain { tool, arguments } => {
                    tool.execute_with_progress(tool_call_id, arguments, cancel, progress)
                        .await
                }
                Self::Approved { tool, arguments } => {
                    tool.execute_approved(tool_call_id, arguments, cancel).await
                }
                Self::WithResponse {
                    tool,
                    arguments,
                    resolution,
                } => {
                    tool.execute_with_response(tool_call_id, arguments, &resolution, cancel)
                        .await
                }
            }
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&payload);
                tracing::warn!("Tool call {} panicked: {}", tool_call_id, message);
                ToolResult::error(format!("Tool panicked: {}", message))
            }
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What to do with one call
pub enum CallPlan {
    Execute(Execution),
    /// Finished without running: unknown tool, bad arguments, denial
    Reject(ToolResult),
    /// Suspend until the human answers
    Interact {
        request: InteractionRequest,
        route: InteractionRoute,
    },
}

/// Parse, validate and authorize one call
pub fn plan_call(call: &ToolCall, registry: &ToolRegistry, arbiter: &PermissionArbiter) -> CallPlan {
    let Some(tool) = registry.get(&call.name) else {
        return CallPlan::Reject(ToolResult::error(format!("Tool not found: {}", call.name)));
    };
    let arguments = match parse_arguments(&call.arguments) {
        Ok(arguments) => arguments,
        Err(e) => return CallPlan::Reject(ToolResult::error(e)),
    };
    if let Err(e) = tool.validate(&arguments) {
        return CallPlan::Reject(ToolResult::error(e));
    }

    // Interactive tools go to the human before any policy check
    if let Capability::Interactive(interactive) = &tool.capability {
        if interactive.requires_interaction(&arguments) {
            return match interactive.prepare_interaction(&call.id, &arguments) {
                Ok(request) => CallPlan::Interact {
                    request,
                    route: InteractionRoute::Interactive,
                },
                Err(e) => CallPlan::Reject(ToolResult::error(e)),
            };
        }
    }

    let subject = subject_for(tool, &arguments);
    match arbiter.authorize(&subject) {
        Authorization::Deny { reason } => CallPlan::Reject(ToolResult::error(reason)),
        Authorization::Allow => CallPlan::Execute(Execution::approved(tool, arguments)),
        Authorization::Ask => {
            let prompt = match &tool.capability {
                Capability::PermissionAware(gated) => gated.prepare_permission(&call.id, &arguments),
                _ => permission_prompt(tool, &call.id, &arguments),
            };
            CallPlan::Interact {
                request: InteractionRequest::Permission(prompt),
                route: InteractionRoute::Permission,
            }
        }
    }
}

/// Generic permission prompt for tools without their own
pub fn permission_prompt(tool: &RegisteredTool, tool_call_id: &str, arguments: &Value) -> PermissionPrompt {
    let label = tool.tool.label();
    let summary = match ["command", "path", "file_path", "url"]
        .iter()
        .find_map(|key| arguments.get(*key).and_then(Value::as_str))
    {
        Some(target) => format!("{}: {}", label, target),
        None => format!("{} {}", label, arguments),
    };
    PermissionPrompt {
        tool_name: tool.name().to_string(),
        tool_call_id: tool_call_id.to_string(),
        summary,
        arguments: arguments.clone(),
        category: tool.tool.category(),
    }
}

/// Bookkeeping for one batch
pub struct Batch {
    calls: Vec<ToolCall>,
    mode: DispatchMode,
    /// Next call to plan
    cursor: usize,
    /// Planned sequential executions not yet started
    ready: VecDeque<(usize, Execution)>,
    in_flight: HashSet<usize>,
    results: HashMap<usize, ToolResult>,
}

impl Batch {
    pub fn new(calls: Vec<ToolCall>, mode: DispatchMode) -> Self {
        Self {
            calls,
            mode,
            cursor: 0,
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            results: HashMap::new(),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls.iter().map(|c| c.id.clone()).collect()
    }

    /// Next call to plan, in order
    pub fn next_to_plan(&mut self) -> Option<(usize, ToolCall)> {
        let index = self.cursor;
        let call = self.calls.get(index)?.clone();
        self.cursor += 1;
        Some((index, call))
    }

    pub fn planning_done(&self) -> bool {
        self.cursor >= self.calls.len()
    }

    /// Queue a sequential execution until every decision in the batch is made
    pub fn enqueue(&mut self, index: usize, execution: Execution) {
        self.ready.push_back((index, execution));
    }

    /// Next queued execution, only when nothing else is running
    pub fn next_ready(&mut self) -> Option<(usize, ToolCall, Execution)> {
        if !self.in_flight.is_empty() {
            return None;
        }
        let (index, execution) = self.ready.pop_front()?;
        let call = self.calls.get(index)?.clone();
        Some((index, call, execution))
    }

    pub fn mark_started(&mut self, index: usize) {
        self.in_flight.insert(index);
    }

    /// Record a result. Rejects unknown indices, mismatched ids and
    /// duplicates.
    pub fn record(&mut self, index: usize, tool_call_id: &str, result: ToolResult) -> bool {
        match self.calls.get(index) {
            Some(call) if call.id == tool_call_id => {}
            _ => return false,
        }
        if self.results.contains_key(&index) {
            return false;
        }
        self.in_flight.remove(&index);
        self.results.insert(index, result);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() == self.calls.len()
    }

    /// Ids of calls that have no result yet
    pub fn missing(&self) -> Vec<String> {
        self.calls
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.results.contains_key(i))
            .map(|(_, c)| c.id.clone())
            .collect()
    }

    /// Give every call without a result an error result. Planning stops and
    /// queued executions are dropped.
    pub fn fail_remaining(&mut self, reason: &str) {
        self.cursor = self.calls.len();
        self.ready.clear();
        self.in_flight.clear();
        for index in 0..self.calls.len() {
            self.results
                .entry(index)
                .or_insert_with(|| ToolResult::error(reason));
        }
    }

    /// Tool-result messages in original call order
    pub fn into_messages(mut self) -> Vec<Message> {
        self.calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                let result = self
                    .results
                    .remove(&index)
                    .unwrap_or_else(|| ToolResult::error(CANCELLED_BY_USER));
                Message::tool_result(call.id, call.name, result.content, result.is_error)
            })
            .collect()
    }
}
