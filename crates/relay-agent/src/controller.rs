//! Turn controller
//!
//! A single event loop owns the conversation log, the permission arbiter and
//! the in-flight turn. Stream reads, tool executions and summarization run as
//! spawned tasks that each report back with exactly one [`LoopEvent`]; all
//! state changes happen inside event handling, one event at a time.
//!
//! Every task result carries the id of the turn (or compaction job) that
//! spawned it. Once a turn is cancelled or replaced its id no longer matches
//! and late results are dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use relay_ai::{AssistantBuilder, Content, Message, ModelInfo, ModelStream, NoticeLevel, StreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compaction::{self, CompactionConfig, CompactionReason, TokenBudget};
use crate::conversation::ConversationLog;
use crate::dispatch::{
    self, Batch, CANCELLED_BY_USER, CallPlan, DispatchMode, Execution, PERMISSION_DENIED,
    QUESTION_CANCELLED,
};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::handle::ControllerHandle;
use crate::interaction::{
    EnterPlanResolution, InteractionBridge, InteractionRequest, InteractionRoute,
    PendingInteraction, PermissionAnswer, PlanResolution, QuestionResolution, Resolution,
};
use crate::permission::{OperatingMode, PermissionArbiter, ToolCategory};
use crate::registry::{Capability, RegisteredTool, ToolRegistry};
use crate::tool::{ProgressSender, ToolResult};
use crate::transport::{self, StreamRequest, Transport};

const PLAN_REJECTED: &str =
    "User rejected the plan. Ask what should change, or take a different approach.";
const ENTER_PLAN_DECLINED: &str =
    "User declined to enter plan mode. Continue with the task in normal mode.";
const OVERFLOW_HINT: &str =
    "The conversation no longer fits in the model's context window. Compact it and resubmit.";

const PLAN_MODE_PROMPT: &str = "\n\nPlan mode is active. You may only read and search; \
do not modify files or run commands. When the plan is ready, present it with exit_plan_mode.";

/// Controller lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Streaming,
    AwaitingToolResults,
    AwaitingInteraction,
    Compacting,
}

/// Inbound events, from the boundary or from spawned tasks
pub(crate) enum LoopEvent {
    Submit(Vec<Content>),
    Cancel,
    Resolve {
        id: String,
        resolution: Resolution,
    },
    Compact {
        focus: Option<String>,
    },
    SetMode(OperatingMode),
    Shutdown,
    StreamOpened {
        turn: u64,
        result: relay_ai::Result<ModelStream>,
    },
    Fragment {
        turn: u64,
        event: Option<StreamEvent>,
        stream: ModelStream,
    },
    ToolFinished {
        turn: u64,
        index: usize,
        call_id: String,
        tool_name: String,
        result: ToolResult,
    },
    CompactionFinished {
        job: u64,
        result: std::result::Result<String, String>,
    },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub system_prompt: String,
    pub model: ModelInfo,
    pub compaction: CompactionConfig,
}

impl ControllerConfig {
    pub fn new(model: ModelInfo) -> Self {
        Self {
            system_prompt: String::new(),
            model,
            compaction: CompactionConfig::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }
}

/// What happens once the current batch is committed
#[derive(Debug, Clone, PartialEq, Eq)]
enum AfterBatch {
    /// Send the results back to the model
    Continue,
    EndTurn,
    /// Clear history and start over from an approved plan
    RestartWithPlan(String),
}

/// The in-flight model response and the batch it produced
struct Turn {
    id: u64,
    cancel: CancellationToken,
    builder: Option<AssistantBuilder>,
    batch: Option<Batch>,
    after: AfterBatch,
}

struct CompactionJob {
    id: u64,
    cancel: CancellationToken,
    messages_before: usize,
    tokens_before: u32,
}

pub struct TurnController {
    config: ControllerConfig,
    transport: Arc<dyn Transport>,
    registry: ToolRegistry,
    arbiter: PermissionArbiter,
    log: ConversationLog,
    state: TurnState,
    turn: Option<Turn>,
    compaction: Option<CompactionJob>,
    bridge: InteractionBridge,
    queued: VecDeque<Vec<Content>>,
    plan_task: Option<String>,
    next_id: u64,
    tx: mpsc::UnboundedSender<LoopEvent>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    events: broadcast::Sender<AgentEvent>,
}

impl TurnController {
    pub fn new(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        registry: ToolRegistry,
        arbiter: PermissionArbiter,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            transport,
            registry,
            arbiter,
            log: ConversationLog::new(),
            state: TurnState::Idle,
            turn: None,
            compaction: None,
            bridge: InteractionBridge::new(),
            queued: VecDeque::new(),
            plan_task: None,
            next_id: 0,
            tx,
            rx,
            events,
        }
    }

    /// Cloneable handle for feeding the loop from other tasks
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.tx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn mode(&self) -> OperatingMode {
        self.arbiter.mode()
    }

    pub fn arbiter(&self) -> &PermissionArbiter {
        &self.arbiter
    }

    pub fn pending_interaction(&self) -> Option<&PendingInteraction> {
        self.bridge.pending()
    }

    /// Task recorded when the session entered plan mode
    pub fn plan_task(&self) -> Option<&str> {
        self.plan_task.as_deref()
    }

    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget::new(
            self.log.last_input_tokens(),
            self.config.compaction.context_window,
            self.config.model.context_window,
        )
    }

    pub fn allow_category_for_session(&mut self, category: ToolCategory) {
        self.arbiter.allow_category_for_session(category);
    }

    pub fn allow_tool_for_session(&mut self, tool: impl Into<String>) {
        self.arbiter.allow_tool_for_session(tool);
    }

    /// Replace the log with a persisted one
    pub fn set_messages(&mut self, messages: Vec<Message>) -> Result<()> {
        if self.state != TurnState::Idle {
            return Err(Error::InvalidState {
                action: "restore messages",
                state: self.state,
            });
        }
        self.log = ConversationLog::from_messages(messages)?;
        Ok(())
    }

    // --- Boundary operations ---

    pub fn submit(&mut self, text: impl Into<String>) {
        self.submit_content(vec![Content::text(text)]);
    }

    /// Start a turn, or queue the input until the controller is idle
    pub fn submit_content(&mut self, content: Vec<Content>) {
        if self.state == TurnState::Idle {
            self.start_user_turn(content);
        } else {
            debug!("Queueing input while {:?}", self.state);
            self.queued.push_back(content);
        }
    }

    /// Stop whatever is in progress. Safe to call at any time.
    pub fn cancel(&mut self) {
        match self.state {
            TurnState::Idle => {
                debug!("Cancel while idle, nothing to do");
                return;
            }
            TurnState::Streaming => {
                if let Some(mut turn) = self.turn.take() {
                    turn.cancel.cancel();
                    if let Some(builder) = turn.builder.take() {
                        let message = builder.interrupt();
                        self.log.update_last_assistant(message.clone());
                        self.emit(AgentEvent::MessageEnd { message });
                    }
                }
            }
            TurnState::AwaitingToolResults | TurnState::AwaitingInteraction => {
                self.bridge.clear();
                if let Some(mut turn) = self.turn.take() {
                    turn.cancel.cancel();
                    if let Some(mut batch) = turn.batch.take() {
                        batch.fail_remaining(CANCELLED_BY_USER);
                        let call_ids = batch.call_ids();
                        match self.log.append_results(batch.into_messages()) {
                            Ok(()) => self.emit(AgentEvent::BatchComplete { call_ids }),
                            Err(e) => self.report_error(e.to_string()),
                        }
                    }
                }
            }
            TurnState::Compacting => {
                if let Some(job) = self.compaction.take() {
                    job.cancel.cancel();
                }
                self.emit(AgentEvent::notice(NoticeLevel::Info, "Compaction cancelled"));
            }
        }

        info!("Cancelled while {:?}", self.state);
        if !self.queued.is_empty() {
            debug!("Dropping {} queued inputs", self.queued.len());
            self.queued.clear();
        }
        self.set_state(TurnState::Idle);
        self.emit(AgentEvent::Idle);
    }

    /// Answer the pending interaction. An invalid answer is rejected and the
    /// interaction stays pending.
    pub fn resolve(&mut self, id: &str, resolution: Resolution) -> Result<()> {
        if self.state != TurnState::AwaitingInteraction {
            return Err(Error::InvalidState {
                action: "resolve an interaction",
                state: self.state,
            });
        }
        let pending = self.bridge.resolve(id, &resolution)?;
        self.emit(AgentEvent::InteractionResolved {
            id: pending.id.clone(),
            resolution: resolution.clone(),
        });
        self.set_state(TurnState::AwaitingToolResults);

        let PendingInteraction {
            call_index: index,
            call,
            request,
            route,
            ..
        } = pending;
        let Some(tool) = self.registry.get(&call.name).cloned() else {
            let result = ToolResult::error(format!("Tool not found: {}", call.name));
            self.record_result(index, &call.id, &call.name, result);
            self.advance_batch();
            return Ok(());
        };
        let arguments = dispatch::parse_arguments(&call.arguments).unwrap_or_else(|_| json!({}));

        match (route, resolution) {
            (InteractionRoute::Permission, Resolution::Permission(answer)) => match answer {
                PermissionAnswer::Approve => {
                    self.queue_execution(index, Execution::approved(&tool, arguments));
                }
                PermissionAnswer::ApproveForSession => {
                    self.arbiter
                        .remember_approval(&dispatch::subject_for(&tool, &arguments));
                    self.queue_execution(index, Execution::approved(&tool, arguments));
                }
                PermissionAnswer::Deny => {
                    self.record_result(index, &call.id, &call.name, ToolResult::error(PERMISSION_DENIED));
                    self.abandon_batch();
                    return Ok(());
                }
            },
            (InteractionRoute::Interactive, resolution) => {
                if !self.resolve_interactive(index, &call.id, &call.name, &tool, arguments, request, resolution) {
                    return Ok(());
                }
            }
            (InteractionRoute::Permission, other) => {
                warn!("Unexpected resolution for a permission prompt: {:?}", other);
                self.record_result(index, &call.id, &call.name, ToolResult::error(PERMISSION_DENIED));
            }
        }

        self.advance_batch();
        Ok(())
    }

    /// Summarize the conversation now. Only allowed while idle.
    pub fn compact(&mut self, focus: Option<String>) -> Result<()> {
        if self.state != TurnState::Idle {
            return Err(Error::InvalidState {
                action: "compact",
                state: self.state,
            });
        }
        if self.log.model_context().is_empty() {
            return Err(Error::Compaction("Nothing to compact".to_string()));
        }
        self.start_compaction(CompactionReason::Manual, focus.as_deref());
        Ok(())
    }

    /// Switch operating mode; clears session overrides
    pub fn set_mode(&mut self, mode: OperatingMode) {
        if let Some(previous) = self.arbiter.set_mode(mode) {
            info!("Mode {:?} -> {:?}", previous, mode);
            if previous == OperatingMode::Plan {
                self.plan_task = None;
            }
            self.emit(AgentEvent::ModeChanged {
                from: previous,
                to: mode,
            });
        }
    }

    // --- Event loop ---

    /// Handle one event. Returns false once the loop should stop.
    pub async fn step(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => self.handle_event(event),
            None => false,
        }
    }

    /// Run until idle (or waiting on the human) with nothing left to handle
    pub async fn run_until_settled(&mut self) {
        loop {
            let settled = matches!(
                self.state,
                TurnState::Idle | TurnState::AwaitingInteraction
            ) && self.rx.is_empty();
            if settled || !self.step().await {
                return;
            }
        }
    }

    /// Run until shut down through a handle
    pub async fn run(mut self) {
        while self.step().await {}
        debug!("Controller loop stopped");
    }

    fn handle_event(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::Submit(content) => self.submit_content(content),
            LoopEvent::Cancel => self.cancel(),
            LoopEvent::Resolve { id, resolution } => {
                if let Err(e) = self.resolve(&id, resolution) {
                    self.report_error(e.to_string());
                }
            }
            LoopEvent::Compact { focus } => {
                if let Err(e) = self.compact(focus) {
                    self.report_error(e.to_string());
                }
            }
            LoopEvent::SetMode(mode) => self.set_mode(mode),
            LoopEvent::Shutdown => {
                self.cancel();
                return false;
            }
            LoopEvent::StreamOpened { turn, result } => self.on_stream_opened(turn, result),
            LoopEvent::Fragment {
                turn,
                event,
                stream,
            } => self.on_fragment(turn, event, stream),
            LoopEvent::ToolFinished {
                turn,
                index,
                call_id,
                tool_name,
                result,
            } => self.on_tool_finished(turn, index, call_id, tool_name, result),
            LoopEvent::CompactionFinished { job, result } => {
                self.on_compaction_finished(job, result)
            }
        }
        true
    }

    // --- Streaming ---

    fn start_user_turn(&mut self, content: Vec<Content>) {
        self.log.push(Message::user_with_content(content));
        self.start_stream();
    }

    /// Request a response for the current log and append its placeholder
    fn start_stream(&mut self) {
        let id = self.allocate_id();
        let request = StreamRequest {
            messages: self.log.model_context(),
            system_prompt: self.system_prompt(),
            tools: self.registry.schemas(),
            model: self.config.model.id.clone(),
            max_tokens: self.config.model.max_tokens,
        };
        let model = Some(self.config.model.id.clone());
        let placeholder = Message::assistant_empty(model.clone());
        self.log.push(placeholder.clone());
        self.emit(AgentEvent::MessageStart {
            message: placeholder,
        });

        let cancel = CancellationToken::new();
        self.turn = Some(Turn {
            id,
            cancel: cancel.clone(),
            builder: Some(AssistantBuilder::new(model)),
            batch: None,
            after: AfterBatch::Continue,
        });
        self.set_state(TurnState::Streaming);

        let transport = self.transport.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = transport.stream(request, cancel).await;
            let _ = tx.send(LoopEvent::StreamOpened { turn: id, result });
        });
    }

    /// Wait for exactly one fragment, then hand the stream back to the loop
    fn spawn_read(&self, turn: u64, mut stream: ModelStream) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = stream.next().await;
            let _ = tx.send(LoopEvent::Fragment {
                turn,
                event,
                stream,
            });
        });
    }

    fn on_stream_opened(&mut self, turn: u64, result: relay_ai::Result<ModelStream>) {
        if !self.is_current(turn) || self.state != TurnState::Streaming {
            debug!("Ignoring stream opened for abandoned turn {}", turn);
            return;
        }
        match result {
            Ok(stream) => self.spawn_read(turn, stream),
            Err(e) => {
                let overflow = e.is_context_overflow();
                self.fail_stream(e.to_string(), overflow);
            }
        }
    }

    fn on_fragment(&mut self, turn: u64, event: Option<StreamEvent>, stream: ModelStream) {
        if !self.is_current(turn) || self.state != TurnState::Streaming {
            debug!("Ignoring fragment for abandoned turn {}", turn);
            return;
        }
        let event = match event {
            None => {
                self.fail_stream("Stream ended before the response completed".to_string(), false);
                return;
            }
            Some(StreamEvent::Error { message }) => {
                self.fail_stream(message, false);
                return;
            }
            Some(event) => event,
        };
        let Some(builder) = self.turn.as_mut().and_then(|t| t.builder.as_mut()) else {
            return;
        };
        builder.apply(&event);
        if matches!(event, StreamEvent::Done { .. }) {
            self.finish_stream();
            return;
        }
        let snapshot = builder.snapshot();
        self.log.update_last_assistant(snapshot.clone());
        self.emit(AgentEvent::MessageUpdate { message: snapshot });
        self.spawn_read(turn, stream);
    }

    /// Transport failure: annotate the placeholder and go idle without retrying.
    /// `overflow` marks an error the transport already classified as a
    /// context overflow; untyped messages are matched against known patterns.
    fn fail_stream(&mut self, message: String, overflow: bool) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        let builder = turn
            .builder
            .take()
            .unwrap_or_else(|| AssistantBuilder::new(Some(self.config.model.id.clone())));
        let unfinished = builder.pending_tool_names();
        if !unfinished.is_empty() {
            debug!("Dropping unfinished tool calls {:?}", unfinished);
        }
        let failed = builder.fail(message.clone());
        self.log.update_last_assistant(failed.clone());
        self.emit(AgentEvent::MessageEnd { message: failed });

        warn!("Stream failed: {}", message);
        self.emit(AgentEvent::Error {
            message: message.clone(),
        });
        if overflow || transport::is_context_overflow(&message) {
            self.log.push_notice(NoticeLevel::Warning, OVERFLOW_HINT);
            self.emit(AgentEvent::notice(NoticeLevel::Warning, OVERFLOW_HINT));
        }
        self.end_turn();
    }

    fn finish_stream(&mut self) {
        let Some(builder) = self.turn.as_mut().and_then(|t| t.builder.take()) else {
            return;
        };
        let usage = builder.usage().clone();
        let message = builder.finish();
        self.log.update_last_assistant(message.clone());
        self.log.record_usage(&usage);
        self.emit(AgentEvent::MessageEnd {
            message: message.clone(),
        });

        let calls = message.tool_calls();
        if calls.is_empty() {
            self.end_turn();
        } else {
            self.begin_batch(calls);
        }
    }

    // --- Dispatch ---

    fn begin_batch(&mut self, calls: Vec<relay_ai::ToolCall>) {
        let mode = dispatch::select_mode(&calls, &self.registry, &self.arbiter);
        debug!("Dispatching {} tool calls ({:?})", calls.len(), mode);
        self.emit(AgentEvent::DispatchStarted {
            mode,
            call_count: calls.len(),
        });
        if let Some(turn) = self.turn.as_mut() {
            turn.batch = Some(Batch::new(calls, mode));
        }
        self.set_state(TurnState::AwaitingToolResults);
        self.advance_batch();
    }

    /// Plan calls in order until one needs the human. Parallel batches start
    /// each execution as soon as it is planned; sequential batches run their
    /// executions one at a time once every decision in the batch is made.
    fn advance_batch(&mut self) {
        loop {
            let Some(turn) = self.turn.as_mut() else {
                return;
            };
            let turn_id = turn.id;
            let Some(batch) = turn.batch.as_mut() else {
                return;
            };
            let mode = batch.mode();
            let Some((index, call)) = batch.next_to_plan() else {
                break;
            };

            match dispatch::plan_call(&call, &self.registry, &self.arbiter) {
                CallPlan::Reject(result) => self.record_result(index, &call.id, &call.name, result),
                CallPlan::Execute(execution) => match mode {
                    DispatchMode::Parallel => self.start_execution(turn_id, index, call, execution),
                    DispatchMode::Sequential => self.queue_execution(index, execution),
                },
                CallPlan::Interact { .. } if mode == DispatchMode::Parallel => {
                    warn!("{} needs a decision inside a parallel batch", call.name);
                    let result = ToolResult::error(format!(
                        "{} needs a human decision and cannot run in a parallel batch",
                        call.name
                    ));
                    self.record_result(index, &call.id, &call.name, result);
                }
                CallPlan::Interact { request, route } => {
                    let event = {
                        let pending = self.bridge.suspend(index, call, request, route);
                        AgentEvent::InteractionRequested {
                            id: pending.id.clone(),
                            tool_call_id: pending.call.id.clone(),
                            request: pending.request.clone(),
                        }
                    };
                    self.set_state(TurnState::AwaitingInteraction);
                    self.emit(event);
                    return;
                }
            }
        }
        self.run_ready();
        self.try_commit();
    }

    fn queue_execution(&mut self, index: usize, execution: Execution) {
        if let Some(batch) = self.batch_mut() {
            batch.enqueue(index, execution);
        }
    }

    /// Start the next queued sequential execution if nothing is running
    fn run_ready(&mut self) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let turn_id = turn.id;
        let Some(batch) = turn.batch.as_mut() else {
            return;
        };
        if !batch.planning_done() {
            return;
        }
        if let Some((index, call, execution)) = batch.next_ready() {
            self.start_execution(turn_id, index, call, execution);
        }
    }

    fn start_execution(&mut self, turn_id: u64, index: usize, call: relay_ai::ToolCall, execution: Execution) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let cancel = turn.cancel.child_token();
        if let Some(batch) = turn.batch.as_mut() {
            batch.mark_started(index);
        }
        self.emit(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: execution.arguments().clone(),
        });

        let progress = ProgressSender::new(self.events.clone(), &call.id, &call.name);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = execution.run(&call.id, cancel, progress).await;
            let _ = tx.send(LoopEvent::ToolFinished {
                turn: turn_id,
                index,
                call_id: call.id,
                tool_name: call.name,
                result,
            });
        });
    }

    fn on_tool_finished(
        &mut self,
        turn: u64,
        index: usize,
        call_id: String,
        tool_name: String,
        result: ToolResult,
    ) {
        if !self.is_current(turn) {
            debug!("Ignoring result of abandoned call {}", call_id);
            return;
        }
        self.record_result(index, &call_id, &tool_name, result);
        if self.state == TurnState::AwaitingToolResults {
            self.run_ready();
            self.try_commit();
        }
    }

    fn record_result(&mut self, index: usize, call_id: &str, tool_name: &str, result: ToolResult) {
        self.emit(AgentEvent::ToolExecutionEnd {
            tool_call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            result: result.text_content(),
            is_error: result.is_error,
        });
        let Some(batch) = self.batch_mut() else {
            return;
        };
        if !batch.record(index, call_id, result) {
            warn!("Dropping unexpected result for call {}", call_id);
        }
    }

    fn try_commit(&mut self) {
        let complete = self
            .turn
            .as_ref()
            .and_then(|t| t.batch.as_ref())
            .is_some_and(|b| b.planning_done() && b.is_complete());
        if complete {
            self.commit_batch();
        }
    }

    /// Fail every call still without a result and end the turn
    fn abandon_batch(&mut self) {
        if let Some(turn) = self.turn.as_mut() {
            turn.after = AfterBatch::EndTurn;
            if let Some(batch) = turn.batch.as_mut() {
                batch.fail_remaining(CANCELLED_BY_USER);
            }
        }
        self.commit_batch();
    }

    /// Append every result of the batch in one write, then continue
    fn commit_batch(&mut self) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let Some(batch) = turn.batch.take() else {
            return;
        };
        let after = std::mem::replace(&mut turn.after, AfterBatch::Continue);
        let call_ids = batch.call_ids();
        if let Err(e) = self.log.append_results(batch.into_messages()) {
            self.report_error(e.to_string());
            self.end_turn();
            return;
        }
        self.emit(AgentEvent::BatchComplete { call_ids: call_ids.clone() });

        match after {
            AfterBatch::Continue if !self.log.has_all_results(&call_ids) => {
                self.report_error("Batch committed without a result for every call".to_string());
                self.end_turn();
            }
            AfterBatch::Continue => self.start_stream(),
            AfterBatch::EndTurn => self.end_turn(),
            AfterBatch::RestartWithPlan(plan) => {
                info!("Clearing {} messages to implement the approved plan", self.log.len());
                self.turn = None;
                self.log.replace_all(Vec::new());
                self.log.reset_usage();
                self.log
                    .push(Message::user(format!("Implement the following plan:\n\n{}", plan)));
                self.start_stream();
            }
        }
    }

    /// Apply an interactive tool's answer. Returns false if the batch was
    /// abandoned.
    #[allow(clippy::too_many_arguments)]
    fn resolve_interactive(
        &mut self,
        index: usize,
        call_id: &str,
        tool_name: &str,
        tool: &RegisteredTool,
        arguments: serde_json::Value,
        request: InteractionRequest,
        resolution: Resolution,
    ) -> bool {
        let Capability::Interactive(interactive) = &tool.capability else {
            self.record_result(index, call_id, tool_name, ToolResult::error("Tool is not interactive"));
            return true;
        };

        match &resolution {
            Resolution::Question(QuestionResolution::Cancelled) => {
                self.record_result(index, call_id, tool_name, ToolResult::error(QUESTION_CANCELLED));
                self.abandon_batch();
                return false;
            }
            Resolution::Plan(PlanResolution::Reject) => {
                self.record_result(index, call_id, tool_name, ToolResult::error(PLAN_REJECTED));
                self.set_mode(OperatingMode::Normal);
                self.abandon_batch();
                return false;
            }
            Resolution::Plan(PlanResolution::Resubmit(text)) => {
                let result = ToolResult::text(format!(
                    "The user edited the plan. Keep planning from this version and present \
                     it again with exit_plan_mode when ready:\n\n{}",
                    text
                ));
                self.record_result(index, call_id, tool_name, result);
                return true;
            }
            Resolution::Plan(choice) => {
                let mode = match choice {
                    PlanResolution::KeepContextAndAsk => OperatingMode::Normal,
                    _ => OperatingMode::AutoAccept,
                };
                self.set_mode(mode);
                if let (PlanResolution::ClearContextAndAutoAccept, InteractionRequest::Plan { plan }) =
                    (choice, &request)
                {
                    if let Some(turn) = self.turn.as_mut() {
                        turn.after = AfterBatch::RestartWithPlan(plan.clone());
                    }
                }
            }
            Resolution::EnterPlanMode(EnterPlanResolution::Approve) => {
                self.set_mode(OperatingMode::Plan);
                if let InteractionRequest::EnterPlanMode { task } = &request {
                    self.plan_task = Some(task.clone());
                }
            }
            Resolution::EnterPlanMode(EnterPlanResolution::Deny) => {
                self.record_result(index, call_id, tool_name, ToolResult::error(ENTER_PLAN_DECLINED));
                return true;
            }
            _ => {}
        }

        self.queue_execution(
            index,
            Execution::WithResponse {
                tool: interactive.clone(),
                arguments,
                resolution,
            },
        );
        true
    }

    // --- Idle and compaction ---

    fn end_turn(&mut self) {
        self.turn = None;
        self.emit(AgentEvent::TurnEnd {
            total_usage: self.log.total_usage().clone(),
        });
        self.enter_idle();
    }

    /// Check the token budget, then either compact or settle
    fn enter_idle(&mut self) {
        let budget = self.token_budget();
        let config = &self.config.compaction;
        self.emit(AgentEvent::ContextUsage {
            input_tokens: budget.last_input_tokens,
            limit: budget.limit,
            percent: budget.usage_percent(),
            should_warn: budget.should_warn(config),
        });
        if budget.should_auto_compact(config) && !self.log.is_empty() {
            info!(
                "Context at {:.0}%, compacting",
                budget.usage_percent() * 100.0
            );
            self.start_compaction(CompactionReason::Threshold, None);
            return;
        }
        self.settle_idle();
    }

    /// Go idle, or start the next queued input
    fn settle_idle(&mut self) {
        self.set_state(TurnState::Idle);
        match self.queued.pop_front() {
            Some(content) => self.start_user_turn(content),
            None => self.emit(AgentEvent::Idle),
        }
    }

    fn start_compaction(&mut self, reason: CompactionReason, focus: Option<&str>) {
        let id = self.allocate_id();
        let request = compaction::summary_request(
            &self.log,
            focus,
            &self.config.model.id,
            self.config.compaction.summary_max_tokens,
        );
        let cancel = CancellationToken::new();
        self.compaction = Some(CompactionJob {
            id,
            cancel: cancel.clone(),
            messages_before: self.log.len(),
            tokens_before: self.log.last_input_tokens(),
        });
        self.set_state(TurnState::Compacting);
        self.emit(AgentEvent::CompactionStart { reason });
        self.emit(AgentEvent::notice(NoticeLevel::Info, "Compacting conversation..."));

        let transport = self.transport.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = compaction::summarize(transport.as_ref(), request, cancel).await;
            let _ = tx.send(LoopEvent::CompactionFinished { job: id, result });
        });
    }

    fn on_compaction_finished(&mut self, job: u64, result: std::result::Result<String, String>) {
        let Some(current) = self.compaction.take_if(|j| j.id == job) else {
            debug!("Ignoring abandoned compaction {}", job);
            return;
        };
        match result {
            Ok(summary) => {
                compaction::apply_summary(&mut self.log, &summary);
                info!("Compacted {} messages", current.messages_before);
                self.emit(AgentEvent::CompactionEnd {
                    messages_before: current.messages_before,
                    tokens_before: current.tokens_before,
                });
            }
            Err(message) => {
                warn!("Compaction failed: {}", message);
                self.emit(AgentEvent::CompactionFailed {
                    message: message.clone(),
                });
                self.emit(AgentEvent::notice(
                    NoticeLevel::Error,
                    format!("Compaction failed: {}", message),
                ));
            }
        }
        self.settle_idle();
    }

    // --- Helpers ---

    fn system_prompt(&self) -> String {
        let mut prompt = self.config.system_prompt.clone();
        if self.arbiter.mode() == OperatingMode::Plan {
            prompt.push_str(PLAN_MODE_PROMPT);
            if let Some(task) = &self.plan_task {
                prompt.push_str(&format!("\nTask to plan: {}", task));
            }
        }
        prompt
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current(&self, turn: u64) -> bool {
        self.turn.as_ref().is_some_and(|t| t.id == turn)
    }

    fn batch_mut(&mut self) -> Option<&mut Batch> {
        self.turn.as_mut()?.batch.as_mut()
    }

    fn set_state(&mut self, to: TurnState) {
        if self.state != to {
            debug!("State {:?} -> {:?}", self.state, to);
            let from = std::mem::replace(&mut self.state, to);
            self.emit(AgentEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn report_error(&self, message: String) {
        warn!("{}", message);
        self.emit(AgentEvent::Error { message });
    }
}
