//! Controller event types

use relay_ai::{Message, NoticeLevel, Usage};
use serde::{Deserialize, Serialize};

use crate::compaction::CompactionReason;
use crate::controller::TurnState;
use crate::dispatch::DispatchMode;
use crate::interaction::{InteractionRequest, Resolution};
use crate::permission::OperatingMode;

/// Events broadcast by the turn controller for renderers and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The controller moved between states
    StateChanged { from: TurnState, to: TurnState },

    /// Assistant placeholder appended, streaming started
    MessageStart { message: Message },

    /// Placeholder updated with a new fragment
    MessageUpdate { message: Message },

    /// Assistant message finalized
    MessageEnd { message: Message },

    /// Tool execution started
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution progress update (emitted by tools during execution)
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// A batch of tool calls is about to be dispatched
    DispatchStarted { mode: DispatchMode, call_count: usize },

    /// Every result of a batch was appended to the log
    BatchComplete { call_ids: Vec<String> },

    /// Dispatch is suspended until the boundary resolves this request
    InteractionRequested {
        id: String,
        tool_call_id: String,
        request: InteractionRequest,
    },

    /// The pending interaction was resolved
    InteractionResolved { id: String, resolution: Resolution },

    /// The operating mode changed; session overrides were cleared
    ModeChanged {
        from: OperatingMode,
        to: OperatingMode,
    },

    /// Context usage after a completed response
    ContextUsage {
        input_tokens: u32,
        limit: Option<u32>,
        percent: f64,
        should_warn: bool,
    },

    /// Context compaction started
    CompactionStart { reason: CompactionReason },

    /// Context compaction completed
    CompactionEnd {
        messages_before: usize,
        tokens_before: u32,
    },

    /// Summarization failed; the log is unchanged
    CompactionFailed { message: String },

    /// Human-facing notice that is not part of the log
    Notice { level: NoticeLevel, text: String },

    /// A turn finished without a further continuation request
    TurnEnd { total_usage: Usage },

    /// Controller is idle and accepting input
    Idle,

    /// Error occurred
    Error { message: String },
}

impl AgentEvent {
    pub fn notice(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self::Notice {
            level,
            text: text.into(),
        }
    }
}
