//! Streaming fragment types and the assistant message builder

use crate::types::{AssistantMetadata, Content, Message, StopReason, ToolCall, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Marker appended to assistant text when the human interrupts a response
pub const INTERRUPTED_MARKER: &str = "[Interrupted]";

/// One fragment of a model response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Visible text delta
    TextDelta { delta: String },
    /// Reasoning/thinking delta
    ReasoningDelta { delta: String },
    /// The model started emitting a tool call
    ToolCallStart { id: String, name: String },
    /// Response finished; carries the complete tool calls
    Done {
        tool_calls: Vec<ToolCall>,
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Transport or provider failure
    Error { message: String },
}

impl StreamEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// A stream of response fragments. Closes on completion or cancellation.
pub type ModelStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Debug)]
enum Block {
    Text(String),
    Thinking(String),
    /// Announced by `ToolCallStart`; replaced by the final call on `Done`
    PendingCall { id: String, name: String },
    Call(ToolCall),
}

/// Folds stream fragments into an assistant message
#[derive(Debug, Default)]
pub struct AssistantBuilder {
    model: Option<String>,
    blocks: Vec<Block>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    timestamp: i64,
}

impl AssistantBuilder {
    /// Create a builder for a response from `model`
    pub fn new(model: Option<String>) -> Self {
        Self {
            model,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Apply one fragment
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { delta } => match self.blocks.last_mut() {
                Some(Block::Text(text)) => text.push_str(delta),
                _ => self.blocks.push(Block::Text(delta.clone())),
            },
            StreamEvent::ReasoningDelta { delta } => match self.blocks.last_mut() {
                Some(Block::Thinking(thinking)) => thinking.push_str(delta),
                _ => self.blocks.push(Block::Thinking(delta.clone())),
            },
            StreamEvent::ToolCallStart { id, name } => {
                self.blocks.push(Block::PendingCall {
                    id: id.clone(),
                    name: name.clone(),
                });
            }
            StreamEvent::Done {
                tool_calls,
                stop_reason,
                usage,
            } => {
                self.blocks
                    .retain(|b| !matches!(b, Block::PendingCall { .. }));
                self.blocks
                    .extend(tool_calls.iter().cloned().map(Block::Call));
                self.stop_reason = Some(*stop_reason);
                self.usage = usage.clone();
            }
            StreamEvent::Error { .. } => {}
        }
    }

    /// Names of tool calls announced but not yet finalized
    pub fn pending_tool_names(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::PendingCall { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Usage reported by the `Done` fragment
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Current partial message. Announced-but-unfinished tool calls are left
    /// out so a partial message never carries calls without arguments.
    pub fn snapshot(&self) -> Message {
        Message::Assistant {
            content: self.content(),
            metadata: self.metadata(),
        }
    }

    /// Build the final message
    pub fn finish(self) -> Message {
        self.snapshot()
    }

    /// Build the message for a response the human interrupted
    pub fn interrupt(mut self) -> Message {
        self.blocks
            .retain(|b| !matches!(b, Block::PendingCall { .. }));
        let has_calls = self.blocks.iter().any(|b| matches!(b, Block::Call(_)));
        if !has_calls {
            if !self.blocks.iter().any(|b| matches!(b, Block::Text(_))) {
                self.blocks.push(Block::Text(String::new()));
            }
            let last_text = self.blocks.iter_mut().rev().find_map(|b| match b {
                Block::Text(text) => Some(text),
                _ => None,
            });
            if let Some(text) = last_text {
                if !text.trim().is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(INTERRUPTED_MARKER);
            }
        }
        self.stop_reason = Some(StopReason::Aborted);
        self.snapshot()
    }

    /// Build the message for a response whose stream failed
    pub fn fail(mut self, error: impl Into<String>) -> Message {
        self.blocks
            .retain(|b| !matches!(b, Block::PendingCall { .. } | Block::Call(_)));
        self.stop_reason = Some(StopReason::Error);
        let mut metadata = self.metadata();
        metadata.error_message = Some(error.into());
        Message::Assistant {
            content: self.content(),
            metadata,
        }
    }

    fn content(&self) -> Vec<Content> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text(text) => Some(Content::text(text.clone())),
                Block::Thinking(thinking) => Some(Content::thinking(thinking.clone())),
                Block::Call(call) => Some(Content::tool_call(call)),
                Block::PendingCall { .. } => None,
            })
            .collect()
    }

    fn metadata(&self) -> AssistantMetadata {
        AssistantMetadata {
            model: self.model.clone(),
            usage: self.usage.clone(),
            stop_reason: self.stop_reason,
            error_message: None,
            timestamp: self.timestamp,
        }
    }
}
