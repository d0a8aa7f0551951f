//! Core message types shared by the model stream and the conversation log

use serde::{Deserialize, Serialize};

/// Model definition as far as orchestration cares about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Provider-reported context window, if known
    #[serde(default)]
    pub context_window: Option<u32>,
    /// Maximum output tokens
    pub max_tokens: u32,
}

impl ModelInfo {
    /// Create a model description with an unknown context window
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            context_window: None,
            max_tokens: 8192,
        }
    }

    /// Set the provider-reported context window
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
    /// Thinking/reasoning tokens
    pub thinking: u32,
}

impl Usage {
    /// Tokens the model had to read for this response
    pub fn context_tokens(&self) -> u32 {
        self.input.saturating_add(self.cache_read)
    }

    /// Fold another usage record into this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.thinking += other.thinking;
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// Tool use requested
    ToolUse,
    /// Error occurred
    Error,
    /// Request was aborted
    Aborted,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, unique within the conversation
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arguments as sent by the model
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Content types in messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Text content
    Text { text: String },
    /// Image attachment (base64 encoded)
    Image { data: String, mime_type: String },
    /// Thinking/reasoning content
    Thinking { thinking: String },
    /// Tool call request
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

impl Content {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content from base64 data
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create thinking content
    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }

    /// Create a tool call
    pub fn tool_call(call: &ToolCall) -> Self {
        Self::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Marks a user message as the carry-forward summary produced by compaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryInfo {
    /// Number of messages the summary replaced
    pub original_message_count: usize,
}

/// Severity of a notice message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// User message
    User {
        content: Vec<Content>,
        #[serde(default)]
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<SummaryInfo>,
    },
    /// Assistant response
    Assistant {
        content: Vec<Content>,
        #[serde(flatten)]
        metadata: AssistantMetadata,
    },
    /// Tool result
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<Content>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        timestamp: i64,
    },
    /// Runtime notice shown to the human, never sent to the model
    Notice {
        text: String,
        level: NoticeLevel,
        #[serde(default)]
        timestamp: i64,
    },
}

/// Metadata for assistant messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMetadata {
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
    /// Inline annotation for a stream that failed mid-turn
    pub error_message: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Message {
    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::user_with_content(vec![Content::text(text)])
    }

    /// Create a user message with multiple content blocks
    pub fn user_with_content(content: Vec<Content>) -> Self {
        Self::User {
            content,
            timestamp: now_millis(),
            summary: None,
        }
    }

    /// Create the carry-forward summary message that replaces a compacted log
    pub fn summary(text: impl Into<String>, original_message_count: usize) -> Self {
        Self::User {
            content: vec![Content::text(text)],
            timestamp: now_millis(),
            summary: Some(SummaryInfo {
                original_message_count,
            }),
        }
    }

    /// Create an empty assistant message, used as the streaming placeholder
    pub fn assistant_empty(model: Option<String>) -> Self {
        Self::Assistant {
            content: vec![],
            metadata: AssistantMetadata {
                model,
                timestamp: now_millis(),
                ..Default::default()
            },
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Vec<Content>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content,
            is_error,
            timestamp: now_millis(),
        }
    }

    /// Create a notice
    pub fn notice(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self::Notice {
            text: text.into(),
            level,
            timestamp: now_millis(),
        }
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
            Self::Notice { .. } => "notice",
        }
    }

    /// Get the content blocks (notices have none)
    pub fn content(&self) -> &[Content] {
        match self {
            Self::User { content, .. } => content,
            Self::Assistant { content, .. } => content,
            Self::ToolResult { content, .. } => content,
            Self::Notice { .. } => &[],
        }
    }

    /// Extract all tool calls from an assistant message
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        match self {
            Self::Assistant { content, .. } => content
                .iter()
                .filter_map(|c| match c {
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Some(ToolCall::new(id, name, arguments.clone())),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        match self {
            Self::Notice { text, .. } => text.clone(),
            _ => self
                .content()
                .iter()
                .filter_map(|c| c.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Get combined reasoning content
    pub fn thinking(&self) -> String {
        self.content()
            .iter()
            .filter_map(|c| match c {
                Content::Thinking { thinking } => Some(thinking.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether this message is part of the model's context
    pub fn is_model_visible(&self) -> bool {
        !matches!(self, Self::Notice { .. })
    }

    /// Whether this is a compaction summary
    pub fn is_summary(&self) -> bool {
        matches!(self, Self::User { summary: Some(_), .. })
    }

    /// Whether this is a tool result flagged as an error
    pub fn is_error_result(&self) -> bool {
        matches!(self, Self::ToolResult { is_error: true, .. })
    }
}

/// Tool definition sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_calls_extracted_in_order() {
        let msg = Message::Assistant {
            content: vec![
                Content::text("looking"),
                Content::tool_call(&ToolCall::new("a", "glob", json!({"pattern": "*"}))),
                Content::tool_call(&ToolCall::new("b", "read", json!({"path": "x"}))),
            ],
            metadata: AssistantMetadata::default(),
        };
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].name, "read");
    }

    #[test]
    fn test_notice_is_not_model_visible() {
        let notice = Message::notice(NoticeLevel::Info, "compacting");
        assert!(!notice.is_model_visible());
        assert_eq!(notice.text(), "compacting");
        assert!(Message::user("hi").is_model_visible());
    }

    #[test]
    fn test_summary_round_trips_through_serde() {
        let msg = Message::summary("what happened", 12);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(back.is_summary());
        assert_eq!(back, msg);
    }

    #[test]
    fn test_image_attachment_round_trips_through_serde() {
        let msg = Message::user_with_content(vec![
            Content::text("what is this?"),
            Content::image("iVBORw0KGgo=", "image/png"),
        ]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][1]["type"], "image");
        assert_eq!(json["content"][1]["mime_type"], "image/png");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.text(), "what is this?");
    }

    #[test]
    fn test_plain_user_message_omits_summary_field() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("summary").is_none());
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn test_usage_accumulate_and_context_tokens() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input: 100,
            cache_read: 50,
            output: 10,
            ..Default::default()
        });
        total.accumulate(&Usage {
            input: 1,
            ..Default::default()
        });
        assert_eq!(total.input, 101);
        assert_eq!(total.context_tokens(), 151);
    }
}
