//! Tool capability traits
//!
//! Every tool implements [`Tool`]. Tools that gate themselves behind a
//! human decision additionally implement [`PermissionAware`] or
//! [`Interactive`]; the registry records which capability a tool was
//! registered with so dispatch can query it without downcasting.

use async_trait::async_trait;
use relay_ai::{Content, ToolSchema};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::AgentEvent;
use crate::interaction::{InteractionRequest, PermissionPrompt, Resolution};
use crate::permission::{Decision, ToolCategory};

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content to return to the model
    pub content: Vec<Content>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
    /// Optional structured details (for UI rendering)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
            details: None,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Sends `ToolExecutionUpdate` events for one running tool call
#[derive(Clone)]
pub struct ProgressSender {
    tx: broadcast::Sender<AgentEvent>,
    tool_call_id: String,
    tool_name: String,
}

impl ProgressSender {
    pub fn new(
        tx: broadcast::Sender<AgentEvent>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    pub fn send(&self, content: impl Into<String>) {
        let _ = self.tx.send(AgentEvent::ToolExecutionUpdate {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
    }
}

/// An executable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Human-readable label for UI
    fn label(&self) -> &str {
        self.name()
    }

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Category used by session overrides and operating modes
    fn category(&self) -> ToolCategory {
        ToolCategory::Other
    }

    /// Decision when no session override or persisted rule matches.
    /// `None` falls through to Ask.
    fn default_permission(&self) -> Option<Decision> {
        None
    }

    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;

    /// Execute with progress reporting. Defaults to `execute`.
    async fn execute_with_progress(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        _progress: ProgressSender,
    ) -> ToolResult {
        self.execute(tool_call_id, arguments, cancel).await
    }
}

/// A tool that asks for explicit permission regardless of persisted policy
#[async_trait]
pub trait PermissionAware: Send + Sync {
    fn requires_permission(&self, arguments: &serde_json::Value) -> bool;

    /// Build the prompt shown to the human
    fn prepare_permission(&self, tool_call_id: &str, arguments: &serde_json::Value)
    -> PermissionPrompt;

    /// Run after the human approved (or policy allowed) the call
    async fn execute_approved(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// A tool whose execution needs an answer from the human
#[async_trait]
pub trait Interactive: Send + Sync {
    fn requires_interaction(&self, _arguments: &serde_json::Value) -> bool {
        true
    }

    /// Build the request handed to the boundary. An `Err` becomes an error
    /// result without suspending.
    fn prepare_interaction(
        &self,
        tool_call_id: &str,
        arguments: &serde_json::Value,
    ) -> Result<InteractionRequest, String>;

    /// Finish the call with the human's validated answer
    async fn execute_with_response(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        resolution: &Resolution,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// Schema sent to the model for a tool
pub fn to_schema(tool: &dyn Tool) -> ToolSchema {
    ToolSchema::new(tool.name(), tool.description(), tool.parameters_schema())
}
