//! relay-agent: turn orchestration core
//!
//! This crate owns the state machine that sits between a human, a model, and a
//! set of tools: it streams responses, dispatches tool batches sequentially or
//! in parallel, consults the permission arbiter, suspends on interaction
//! requests, and compacts history when the context window fills up.

pub mod compaction;
pub mod controller;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handle;
pub mod interaction;
pub mod permission;
pub mod registry;
pub mod tool;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use compaction::{CompactionConfig, CompactionReason, TokenBudget};
pub use controller::{ControllerConfig, TurnController, TurnState};
pub use conversation::ConversationLog;
pub use dispatch::DispatchMode;
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use handle::ControllerHandle;
pub use interaction::{InteractionRequest, Resolution};
pub use permission::{
    Decision, HookEngine, OperatingMode, PermissionArbiter, RuleSet, SettingsStore, ToolCategory,
};
pub use registry::ToolRegistry;
pub use tool::{Interactive, PermissionAware, ProgressSender, Tool, ToolResult};
pub use transport::{StreamRequest, Transport};
