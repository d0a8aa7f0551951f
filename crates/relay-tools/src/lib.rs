//! Built-in tools for the relay agent
//!
//! File and shell tools are plain [`Tool`](relay_agent::Tool)s whose
//! category and default decision drive the permission arbiter. `web_fetch`
//! gates itself per URL, and the question and plan-mode tools suspend the
//! turn until the human answers.

mod ask;
mod bash;
mod edit;
mod fetch;
mod glob;
mod grep;
mod list;
mod paths;
mod plan;
mod read;
mod write;

use std::path::PathBuf;

use relay_agent::ToolRegistry;

pub use ask::AskUserQuestionTool;
pub use bash::BashTool;
pub use edit::EditTool;
pub use fetch::WebFetchTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use list::ListTool;
pub use plan::{EnterPlanModeTool, ExitPlanModeTool};
pub use read::ReadTool;
pub use write::WriteTool;

/// Settings shared by the built-in tools
#[derive(Debug, Clone)]
pub struct ToolOptions {
    /// Directory relative paths resolve against
    pub cwd: PathBuf,
    /// Hosts `web_fetch` may reach without asking
    pub trusted_domains: Vec<String>,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            trusted_domains: Vec::new(),
        }
    }
}

/// Registry with every built-in tool
pub fn builtin_registry(options: &ToolOptions) -> ToolRegistry {
    let cwd = &options.cwd;
    let mut registry = ToolRegistry::new();
    registry.register(ReadTool::new(cwd));
    registry.register(WriteTool::new(cwd));
    registry.register(EditTool::new(cwd));
    registry.register(GlobTool::new(cwd));
    registry.register(GrepTool::new(cwd));
    registry.register(ListTool::new(cwd));
    registry.register(BashTool::new(cwd));
    registry.register_permission_aware(
        WebFetchTool::new().with_trusted_domains(options.trusted_domains.clone()),
    );
    registry.register_interactive(AskUserQuestionTool);
    registry.register_interactive(EnterPlanModeTool);
    registry.register_interactive(ExitPlanModeTool);
    registry
}
