//! Plan mode entry and exit

use async_trait::async_trait;
use relay_agent::interaction::{EnterPlanResolution, PlanResolution};
use relay_agent::{InteractionRequest, Interactive, Resolution, Tool, ToolResult};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Asks the human to switch the session into read-only planning
pub struct EnterPlanModeTool;

#[async_trait]
impl Tool for EnterPlanModeTool {
    fn name(&self) -> &str {
        "enter_plan_mode"
    }

    fn label(&self) -> &str {
        "Plan mode"
    }

    fn description(&self) -> &str {
        "Ask the user to switch to plan mode before a large or ambiguous change. In plan mode only \
         read-only tools run; finish by presenting the plan with exit_plan_mode."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What will be planned"
                }
            }
        })
    }

    async fn execute(&self, _tool_call_id: &str, _arguments: Value, _cancel: CancellationToken) -> ToolResult {
        ToolResult::error("enter_plan_mode needs the user's approval")
    }
}

#[async_trait]
impl Interactive for EnterPlanModeTool {
    fn prepare_interaction(&self, _tool_call_id: &str, arguments: &Value) -> Result<InteractionRequest, String> {
        let task = arguments
            .get("task")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("the current task");
        Ok(InteractionRequest::EnterPlanMode {
            task: task.to_string(),
        })
    }

    async fn execute_with_response(
        &self,
        _tool_call_id: &str,
        _arguments: Value,
        resolution: &Resolution,
        _cancel: CancellationToken,
    ) -> ToolResult {
        match resolution {
            Resolution::EnterPlanMode(EnterPlanResolution::Approve) => ToolResult::text(
                "Plan mode is on. Explore with read-only tools, then present the plan with exit_plan_mode.",
            ),
            _ => ToolResult::error("The user did not approve plan mode"),
        }
    }
}

/// Presents a finished plan for approval
pub struct ExitPlanModeTool;

#[async_trait]
impl Tool for ExitPlanModeTool {
    fn name(&self) -> &str {
        "exit_plan_mode"
    }

    fn label(&self) -> &str {
        "Plan"
    }

    fn description(&self) -> &str {
        "Present the finished plan to the user for approval. Use only in plan mode, once the plan \
         is concrete enough to implement."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plan": {
                    "type": "string",
                    "description": "The plan, in markdown"
                }
            },
            "required": ["plan"]
        })
    }

    async fn execute(&self, _tool_call_id: &str, _arguments: Value, _cancel: CancellationToken) -> ToolResult {
        ToolResult::error("exit_plan_mode needs the user's decision")
    }
}

#[async_trait]
impl Interactive for ExitPlanModeTool {
    fn prepare_interaction(&self, _tool_call_id: &str, arguments: &Value) -> Result<InteractionRequest, String> {
        match arguments.get("plan").and_then(Value::as_str).map(str::trim) {
            Some(plan) if !plan.is_empty() => Ok(InteractionRequest::Plan {
                plan: plan.to_string(),
            }),
            _ => Err("The plan is empty".to_string()),
        }
    }

    async fn execute_with_response(
        &self,
        _tool_call_id: &str,
        _arguments: Value,
        resolution: &Resolution,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let Resolution::Plan(choice) = resolution else {
            return ToolResult::error("The plan was not answered");
        };
        match choice {
            PlanResolution::KeepContextAndAsk => ToolResult::text(
                "The user approved the plan. Edits will ask for permission. Start implementing.",
            ),
            PlanResolution::KeepContextAndAutoAccept | PlanResolution::ClearContextAndAutoAccept => {
                ToolResult::text("The user approved the plan. Edits are accepted automatically. Start implementing.")
            }
            PlanResolution::Resubmit(_) | PlanResolution::Reject => {
                ToolResult::error("The plan was not approved")
            }
        }
    }
}
