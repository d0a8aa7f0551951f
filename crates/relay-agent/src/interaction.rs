//! Interaction requests: a tool call suspended until the human answers
//!
//! The bridge holds at most one pending request. A resolution must match the
//! request's shape and answer it completely; anything else is rejected and the
//! request stays pending.

use relay_ai::ToolCall;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::permission::ToolCategory;

/// Prompt for a tool that needs permission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPrompt {
    pub tool_name: String,
    pub tool_call_id: String,
    /// One-line description of what the call will do
    pub summary: String,
    pub arguments: serde_json::Value,
    pub category: ToolCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    /// Short tag shown next to the question
    #[serde(default)]
    pub header: String,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// A suspended tool call awaiting a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionRequest {
    Permission(PermissionPrompt),
    Question { questions: Vec<Question> },
    Plan { plan: String },
    EnterPlanMode { task: String },
}

impl InteractionRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Permission(_) => "permission",
            Self::Question { .. } => "question",
            Self::Plan { .. } => "plan",
            Self::EnterPlanMode { .. } => "enter_plan_mode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAnswer {
    Approve,
    ApproveForSession,
    Deny,
}

/// Answer to one question: chosen labels and/or free text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    #[serde(default)]
    pub selected: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<String>,
}

impl QuestionAnswer {
    pub fn select(label: impl Into<String>) -> Self {
        Self {
            selected: vec![label.into()],
            other: None,
        }
    }

    pub fn other(text: impl Into<String>) -> Self {
        Self {
            selected: vec![],
            other: Some(text.into()),
        }
    }

    fn has_other(&self) -> bool {
        self.other.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Human-readable rendering used in tool results
    pub fn render(&self) -> String {
        let mut parts: Vec<&str> = self.selected.iter().map(String::as_str).collect();
        if let Some(other) = self.other.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(other);
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "answer", content = "answers", rename_all = "snake_case")]
pub enum QuestionResolution {
    Answered(Vec<QuestionAnswer>),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "text", rename_all = "snake_case")]
pub enum PlanResolution {
    /// Approve, clear history and auto-accept edits
    ClearContextAndAutoAccept,
    /// Approve, keep history and auto-accept edits
    KeepContextAndAutoAccept,
    /// Approve, keep history and ask before each edit
    KeepContextAndAsk,
    /// Keep planning with the human's edited text
    Resubmit(String),
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnterPlanResolution {
    Approve,
    Deny,
}

/// The human's answer to an [`InteractionRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    Permission(PermissionAnswer),
    Question(QuestionResolution),
    Plan(PlanResolution),
    EnterPlanMode(EnterPlanResolution),
}

impl Resolution {
    /// Check that this answers `request` completely
    pub fn validate(&self, request: &InteractionRequest) -> Result<()> {
        match (request, self) {
            (InteractionRequest::Permission(_), Resolution::Permission(_)) => Ok(()),
            (InteractionRequest::EnterPlanMode { .. }, Resolution::EnterPlanMode(_)) => Ok(()),
            (InteractionRequest::Plan { .. }, Resolution::Plan(plan)) => match plan {
                PlanResolution::Resubmit(text) if text.trim().is_empty() => Err(
                    Error::InvalidResolution("resubmitted plan text is empty".into()),
                ),
                _ => Ok(()),
            },
            (InteractionRequest::Question { questions }, Resolution::Question(answer)) => {
                match answer {
                    QuestionResolution::Cancelled => Ok(()),
                    QuestionResolution::Answered(answers) => validate_answers(questions, answers),
                }
            }
            (request, _) => Err(Error::InvalidResolution(format!(
                "resolution does not answer a {} request",
                request.kind()
            ))),
        }
    }
}

fn validate_answers(questions: &[Question], answers: &[QuestionAnswer]) -> Result<()> {
    if answers.len() != questions.len() {
        return Err(Error::InvalidResolution(format!(
            "expected {} answers, got {}",
            questions.len(),
            answers.len()
        )));
    }
    for (index, (question, answer)) in questions.iter().zip(answers).enumerate() {
        if let Some(unknown) = answer
            .selected
            .iter()
            .find(|label| !question.options.iter().any(|o| &o.label == *label))
        {
            return Err(Error::InvalidResolution(format!(
                "question {} has no option {:?}",
                index + 1,
                unknown
            )));
        }
        let choices = answer.selected.len() + usize::from(answer.has_other());
        if choices == 0 {
            return Err(Error::InvalidResolution(format!(
                "question {} is unanswered",
                index + 1
            )));
        }
        if !question.multi_select && choices > 1 {
            return Err(Error::InvalidResolution(format!(
                "question {} accepts a single answer",
                index + 1
            )));
        }
    }
    Ok(())
}

/// How the controller continues once the interaction resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionRoute {
    /// Permission gate in front of a plain or permission-aware tool
    Permission,
    /// An interactive tool awaiting its answer
    Interactive,
}

/// The one suspended call of the current batch
#[derive(Debug, Clone)]
pub struct PendingInteraction {
    pub id: String,
    /// Index of the call within its batch
    pub call_index: usize,
    pub call: ToolCall,
    pub request: InteractionRequest,
    pub route: InteractionRoute,
}

#[derive(Debug, Default)]
pub struct InteractionBridge {
    pending: Option<PendingInteraction>,
}

impl InteractionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend `call` on `request` and return the new interaction id
    pub fn suspend(
        &mut self,
        call_index: usize,
        call: ToolCall,
        request: InteractionRequest,
        route: InteractionRoute,
    ) -> &PendingInteraction {
        debug_assert!(self.pending.is_none(), "one interaction at a time");
        self.pending.insert(PendingInteraction {
            id: uuid::Uuid::new_v4().to_string(),
            call_index,
            call,
            request,
            route,
        })
    }

    pub fn pending(&self) -> Option<&PendingInteraction> {
        self.pending.as_ref()
    }

    /// Take the pending interaction if `resolution` answers it. On error the
    /// interaction stays pending.
    pub fn resolve(&mut self, id: &str, resolution: &Resolution) -> Result<PendingInteraction> {
        let pending = match &self.pending {
            Some(pending) if pending.id == id => pending,
            _ => return Err(Error::UnknownInteraction(id.to_string())),
        };
        resolution.validate(&pending.request)?;
        self.pending
            .take()
            .ok_or_else(|| Error::UnknownInteraction(id.to_string()))
    }

    /// Drop the pending interaction (cancellation)
    pub fn clear(&mut self) -> Option<PendingInteraction> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(multi: bool) -> Question {
        Question {
            question: "Which database?".into(),
            header: "DB".into(),
            options: vec![
                QuestionOption {
                    label: "Postgres".into(),
                    description: String::new(),
                },
                QuestionOption {
                    label: "SQLite".into(),
                    description: String::new(),
                },
            ],
            multi_select: multi,
        }
    }

    fn questions() -> InteractionRequest {
        InteractionRequest::Question {
            questions: vec![question(false), question(true)],
        }
    }

    fn answered(answers: Vec<QuestionAnswer>) -> Resolution {
        Resolution::Question(QuestionResolution::Answered(answers))
    }

    #[test]
    fn test_every_question_must_be_answered() {
        let request = questions();
        let partial = answered(vec![QuestionAnswer::select("Postgres")]);
        assert!(partial.validate(&request).is_err());

        let empty = answered(vec![QuestionAnswer::select("Postgres"), QuestionAnswer::default()]);
        assert!(empty.validate(&request).is_err());

        let full = answered(vec![
            QuestionAnswer::select("Postgres"),
            QuestionAnswer {
                selected: vec!["Postgres".into(), "SQLite".into()],
                other: None,
            },
        ]);
        full.validate(&request).unwrap();
    }

    #[test]
    fn test_single_select_rejects_two_choices() {
        let request = InteractionRequest::Question {
            questions: vec![question(false)],
        };
        let two = answered(vec![QuestionAnswer {
            selected: vec!["Postgres".into()],
            other: Some("MySQL".into()),
        }]);
        assert!(two.validate(&request).is_err());
        answered(vec![QuestionAnswer::other("MySQL")])
            .validate(&request)
            .unwrap();
    }

    #[test]
    fn test_unknown_label_rejected() {
        let request = InteractionRequest::Question {
            questions: vec![question(false)],
        };
        assert!(
            answered(vec![QuestionAnswer::select("Oracle")])
                .validate(&request)
                .is_err()
        );
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let request = InteractionRequest::Plan {
            plan: "1. do it".into(),
        };
        let err = Resolution::Permission(PermissionAnswer::Approve)
            .validate(&request)
            .unwrap_err();
        assert!(err.to_string().contains("plan"));
        assert!(
            Resolution::Plan(PlanResolution::Resubmit("  ".into()))
                .validate(&request)
                .is_err()
        );
    }

    #[test]
    fn test_bridge_keeps_pending_on_invalid_resolution() {
        let mut bridge = InteractionBridge::new();
        let id = bridge
            .suspend(
                1,
                ToolCall::new("c1", "ask_user_question", json!({})),
                questions(),
                InteractionRoute::Interactive,
            )
            .id
            .clone();

        assert!(matches!(
            bridge.resolve("nope", &Resolution::Question(QuestionResolution::Cancelled)),
            Err(Error::UnknownInteraction(_))
        ));
        assert!(
            bridge
                .resolve(&id, &Resolution::Permission(PermissionAnswer::Deny))
                .is_err()
        );
        assert!(bridge.pending().is_some());

        let pending = bridge
            .resolve(&id, &Resolution::Question(QuestionResolution::Cancelled))
            .unwrap();
        assert_eq!(pending.call_index, 1);
        assert!(bridge.pending().is_none());
    }

    #[test]
    fn test_resolution_serde_shape() {
        let json = serde_json::to_value(Resolution::Plan(PlanResolution::Resubmit("v2".into())))
            .unwrap();
        assert_eq!(json, json!({"kind": "plan", "value": {"choice": "resubmit", "text": "v2"}}));
        let back: Resolution = serde_json::from_value(json).unwrap();
        assert_eq!(back, Resolution::Plan(PlanResolution::Resubmit("v2".into())));
    }
}
