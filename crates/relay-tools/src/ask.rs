//! Multiple-choice questions for the human

use std::collections::HashSet;

use async_trait::async_trait;
use relay_agent::interaction::{Question, QuestionResolution};
use relay_agent::{InteractionRequest, Interactive, Resolution, Tool, ToolResult};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const MAX_QUESTIONS: usize = 4;
const MIN_OPTIONS: usize = 2;
const MAX_OPTIONS: usize = 4;

/// Asks one to four multiple-choice questions. The human may always answer
/// in free text instead of picking an option.
pub struct AskUserQuestionTool;

fn parse_questions(arguments: &Value) -> Result<Vec<Question>, String> {
    let raw = arguments
        .get("questions")
        .cloned()
        .ok_or("Missing 'questions' argument")?;
    let questions: Vec<Question> =
        serde_json::from_value(raw).map_err(|e| format!("Invalid questions: {}", e))?;

    if questions.is_empty() || questions.len() > MAX_QUESTIONS {
        return Err(format!("Ask between 1 and {} questions", MAX_QUESTIONS));
    }
    for question in &questions {
        let count = question.options.len();
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&count) {
            return Err(format!(
                "\"{}\" needs between {} and {} options, got {}",
                question.question, MIN_OPTIONS, MAX_OPTIONS, count
            ));
        }
        let mut labels = HashSet::new();
        if let Some(dup) = question.options.iter().find(|o| !labels.insert(&o.label)) {
            return Err(format!(
                "\"{}\" lists option \"{}\" twice",
                question.question, dup.label
            ));
        }
    }
    Ok(questions)
}

#[async_trait]
impl Tool for AskUserQuestionTool {
    fn name(&self) -> &str {
        "ask_user_question"
    }

    fn label(&self) -> &str {
        "Question"
    }

    fn description(&self) -> &str {
        "Ask the user one to four multiple-choice questions to clarify requirements or choose \
         between approaches. The user can also answer in their own words."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": MAX_QUESTIONS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string", "description": "The full question" },
                            "header": { "type": "string", "description": "Very short tag, e.g. 'Auth method'" },
                            "options": {
                                "type": "array",
                                "minItems": MIN_OPTIONS,
                                "maxItems": MAX_OPTIONS,
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "label": { "type": "string" },
                                        "description": { "type": "string" }
                                    },
                                    "required": ["label"]
                                }
                            },
                            "multi_select": {
                                "type": "boolean",
                                "description": "Allow more than one option"
                            }
                        },
                        "required": ["question", "options"]
                    }
                }
            },
            "required": ["questions"]
        })
    }

    async fn execute(&self, _tool_call_id: &str, _arguments: Value, _cancel: CancellationToken) -> ToolResult {
        ToolResult::error("ask_user_question needs an answer from the user")
    }
}

#[async_trait]
impl Interactive for AskUserQuestionTool {
    fn prepare_interaction(&self, _tool_call_id: &str, arguments: &Value) -> Result<InteractionRequest, String> {
        parse_questions(arguments).map(|questions| InteractionRequest::Question { questions })
    }

    async fn execute_with_response(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        resolution: &Resolution,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let Resolution::Question(QuestionResolution::Answered(answers)) = resolution else {
            return ToolResult::error("The question was not answered");
        };
        let questions = match parse_questions(&arguments) {
            Ok(questions) => questions,
            Err(e) => return ToolResult::error(e),
        };
        let pairs: Vec<String> = questions
            .iter()
            .zip(answers)
            .map(|(q, a)| format!("\"{}\" = \"{}\"", q.question, a.render()))
            .collect();
        ToolResult::text(format!(
            "The user answered: {}. Continue with these answers in mind.",
            pairs.join(", ")
        ))
        .with_details(json!({ "answers": answers }))
    }
}
