//! Context compaction
//!
//! Tracks how full the context window is and, when asked, summarizes the
//! whole conversation into a single carry-forward message. A failed
//! summarization leaves the log exactly as it was.

use futures::StreamExt;
use relay_ai::{AssistantBuilder, Content, Message, StreamEvent};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationLog;
use crate::transport::{StreamRequest, Transport};

/// Compaction thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Summarize automatically once `auto_percent` is reached
    pub auto: bool,
    /// Usage fraction at which the boundary is told to suggest compaction
    pub warn_percent: f64,
    /// Usage fraction at which compaction runs on its own
    pub auto_percent: f64,
    /// Overrides the provider-reported context window
    pub context_window: Option<u32>,
    /// Output budget for the summary response
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            warn_percent: 0.80,
            auto_percent: 0.95,
            context_window: None,
            summary_max_tokens: 4096,
        }
    }
}

/// Why a compaction started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// Context reached the auto-compaction mark
    Threshold,
    /// Requested by the human
    Manual,
}

/// Last observed input size against the effective context ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub last_input_tokens: u32,
    pub limit: Option<u32>,
}

impl TokenBudget {
    /// The session override wins over the provider-reported window
    pub fn new(last_input_tokens: u32, override_limit: Option<u32>, model_limit: Option<u32>) -> Self {
        Self {
            last_input_tokens,
            limit: override_limit.or(model_limit),
        }
    }

    /// Fraction of the window in use; 0 when either side is unknown
    pub fn usage_percent(&self) -> f64 {
        match self.limit {
            Some(limit) if limit > 0 && self.last_input_tokens > 0 => {
                self.last_input_tokens as f64 / limit as f64
            }
            _ => 0.0,
        }
    }

    pub fn should_warn(&self, config: &CompactionConfig) -> bool {
        self.usage_percent() >= config.warn_percent
    }

    pub fn should_auto_compact(&self, config: &CompactionConfig) -> bool {
        config.auto && self.usage_percent() >= config.auto_percent
    }
}

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of a coding conversation. This summary will replace the original \
messages in the conversation context, so it must capture all essential information \
needed to continue the conversation effectively.";

const SUMMARIZATION_PROMPT: &str = "\
Summarize this conversation so far. Cover:

1. **Goal**: What is the user trying to achieve?
2. **Progress**: What has been done? List concrete changes.
3. **Key Decisions**: Technical decisions made and their reasons.
4. **Next Steps**: What was about to happen next?
5. **Critical Context**: Constraints and preferences that must not be lost.
6. **Files Read**: {read_files}
7. **Files Modified**: {modified_files}
{focus}
<conversation>
{conversation}
</conversation>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Below is the summary of an earlier part of this conversation followed by the messages \
that came after it. Write one updated summary that folds both together.

<previous-summary>
{previous_summary}
</previous-summary>

Cover:

1. **Goal**: What is the user trying to achieve? (update if it changed)
2. **Progress**: Previous and new progress.
3. **Key Decisions**: Technical decisions made and their reasons.
4. **Next Steps**: What was about to happen next?
5. **Critical Context**: Constraints and preferences that must not be lost.
6. **Files Read**: {read_files}
7. **Files Modified**: {modified_files}
{focus}
<new-messages>
{conversation}
</new-messages>";

/// Heading of the carry-forward message
pub const SUMMARY_PREFIX: &str =
    "This session continues an earlier conversation that was compacted. Summary:\n\n";

const READ_TOOLS: &[&str] = &["read", "glob", "grep", "list"];
const WRITE_TOOLS: &[&str] = &["write", "edit"];

const MAX_RESULT_CHARS: usize = 2000;

/// Build the one-shot summarization request for the current log
pub fn summary_request(
    log: &ConversationLog,
    focus: Option<&str>,
    model: &str,
    max_tokens: u32,
) -> StreamRequest {
    let messages = log.model_context();
    let (previous, rest) = match messages.split_first() {
        Some((first, rest)) if first.is_summary() => (Some(first.text()), rest),
        _ => (None, messages.as_slice()),
    };

    let (read_files, modified_files) = file_operations(rest);
    let focus = match focus.map(str::trim).filter(|f| !f.is_empty()) {
        Some(topic) => format!("\nPay particular attention to: {}\n", topic),
        None => String::new(),
    };
    let template = match &previous {
        Some(_) => UPDATE_SUMMARIZATION_PROMPT,
        None => SUMMARIZATION_PROMPT,
    };
    let prompt = template
        .replace(
            "{previous_summary}",
            previous
                .as_deref()
                .map(|p| p.strip_prefix(SUMMARY_PREFIX).unwrap_or(p))
                .unwrap_or_default(),
        )
        .replace("{read_files}", &list_or_none(&read_files))
        .replace("{modified_files}", &list_or_none(&modified_files))
        .replace("{focus}", &focus)
        .replace("{conversation}", &serialize_for_summary(rest));

    StreamRequest {
        messages: vec![Message::user(prompt)],
        system_prompt: SUMMARIZATION_SYSTEM_PROMPT.to_string(),
        tools: vec![],
        model: model.to_string(),
        max_tokens,
    }
}

/// Run a summarization request to completion and return the summary text
pub async fn summarize(
    transport: &dyn Transport,
    request: StreamRequest,
    cancel: CancellationToken,
) -> Result<String, String> {
    let mut stream = transport
        .stream(request, cancel)
        .await
        .map_err(|e| format!("Summarization request failed: {}", e))?;

    let mut builder = AssistantBuilder::new(None);
    let mut done = false;
    while let Some(event) = stream.next().await {
        if let StreamEvent::Error { message } = &event {
            return Err(format!("Summarization failed: {}", message));
        }
        builder.apply(&event);
        if event.is_terminal() {
            done = true;
            break;
        }
    }
    if !done {
        return Err("Summarization stream ended early".to_string());
    }

    let text = builder.finish().text();
    if text.trim().is_empty() {
        return Err("Summarization returned an empty response".to_string());
    }
    Ok(text)
}

/// Replace the log with the summary and reset the token counters
pub fn apply_summary(log: &mut ConversationLog, summary: &str) {
    let original = log.len();
    log.replace_all(vec![Message::summary(
        format!("{}{}", SUMMARY_PREFIX, summary.trim()),
        original,
    )]);
    log.reset_usage();
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

/// Plain-text transcript, so the model does not try to continue it
fn serialize_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        match msg {
            Message::User { content, .. } => {
                let text = transcript_text(content);
                if !text.is_empty() {
                    out.push_str(&format!("[User]: {}\n", text));
                }
            }
            Message::Assistant { content, .. } => {
                let thinking = msg.thinking();
                if !thinking.is_empty() {
                    out.push_str(&format!("[Assistant thinking]: {}\n", thinking));
                }
                let text = msg.text();
                if !text.is_empty() {
                    out.push_str(&format!("[Assistant]: {}\n", text));
                }
                let calls: Vec<String> = content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolCall {
                            name, arguments, ..
                        } => Some(format!("{}({})", name, format_args(arguments))),
                        _ => None,
                    })
                    .collect();
                if !calls.is_empty() {
                    out.push_str(&format!("[Assistant tool calls]: {}\n", calls.join("; ")));
                }
            }
            Message::ToolResult {
                tool_name,
                is_error,
                content,
                ..
            } => {
                let label = if *is_error { "Tool error" } else { "Tool result" };
                out.push_str(&format!(
                    "[{} ({})]: {}\n",
                    label,
                    tool_name,
                    truncate(&transcript_text(content), MAX_RESULT_CHARS)
                ));
            }
            Message::Notice { .. } => {}
        }
    }
    out
}

/// Text blocks with each image replaced by a placeholder
fn transcript_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            Content::Image { .. } => Some("[image]"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => format!("\"{}\"", truncate(s, 100)),
                    other => truncate(&other.to_string(), 100),
                };
                format!("{}={}", k, value)
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

/// Paths touched by read-only and modifying tools, in first-seen order
fn file_operations(messages: &[Message]) -> (Vec<String>, Vec<String>) {
    let mut read = Vec::new();
    let mut modified = Vec::new();
    for call in messages.iter().flat_map(|m| m.tool_calls()) {
        let target = if READ_TOOLS.contains(&call.name.as_str()) {
            &mut read
        } else if WRITE_TOOLS.contains(&call.name.as_str()) {
            &mut modified
        } else {
            continue;
        };
        for key in ["path", "file_path"] {
            if let Some(path) = call.arguments.get(key).and_then(|v| v.as_str()) {
                if !target.iter().any(|p| p == path) {
                    target.push(path.to_string());
                }
            }
        }
    }
    (read, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_ai::{AssistantMetadata, ModelStream, StopReason, ToolCall, Usage};
    use serde_json::json;

    struct FixedTransport(Vec<StreamEvent>);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn stream(
            &self,
            _request: StreamRequest,
            _cancel: CancellationToken,
        ) -> relay_ai::Result<ModelStream> {
            Ok(Box::pin(futures::stream::iter(self.0.clone())))
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            tool_calls: vec![],
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
        }
    }

    fn sample_log() -> ConversationLog {
        let mut log = ConversationLog::new();
        log.push(Message::user("fix the parser"));
        log.push(Message::Assistant {
            content: vec![
                Content::text("reading"),
                Content::tool_call(&ToolCall::new("c1", "read", json!({"path": "src/parser.rs"}))),
                Content::tool_call(&ToolCall::new("c2", "edit", json!({"path": "src/lexer.rs"}))),
            ],
            metadata: AssistantMetadata::default(),
        });
        log.append_results(vec![
            Message::tool_result("c1", "read", vec![Content::text("fn parse()")], false),
            Message::tool_result("c2", "edit", vec![Content::text("ok")], false),
        ])
        .unwrap();
        log
    }

    #[test]
    fn test_usage_percent_unknown_is_zero() {
        assert_eq!(TokenBudget::new(5000, None, None).usage_percent(), 0.0);
        assert_eq!(TokenBudget::new(0, None, Some(1000)).usage_percent(), 0.0);
        let budget = TokenBudget::new(900, Some(1000), Some(200_000));
        assert!((budget.usage_percent() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_thresholds() {
        let config = CompactionConfig::default();
        let warm = TokenBudget::new(850, None, Some(1000));
        assert!(warm.should_warn(&config));
        assert!(!warm.should_auto_compact(&config));

        let hot = TokenBudget::new(960, None, Some(1000));
        assert!(hot.should_auto_compact(&config));
        let manual_only = CompactionConfig {
            auto: false,
            ..Default::default()
        };
        assert!(!hot.should_auto_compact(&manual_only));
    }

    #[test]
    fn test_summary_request_lists_files_and_has_no_tools() {
        let request = summary_request(&sample_log(), Some("parser errors"), "m", 4096);
        assert!(request.tools.is_empty());
        assert_eq!(request.system_prompt, SUMMARIZATION_SYSTEM_PROMPT);
        let prompt = request.messages[0].text();
        assert!(prompt.contains("**Files Read**: src/parser.rs"));
        assert!(prompt.contains("**Files Modified**: src/lexer.rs"));
        assert!(prompt.contains("Pay particular attention to: parser errors"));
        assert!(prompt.contains("[User]: fix the parser"));
        assert!(!prompt.contains("<previous-summary>"));
    }

    #[test]
    fn test_images_become_placeholders_in_the_transcript() {
        let mut log = ConversationLog::new();
        log.push(Message::user_with_content(vec![
            Content::text("why does this render wrong?"),
            Content::image("iVBORw0KGgo=", "image/png"),
        ]));
        let prompt = summary_request(&log, None, "m", 4096).messages[0].text();
        assert!(prompt.contains("[User]: why does this render wrong? [image]"));
        assert!(!prompt.contains("iVBORw0KGgo="));
    }

    #[test]
    fn test_summary_request_folds_previous_summary() {
        let mut log = ConversationLog::new();
        apply_summary(&mut log, "earlier work");
        log.push(Message::user("next task"));
        let prompt = summary_request(&log, None, "m", 4096).messages[0].text();
        assert!(prompt.contains("<previous-summary>\nearlier work\n</previous-summary>"));
        assert!(prompt.contains("[User]: next task"));
        assert!(!prompt.contains("Pay particular attention"));
    }

    #[test]
    fn test_apply_summary_replaces_log() {
        let mut log = sample_log();
        log.record_usage(&Usage {
            input: 1234,
            ..Default::default()
        });
        apply_summary(&mut log, "the summary");
        assert_eq!(log.len(), 1);
        let msg = &log.messages()[0];
        assert!(msg.is_summary());
        assert!(msg.text().ends_with("the summary"));
        match msg {
            Message::User { summary, .. } => {
                assert_eq!(summary.as_ref().unwrap().original_message_count, 4)
            }
            other => panic!("expected user message, got {:?}", other),
        }
        assert_eq!(log.last_input_tokens(), 0);
    }

    #[tokio::test]
    async fn test_summarize_collects_text() {
        let transport = FixedTransport(vec![
            StreamEvent::TextDelta {
                delta: "## Goal".into(),
            },
            done(),
        ]);
        let request = summary_request(&sample_log(), None, "m", 4096);
        let text = summarize(&transport, request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "## Goal");
    }

    #[tokio::test]
    async fn test_summarize_errors() {
        let request = summary_request(&sample_log(), None, "m", 4096);
        let failing = FixedTransport(vec![StreamEvent::Error {
            message: "overloaded".into(),
        }]);
        assert!(
            summarize(&failing, request.clone(), CancellationToken::new())
                .await
                .unwrap_err()
                .contains("overloaded")
        );

        let empty = FixedTransport(vec![done()]);
        assert!(summarize(&empty, request.clone(), CancellationToken::new()).await.is_err());

        let truncated = FixedTransport(vec![StreamEvent::TextDelta { delta: "x".into() }]);
        assert!(summarize(&truncated, request, CancellationToken::new()).await.is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(10);
        assert_eq!(truncate(&text, 3), "ééé...(truncated)");
        assert_eq!(truncate("short", 10), "short");
    }
}
