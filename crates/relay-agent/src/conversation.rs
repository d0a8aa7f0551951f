//! The conversation log: the ordered, append-only record every other
//! component reads from.

use std::collections::HashSet;

use relay_ai::{Message, NoticeLevel, ToolCall, Usage};

use crate::error::{Error, Result};

/// Ordered sequence of messages plus the token counters derived from the
/// most recent model responses.
///
/// Only the controller's event loop mutates the log. Tool results enter
/// exclusively through [`ConversationLog::append_results`], which checks that
/// every result answers a call emitted by an earlier assistant message.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    messages: Vec<Message>,
    total_usage: Usage,
    last_input_tokens: u32,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a persisted log. Fails if a tool result does not answer an
    /// earlier call.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        validate(&messages).map_err(Error::InvalidLog)?;
        Ok(Self {
            messages,
            ..Default::default()
        })
    }

    /// All messages, in order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a user, assistant or notice message
    pub fn push(&mut self, message: Message) {
        debug_assert!(
            !matches!(message, Message::ToolResult { .. }),
            "tool results go through append_results"
        );
        self.messages.push(message);
    }

    pub fn push_notice(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.messages.push(Message::notice(level, text));
    }

    /// Replace the trailing assistant message (the streaming placeholder).
    /// Returns false if the log does not end with an assistant message.
    pub fn update_last_assistant(&mut self, message: Message) -> bool {
        match self.messages.last_mut() {
            Some(last @ Message::Assistant { .. }) => {
                *last = message;
                true
            }
            _ => false,
        }
    }

    /// Append the results of one batch in a single write. Either every
    /// result is appended or none is.
    pub fn append_results(&mut self, results: Vec<Message>) -> Result<()> {
        let mut answered = answered_ids(&self.messages);
        let emitted = emitted_ids(&self.messages);
        for result in &results {
            let Message::ToolResult { tool_call_id, .. } = result else {
                return Err(Error::InvalidLog(format!(
                    "expected a tool result, got a {} message",
                    result.role()
                )));
            };
            if !emitted.contains(tool_call_id.as_str()) {
                return Err(Error::InvalidLog(format!(
                    "tool result {} has no matching call",
                    tool_call_id
                )));
            }
            if !answered.insert(tool_call_id.clone()) {
                return Err(Error::InvalidLog(format!(
                    "tool call {} already has a result",
                    tool_call_id
                )));
            }
        }
        self.messages.extend(results);
        Ok(())
    }

    /// Replace the whole log (compaction, plan hand-off)
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Messages sent to the model: everything except notices
    pub fn model_context(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.is_model_visible())
            .cloned()
            .collect()
    }

    /// True once every id in `call_ids` has a result in the log
    pub fn has_all_results(&self, call_ids: &[String]) -> bool {
        let answered = answered_ids(&self.messages);
        call_ids.iter().all(|id| answered.contains(id))
    }

    /// Tool calls that have no result yet, in emission order
    pub fn unanswered_calls(&self) -> Vec<ToolCall> {
        let answered = answered_ids(&self.messages);
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls())
            .filter(|call| !answered.contains(&call.id))
            .collect()
    }

    /// Whether the log is safe to persist or display as final: no assistant
    /// message is waiting on tool results.
    pub fn is_settled(&self) -> bool {
        self.unanswered_calls().is_empty()
    }

    /// Record usage from a completed model response
    pub fn record_usage(&mut self, usage: &Usage) {
        self.last_input_tokens = usage.context_tokens();
        self.total_usage.accumulate(usage);
    }

    /// Input tokens observed on the most recent response
    pub fn last_input_tokens(&self) -> u32 {
        self.last_input_tokens
    }

    pub fn total_usage(&self) -> &Usage {
        &self.total_usage
    }

    pub fn reset_usage(&mut self) {
        self.last_input_tokens = 0;
        self.total_usage = Usage::default();
    }
}

fn answered_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect()
}

fn emitted_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .flat_map(|m| m.tool_calls())
        .map(|call| call.id)
        .collect()
}

/// Every tool result must answer a call from a strictly earlier assistant
/// message, at most once.
fn validate(messages: &[Message]) -> std::result::Result<(), String> {
    let mut emitted = HashSet::new();
    let mut answered = HashSet::new();
    for (index, message) in messages.iter().enumerate() {
        match message {
            Message::Assistant { .. } => {
                emitted.extend(message.tool_calls().into_iter().map(|c| c.id));
            }
            Message::ToolResult { tool_call_id, .. } => {
                if !emitted.contains(tool_call_id) {
                    return Err(format!(
                        "message {} answers unknown call {}",
                        index, tool_call_id
                    ));
                }
                if !answered.insert(tool_call_id.clone()) {
                    return Err(format!(
                        "message {} answers call {} a second time",
                        index, tool_call_id
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_ai::{AssistantMetadata, Content};
    use serde_json::json;

    fn assistant_calling(ids: &[&str]) -> Message {
        Message::Assistant {
            content: ids
                .iter()
                .map(|id| Content::tool_call(&ToolCall::new(*id, "read", json!({}))))
                .collect(),
            metadata: AssistantMetadata::default(),
        }
    }

    fn result(id: &str) -> Message {
        Message::tool_result(id, "read", vec![Content::text("ok")], false)
    }

    #[test]
    fn test_append_results_requires_matching_call() {
        let mut log = ConversationLog::new();
        log.push(Message::user("hi"));
        let err = log.append_results(vec![result("ghost")]).unwrap_err();
        assert!(matches!(err, Error::InvalidLog(_)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_append_results_is_all_or_nothing() {
        let mut log = ConversationLog::new();
        log.push(assistant_calling(&["a", "b"]));
        let err = log.append_results(vec![result("a"), result("zzz")]);
        assert!(err.is_err());
        assert_eq!(log.len(), 1, "no partial write");
        assert!(!log.has_all_results(&["a".into()]));
    }

    #[test]
    fn test_duplicate_result_rejected() {
        let mut log = ConversationLog::new();
        log.push(assistant_calling(&["a"]));
        log.append_results(vec![result("a")]).unwrap();
        assert!(log.append_results(vec![result("a")]).is_err());
    }

    #[test]
    fn test_settled_tracks_unanswered_calls() {
        let mut log = ConversationLog::new();
        log.push(assistant_calling(&["a", "b"]));
        assert!(!log.is_settled());
        assert_eq!(log.unanswered_calls().len(), 2);
        log.append_results(vec![result("a"), result("b")]).unwrap();
        assert!(log.is_settled());
        assert!(log.has_all_results(&["a".into(), "b".into()]));
    }

    #[test]
    fn test_from_messages_rejects_result_before_call() {
        let messages = vec![result("a"), assistant_calling(&["a"])];
        assert!(ConversationLog::from_messages(messages).is_err());
    }

    #[test]
    fn test_model_context_drops_notices() {
        let mut log = ConversationLog::new();
        log.push(Message::user("hi"));
        log.push_notice(NoticeLevel::Info, "entered plan mode");
        assert_eq!(log.len(), 2);
        assert_eq!(log.model_context().len(), 1);
    }

    #[test]
    fn test_update_last_assistant_only_replaces_assistant() {
        let mut log = ConversationLog::new();
        log.push(Message::user("hi"));
        assert!(!log.update_last_assistant(Message::assistant_empty(None)));
        log.push(Message::assistant_empty(None));
        let filled = Message::Assistant {
            content: vec![Content::text("hello")],
            metadata: AssistantMetadata::default(),
        };
        assert!(log.update_last_assistant(filled));
        assert_eq!(log.last().unwrap().text(), "hello");
    }

    #[test]
    fn test_record_usage_keeps_last_input() {
        let mut log = ConversationLog::new();
        log.record_usage(&Usage {
            input: 1000,
            cache_read: 500,
            ..Default::default()
        });
        log.record_usage(&Usage {
            input: 200,
            ..Default::default()
        });
        assert_eq!(log.last_input_tokens(), 200);
        assert_eq!(log.total_usage().input, 1200);
        log.reset_usage();
        assert_eq!(log.last_input_tokens(), 0);
    }
}
