//! Scripted model transport
//!
//! Plays back assistant turns from a JSON array, one fragment at a time.
//! Every request consumes the next turn, summarization requests included.
//!
//! ```json
//! [
//!   { "text": "Let me look.", "tool_calls": [{ "name": "list", "arguments": {} }] },
//!   { "text": "The crate has two modules.", "input_tokens": 1200 },
//!   { "reject": { "status": 529, "message": "overloaded" } }
//! ]
//! ```

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use relay_agent::{StreamRequest, Transport};
use relay_ai::{Error, ModelStream, Result, StopReason, StreamEvent, ToolCall, Usage};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ScriptedCall>,
    /// Fail the stream after the text instead of finishing it
    #[serde(default)]
    pub error: Option<String>,
    /// Refuse to open the stream, as a provider answering with an error status
    #[serde(default)]
    pub reject: Option<ScriptedRejection>,
    #[serde(default)]
    pub input_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedRejection {
    #[serde(default)]
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedCall {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

pub struct ReplayTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    delay: Duration,
}

impl ReplayTransport {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let turns: Vec<ScriptedTurn> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid replay script {}", path.display()))?;
        Ok(Self::new(turns))
    }

    /// Pause between fragments
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        self.turns.lock().pop_front()
    }
}

/// Split a turn into the fragments a provider would stream
fn fragments(turn: ScriptedTurn) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(thinking) = turn.thinking {
        events.push(StreamEvent::ReasoningDelta { delta: thinking });
    }
    events.extend(turn.text.split_inclusive(' ').map(|word| StreamEvent::TextDelta {
        delta: word.to_string(),
    }));

    if let Some(message) = turn.error {
        events.push(StreamEvent::Error { message });
        return events;
    }

    let tool_calls: Vec<ToolCall> = turn
        .tool_calls
        .into_iter()
        .map(|call| {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            ToolCall::new(id, call.name, call.arguments)
        })
        .collect();
    events.extend(tool_calls.iter().map(|call| StreamEvent::ToolCallStart {
        id: call.id.clone(),
        name: call.name.clone(),
    }));
    events.push(StreamEvent::Done {
        stop_reason: if tool_calls.is_empty() {
            StopReason::Stop
        } else {
            StopReason::ToolUse
        },
        tool_calls,
        usage: Usage {
            input: turn.input_tokens,
            ..Default::default()
        },
    });
    events
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn stream(&self, request: StreamRequest, cancel: CancellationToken) -> Result<ModelStream> {
        // A request cancelled before it opens keeps its scripted turn
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut turn = self
            .next_turn()
            .ok_or_else(|| Error::Stream("Replay script has no more turns".to_string()))?;
        tracing::debug!(
            "Replaying turn for {} ({} messages, {} left)",
            request.model,
            request.messages.len(),
            self.remaining()
        );
        if let Some(rejection) = turn.reject.take() {
            return Err(Error::provider(rejection.status, rejection.message));
        }
        let events = fragments(turn);
        let delay = self.delay;

        Ok(Box::pin(async_stream::stream! {
            for event in events {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    return;
                }
                yield event;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request() -> StreamRequest {
        StreamRequest {
            messages: vec![],
            system_prompt: String::new(),
            tools: vec![],
            model: "replay".into(),
            max_tokens: 1024,
        }
    }

    fn script(json: &str) -> ReplayTransport {
        ReplayTransport::new(serde_json::from_str(json).unwrap())
    }

    #[tokio::test]
    async fn test_streams_words_then_done() {
        let transport = script(r#"[{ "text": "hello there world", "input_tokens": 42 }]"#);
        let events: Vec<_> = transport
            .stream(request(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert_eq!(
            events[1],
            StreamEvent::TextDelta {
                delta: "there ".into()
            }
        );
        match &events[3] {
            StreamEvent::Done {
                stop_reason, usage, ..
            } => {
                assert_eq!(*stop_reason, StopReason::Stop);
                assert_eq!(usage.input, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test]
    async fn test_tool_calls_get_ids() {
        let transport = script(
            r#"[{ "tool_calls": [
                { "name": "read", "arguments": { "path": "a" } },
                { "id": "fixed", "name": "list" }
            ] }]"#,
        );
        let events: Vec<_> = transport
            .stream(request(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        let StreamEvent::Done {
            tool_calls,
            stop_reason,
            ..
        } = events.last().unwrap()
        else {
            panic!("stream did not finish");
        };
        assert_eq!(*stop_reason, StopReason::ToolUse);
        assert!(tool_calls[0].id.starts_with("call_"));
        assert_eq!(tool_calls[1].id, "fixed");
        assert!(matches!(&events[0], StreamEvent::ToolCallStart { name, .. } if name == "read"));
    }

    #[tokio::test]
    async fn test_scripted_error_ends_the_stream() {
        let transport = script(r#"[{ "text": "partial", "error": "overloaded" }]"#);
        let events: Vec<_> = transport
            .stream(request(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error {
                message: "overloaded".into()
            })
        );
    }

    #[tokio::test]
    async fn test_exhausted_script_fails_to_open() {
        let transport = script("[]");
        assert!(transport.stream(request(), CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_turn_fails_to_open() {
        let transport = script(
            r#"[{ "reject": { "status": 413, "message": "request too large" } }, { "text": "ok" }]"#,
        );
        let Err(error) = transport.stream(request(), CancellationToken::new()).await else {
            panic!("stream opened");
        };
        assert!(error.is_context_overflow());
        assert_eq!(error.to_string(), "Provider error (413): request too large");
        assert_eq!(transport.remaining(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_keeps_its_turn() {
        let transport = script(r#"[{ "text": "hello" }]"#);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            transport.stream(request(), cancel).await,
            Err(Error::Cancelled)
        ));
        assert_eq!(transport.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_the_stream() {
        let transport =
            script(r#"[{ "text": "one two three four" }]"#).with_delay(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let mut stream = transport.stream(request(), cancel.clone()).await.unwrap();

        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
