//! Model stream boundary

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use relay_ai::{Message, ModelStream, Result, ToolSchema};
use tokio_util::sync::CancellationToken;

/// Everything a provider needs to produce one response
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Model-visible messages, oldest first
    pub messages: Vec<Message>,
    pub system_prompt: String,
    /// Empty for summarization requests
    pub tools: Vec<ToolSchema>,
    pub model: String,
    pub max_tokens: u32,
}

/// Opens model response streams. Implementations must end the stream when
/// `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn stream(&self, request: StreamRequest, cancel: CancellationToken)
    -> Result<ModelStream>;
}

/// Provider error phrasings that mean the prompt no longer fits
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?(is.?)?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)request.?too.?large",
        r"(?i)context_length_exceeded",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)context.?overflow",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if a stream error message indicates a context overflow
pub fn is_context_overflow(error: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}
