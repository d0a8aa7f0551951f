//! Error types for relay-ai

use thiserror::Error;

/// Result type alias using relay-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failures opening or reading a model stream
#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider answered with an error status
    #[error("Provider error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Provider { status: Option<u16>, message: String },

    /// The request no longer fits in the model's context window
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Transport failure while the stream was open
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl Error {
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Whether compacting the log could make a retry succeed
    pub fn is_context_overflow(&self) -> bool {
        matches!(
            self,
            Error::ContextOverflow(_) | Error::Provider { status: Some(413), .. }
        )
    }
}
