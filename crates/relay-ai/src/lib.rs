//! relay-ai: model-facing vocabulary for the relay agent runtime
//!
//! Messages, content blocks, usage accounting, and the incremental stream
//! fragments a model produces. Provider HTTP clients live elsewhere; this
//! crate only defines what they must emit.

pub mod error;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{AssistantBuilder, ModelStream, StreamEvent};
pub use types::*;
