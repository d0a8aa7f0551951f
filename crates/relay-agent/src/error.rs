//! Error types for relay-agent

use thiserror::Error;

use crate::controller::TurnState;

/// Result type alias using relay-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the orchestration core. None of these are fatal: every
/// failure path returns the controller to `Idle` with a consistent log.
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model stream layer
    #[error(transparent)]
    Ai(#[from] relay_ai::Error),

    /// Summarization failed; the log was left untouched
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// The operation is not valid in the controller's current state
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: TurnState,
    },

    /// A resolution arrived that does not fit the pending interaction
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    /// No interaction with this id is pending
    #[error("no pending interaction with id {0}")]
    UnknownInteraction(String),

    /// A restored log violates the call/result ordering invariant
    #[error("invalid conversation log: {0}")]
    InvalidLog(String),
}
