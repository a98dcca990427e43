//! Core domain errors.

use thiserror::Error;

use crate::ExecutionPhase;

/// Core domain errors for the provider agent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid execution phase transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ExecutionPhase,
        to: ExecutionPhase,
    },

    /// Result finalized more than once.
    #[error("Execution result for task {0} already finalized")]
    AlreadyFinalized(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
