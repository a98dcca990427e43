//! Status enums for tasks, providers, and a single execution.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Task status as reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Sandbox launched, output not yet final.
    Running,
    /// Sandbox exited with code 0.
    Completed,
    /// Launch error, runtime error, non-zero exit, or timeout.
    Failed,
}

impl TaskStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of a provider or one of its accelerators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// Online and accepting work.
    #[default]
    Idle,
    /// Going away, or unreadable.
    Offline,
}

/// Phase of a single task execution inside the supervisor.
///
/// ```text
/// Assigned -> Launching -> Running -> Succeeded | Failed | TimedOut -> CleanedUp
///      \            \
///       +-> Failed   +-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    Assigned,
    Launching,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    CleanedUp,
}

impl ExecutionPhase {
    /// Whether `next` is a legal successor of this phase.
    pub fn can_transition_to(&self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        matches!(
            (self, next),
            (Assigned, Launching)
                | (Assigned, Failed)
                | (Launching, Running)
                | (Launching, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Succeeded, CleanedUp)
                | (Failed, CleanedUp)
                | (TimedOut, CleanedUp)
        )
    }

    /// Move to `next`, rejecting illegal edges.
    pub fn transition(&mut self, next: ExecutionPhase) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    /// Status reported for an outcome phase, `None` for any other phase.
    pub fn terminal_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Succeeded => Some(TaskStatus::Completed),
            Self::Failed | Self::TimedOut => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Assigned => "ASSIGNED",
            Self::Launching => "LAUNCHING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::CleanedUp => "CLEANED_UP",
        };
        f.write_str(name)
    }
}
