//! Task and execution result types.

use serde::{Deserialize, Serialize};

use crate::{CoreError, ExecutionPhase, TaskId, TaskStatus};

/// Entry script used when the orchestrator does not name one.
pub const DEFAULT_SCRIPT_PATH: &str = "main.py";

fn default_script_path() -> String {
    DEFAULT_SCRIPT_PATH.to_string()
}

/// A unit of work assigned by the orchestrator.
///
/// Immutable once accepted; the agent holds at most one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    #[serde(rename = "task_id")]
    pub id: TaskId,

    /// Location of the project the runner fetches. Empty when the
    /// orchestrator omitted it; such a task is reported failed, not dropped.
    #[serde(default)]
    pub input_path: String,

    /// Entry script, relative to the project root.
    #[serde(default = "default_script_path")]
    pub script_path: String,

    /// Pre-signed destination for the result archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
}

impl Task {
    /// Create a new Task with the default entry script and no destination.
    pub fn new(id: impl Into<TaskId>, input_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input_path: input_path.into(),
            script_path: default_script_path(),
            upload_url: None,
        }
    }

    /// Builder method to set the entry script.
    pub fn with_script_path(mut self, script_path: impl Into<String>) -> Self {
        self.script_path = script_path.into();
        self
    }

    /// Builder method to set the upload destination.
    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }
}

/// Outcome of one task execution.
///
/// Starts as `Running`, accumulates log text, and is finalized exactly once
/// with a terminal status before being reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub logs: String,
    pub result_ref: Option<String>,
    pub exit_code: Option<i64>,
    /// Every phase the execution passed through, in order.
    pub phases: Vec<ExecutionPhase>,
}

impl ExecutionResult {
    /// Start a result for a freshly assigned task.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            logs: String::new(),
            result_ref: None,
            exit_code: None,
            phases: vec![ExecutionPhase::Assigned],
        }
    }

    /// Append a chunk of sandbox output.
    pub fn append_log(&mut self, chunk: &str) {
        self.logs.push_str(chunk);
    }

    /// Append a line of agent-side diagnostics, keeping it on its own line.
    pub fn append_note(&mut self, note: &str) {
        if !self.logs.is_empty() && !self.logs.ends_with('\n') {
            self.logs.push('\n');
        }
        self.logs.push_str(note);
        self.logs.push('\n');
    }

    /// Returns true once a terminal status has been set.
    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal()
    }

    /// Set the terminal status.
    pub fn finalize(&mut self, status: TaskStatus) -> Result<(), CoreError> {
        if self.is_finalized() {
            return Err(CoreError::AlreadyFinalized(self.task_id.to_string()));
        }
        if !status.is_terminal() {
            return Err(CoreError::InvalidInput(format!(
                "{} is not a terminal status",
                status
            )));
        }
        self.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_from_orchestrator_payload() {
        let task: Task = serde_json::from_str(
            r#"{"task_id": "t-1", "input_path": "https://git.example/p.git"}"#,
        )
        .unwrap();
        assert_eq!(task.id.as_str(), "t-1");
        assert_eq!(task.script_path, DEFAULT_SCRIPT_PATH);
        assert!(task.upload_url.is_none());

        let task: Task = serde_json::from_str(
            r#"{"task_id": "t-2", "input_path": "s3://in", "script_path": "train.py", "upload_url": "https://bucket/out.zip?sig=1"}"#,
        )
        .unwrap();
        assert_eq!(task.script_path, "train.py");
        assert_eq!(task.upload_url.as_deref(), Some("https://bucket/out.zip?sig=1"));
    }

    #[test]
    fn test_task_without_input_path_still_parses() {
        let task: Task = serde_json::from_str(r#"{"task_id": "t-3"}"#).unwrap();
        assert_eq!(task.id.as_str(), "t-3");
        assert!(task.input_path.is_empty());
        assert_eq!(task.script_path, DEFAULT_SCRIPT_PATH);
    }

    #[test]
    fn test_finalize_exactly_once() {
        let mut result = ExecutionResult::new(TaskId::new("t-1"));
        assert!(!result.is_finalized());

        assert!(result.finalize(TaskStatus::Running).is_err());
        result.finalize(TaskStatus::Completed).unwrap();
        assert!(result.is_finalized());

        let err = result.finalize(TaskStatus::Failed).unwrap_err();
        assert_eq!(err, CoreError::AlreadyFinalized("t-1".to_string()));
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[test]
    fn test_append_note_starts_new_line() {
        let mut result = ExecutionResult::new(TaskId::new("t-1"));
        result.append_log("partial");
        result.append_note("timed out");
        assert_eq!(result.logs, "partial\ntimed out\n");
    }
}
