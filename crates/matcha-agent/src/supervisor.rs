//! Execution supervisor.
//!
//! Runs exactly one task at a time through
//! `ASSIGNED -> LAUNCHING -> RUNNING -> {SUCCEEDED, FAILED, TIMED_OUT} -> CLEANED_UP`.
//! Every route ends in `CLEANED_UP` with the sandbox released, the workspace
//! deleted, and exactly one terminal status reported.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use matcha_core::{ExecutionPhase, ExecutionResult, Task, TaskId, TaskStatus};

use crate::config::AgentContext;
use crate::error::SandboxError;
use crate::orchestrator::{Orchestrator, StatusUpdate};
use crate::packager::ResultPackager;
use crate::sandbox::{LaunchSpec, SandboxHandle, SandboxRuntime, VolumeBinding};
use crate::workspace::Workspace;

/// Owns a started sandbox until it is released.
///
/// [`SandboxGuard::release`] stops the sandbox unless it is known to have
/// exited, then removes it. Errors are logged and swallowed. A guard dropped
/// without release (process interrupt) leaves the container in place.
pub struct SandboxGuard {
    handle: Box<dyn SandboxHandle>,
    exited: bool,
    released: bool,
}

impl SandboxGuard {
    pub fn new(handle: Box<dyn SandboxHandle>) -> Self {
        Self {
            handle,
            exited: false,
            released: false,
        }
    }

    pub fn handle(&mut self) -> &mut dyn SandboxHandle {
        self.handle.as_mut()
    }

    /// Record that the sandbox exited on its own.
    pub fn mark_exited(&mut self) {
        self.exited = true;
    }

    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let id = self.handle.id().to_string();
        if !self.exited {
            info!(container = %id, "Force-stopping container");
            if let Err(e) = self.handle.stop().await {
                warn!(container = %id, error = %e, "Failed to stop container");
            }
        }
        if let Err(e) = self.handle.remove().await {
            warn!(container = %id, error = %e, "Failed to remove container");
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(container = %self.handle.id(), "Container left running without cleanup");
        }
    }
}

/// How the running phase ended.
#[derive(Debug)]
enum RunOutcome {
    Exited(i64),
    TimedOut,
    Errored(SandboxError),
}

/// Reassembles container output into whole lines; a frame may end
/// mid-line.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// Feed a chunk and return every line it completes.
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let Some(end) = self.partial.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(end + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete.lines().map(str::to_string).collect()
    }

    /// Unterminated output left when the stream ends.
    fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.partial);
        (!tail.is_empty()).then_some(tail)
    }
}

fn echo(task_id: &TaskId, line: &str) {
    info!(target: "matcha::sandbox", task_id = %task_id, "{}", line);
}

/// Phase bookkeeping for one task.
struct Execution {
    phase: ExecutionPhase,
    result: ExecutionResult,
}

impl Execution {
    fn new(task: &Task) -> Self {
        Self {
            phase: ExecutionPhase::Assigned,
            result: ExecutionResult::new(task.id.clone()),
        }
    }

    fn advance(&mut self, next: ExecutionPhase) {
        let from = self.phase;
        match self.phase.transition(next) {
            Ok(()) => {
                debug!(task_id = %self.result.task_id, from = %from, to = %next, "Phase change");
                self.result.phases.push(next);
            }
            Err(e) => error!(task_id = %self.result.task_id, error = %e, "Rejected phase change"),
        }
    }

    /// Fail with an agent-side message appended to the log.
    fn fail(&mut self, message: &str) {
        self.result.append_note(message);
        self.advance(ExecutionPhase::Failed);
    }

    fn finish(mut self) -> ExecutionResult {
        let status = self.phase.terminal_status().unwrap_or(TaskStatus::Failed);
        self.advance(ExecutionPhase::CleanedUp);
        if let Err(e) = self.result.finalize(status) {
            error!(task_id = %self.result.task_id, error = %e, "Result finalized twice");
        }
        self.result
    }
}

/// Launches, watches, and cleans up task sandboxes.
pub struct ExecutionSupervisor {
    context: Arc<AgentContext>,
    runtime: Arc<dyn SandboxRuntime>,
    orchestrator: Arc<dyn Orchestrator>,
    packager: ResultPackager,
    request_gpus: bool,
}

impl ExecutionSupervisor {
    pub fn new(
        context: Arc<AgentContext>,
        runtime: Arc<dyn SandboxRuntime>,
        orchestrator: Arc<dyn Orchestrator>,
        packager: ResultPackager,
        request_gpus: bool,
    ) -> Self {
        Self {
            context,
            runtime,
            orchestrator,
            packager,
            request_gpus,
        }
    }

    /// Run one task to completion and report its terminal status.
    ///
    /// Never returns an error: every failure becomes a `FAILED` result.
    pub async fn run(&self, task: Task) -> ExecutionResult {
        info!(task_id = %task.id, input = %task.input_path, script = %task.script_path, "Assigned task");

        let result = self.execute(&task).await;
        info!(
            task_id = %result.task_id,
            status = %result.status,
            exit_code = ?result.exit_code,
            log_bytes = result.logs.len(),
            "Task finished"
        );

        self.report(StatusUpdate {
            task_id: result.task_id.clone(),
            status: result.status,
            logs: Some(result.logs.clone()),
            result_url: result.result_ref.clone(),
        })
        .await;
        result
    }

    async fn execute(&self, task: &Task) -> ExecutionResult {
        let mut exec = Execution::new(task);
        let config = &self.context.config;

        if task.input_path.trim().is_empty() {
            warn!(task_id = %task.id, "Task has no input_path");
            exec.fail("Task has no input_path; nothing to run");
            return exec.finish();
        }

        let workspace = match Workspace::acquire_in(&task.id, &config.workspace_root) {
            Ok(ws) => ws,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to create workspace");
                exec.fail(&format!("Failed to create workspace: {}", e));
                return exec.finish();
            }
        };

        exec.advance(ExecutionPhase::Launching);
        let spec = self.launch_spec(task, &workspace);
        let mut guard = match self.runtime.launch(&spec).await {
            Ok(handle) => SandboxGuard::new(handle),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Launch failed");
                exec.fail(&e.to_string());
                workspace.close();
                return exec.finish();
            }
        };

        exec.advance(ExecutionPhase::Running);
        self.report(StatusUpdate::running(task.id.clone())).await;

        let outcome = self.supervise(&mut guard, &mut exec.result).await;
        match outcome {
            RunOutcome::Exited(0) => {
                exec.result.exit_code = Some(0);
                exec.advance(ExecutionPhase::Succeeded);
            }
            RunOutcome::Exited(code) => {
                warn!(task_id = %task.id, exit_code = code, "Container exited with non-zero code");
                exec.result.exit_code = Some(code);
                exec.advance(ExecutionPhase::Failed);
            }
            RunOutcome::TimedOut => {
                warn!(task_id = %task.id, timeout_secs = config.task_timeout.as_secs(), "Task timed out");
                exec.result.append_note(&format!(
                    "Task timed out after {}s",
                    config.task_timeout.as_secs()
                ));
                exec.advance(ExecutionPhase::TimedOut);
            }
            RunOutcome::Errored(e) => {
                error!(task_id = %task.id, error = %e, "Execution error");
                exec.fail(&format!("Execution error: {}", e));
            }
        }

        guard.release().await;

        if exec.phase == ExecutionPhase::Succeeded {
            if let Some(destination) = &task.upload_url {
                exec.result.result_ref = self
                    .packager
                    .deliver(&task.id, workspace.path(), destination)
                    .await;
            }
        }

        workspace.close();
        exec.finish()
    }

    /// Stream output then wait for exit, all within the task deadline.
    async fn supervise(&self, guard: &mut SandboxGuard, result: &mut ExecutionResult) -> RunOutcome {
        let deadline = Instant::now() + self.context.config.task_timeout;
        let task_id = result.task_id.clone();

        let mut logs = guard.handle().logs();
        let mut lines = LineBuffer::default();
        let streamed = timeout_at(deadline, async {
            while let Some(chunk) = logs.next().await {
                let chunk = chunk?;
                for line in lines.push(&chunk) {
                    echo(&task_id, &line);
                }
                result.append_log(&chunk);
            }
            Ok::<(), SandboxError>(())
        })
        .await;
        drop(logs);
        if let Some(tail) = lines.finish() {
            echo(&task_id, &tail);
        }

        match streamed {
            Err(_) => return RunOutcome::TimedOut,
            Ok(Err(e)) => return RunOutcome::Errored(e),
            Ok(Ok(())) => {}
        }

        match timeout_at(deadline, guard.handle().wait()).await {
            Err(_) => RunOutcome::TimedOut,
            Ok(Ok(code)) => {
                guard.mark_exited();
                RunOutcome::Exited(code)
            }
            Ok(Err(e)) => RunOutcome::Errored(e),
        }
    }

    fn launch_spec(&self, task: &Task, workspace: &Workspace) -> LaunchSpec {
        let config = &self.context.config;
        LaunchSpec {
            image: config.runner_image.clone(),
            env: vec![
                ("PROJECT_URL".to_string(), task.input_path.clone()),
                ("SCRIPT_PATH".to_string(), task.script_path.clone()),
            ],
            binds: vec![VolumeBinding {
                host_path: workspace.path().to_path_buf(),
                container_path: config.container_output_dir.clone(),
                read_write: true,
            }],
            network_mode: "host".to_string(),
            request_all_gpus: self.request_gpus,
            labels: vec![
                ("matcha.task_id".to_string(), task.id.to_string()),
                (
                    "matcha.provider_id".to_string(),
                    self.context.identity.provider_id.to_string(),
                ),
            ],
        }
    }

    /// Best-effort status push; failures are logged only.
    async fn report(&self, update: StatusUpdate) {
        if let Err(e) = self.orchestrator.report_status(&update).await {
            warn!(task_id = %update.task_id, status = %update.status, error = %e, "Failed to update task status");
        }
    }
}
