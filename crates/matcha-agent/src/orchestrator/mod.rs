//! Orchestrator client.
//!
//! Every call is a single request/response exchange. Nothing here retries:
//! heartbeat and status failures surface as `Err` and the caller decides to
//! ignore them, so the ignore policy is visible at the call site.

mod http;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;

use matcha_core::{AcceleratorSpec, ProviderId, ProviderIdentity, Task, TaskId, TaskStatus, Telemetry};

use crate::error::ClientError;

pub use http::HttpOrchestrator;

/// A status event for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub logs: Option<String>,
    pub result_url: Option<String>,
}

impl StatusUpdate {
    /// The `RUNNING` event sent right after launch.
    pub fn running(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            logs: None,
            result_url: None,
        }
    }
}

/// Operations the agent needs from the orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Announce this node. Failure is fatal to the caller.
    async fn register(
        &self,
        identity: &ProviderIdentity,
        telemetry: &Telemetry,
        accelerators: &[AcceleratorSpec],
    ) -> Result<(), ClientError>;

    /// Liveness ping carrying fresh telemetry.
    async fn heartbeat(&self, provider_id: &ProviderId, telemetry: &Telemetry)
        -> Result<(), ClientError>;

    /// Tell the orchestrator this node is going away, bounded by `timeout`.
    async fn go_offline(&self, provider_id: &ProviderId, timeout: Duration)
        -> Result<(), ClientError>;

    /// Ask for work. `Ok(None)` means nothing is queued.
    async fn poll_for_task(&self, provider_id: &ProviderId) -> Result<Option<Task>, ClientError>;

    /// Push a task status event.
    async fn report_status(&self, update: &StatusUpdate) -> Result<(), ClientError>;
}
