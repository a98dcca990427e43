//! JSON bodies exchanged with the orchestrator HTTP API.

use serde::{Deserialize, Serialize};

use matcha_core::{
    AcceleratorSpec, ProviderId, ProviderStatus, Task, TaskId, TaskStatus, Telemetry, UserId,
};

pub const ENROLL_PATH: &str = "/provider/enroll";
pub const REGISTER_PATH: &str = "/provider/register";
pub const HEARTBEAT_PATH: &str = "/provider/heartbeat";
pub const GET_TASK_PATH: &str = "/provider/get_task";
pub const TASK_UPDATE_PATH: &str = "/provider/task_update";

/// `POST /provider/enroll`
#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub token: String,
    pub provider_id: ProviderId,
}

/// Successful enrollment.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub user_id: UserId,
}

/// Error body returned on non-200 responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `POST /provider/register`
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub provider_id: ProviderId,
    pub user_id: UserId,
    pub hardware_specs: Telemetry,
    pub gpus: Vec<AcceleratorSpec>,
}

/// `POST /provider/heartbeat`
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest<T> {
    pub provider_id: ProviderId,
    pub telemetry: T,
}

/// Telemetry body of the shutdown heartbeat.
#[derive(Debug, Serialize, Deserialize)]
pub struct OfflineTelemetry {
    pub status: ProviderStatus,
}

impl Default for OfflineTelemetry {
    fn default() -> Self {
        Self {
            status: ProviderStatus::Offline,
        }
    }
}

/// `POST /provider/get_task`
#[derive(Debug, Serialize, Deserialize)]
pub struct GetTaskRequest {
    pub provider_id: ProviderId,
}

/// Poll response; `task` is absent or null when nothing is queued.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetTaskResponse {
    #[serde(default)]
    pub task: Option<Task>,
}

/// `POST /provider/task_update`
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskUpdateRequest {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result_url: Option<String>,
    pub details: TaskUpdateDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskUpdateDetails {
    pub stdout: Option<String>,
}
