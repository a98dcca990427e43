//! HTTP implementation of the orchestrator client.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use matcha_core::{AcceleratorSpec, ProviderId, ProviderIdentity, Task, Telemetry, UserId};

use super::wire::{
    EnrollRequest, EnrollResponse, ErrorResponse, GetTaskRequest, GetTaskResponse,
    HeartbeatRequest, OfflineTelemetry, RegisterRequest, TaskUpdateDetails, TaskUpdateRequest,
    ENROLL_PATH, GET_TASK_PATH, HEARTBEAT_PATH, REGISTER_PATH, TASK_UPDATE_PATH,
};
use super::{Orchestrator, StatusUpdate};
use crate::error::ClientError;

const API_KEY_HEADER: &str = "X-API-Key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-over-HTTP orchestrator client.
#[derive(Debug, Clone)]
pub struct HttpOrchestrator {
    inner: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpOrchestrator {
    /// Create a new client.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Exchange an enrollment token for the account id.
    pub async fn enroll(&self, token: &str, provider_id: &ProviderId) -> Result<UserId, ClientError> {
        let body = EnrollRequest {
            token: token.to_string(),
            provider_id: provider_id.clone(),
        };
        let response = self.send(ENROLL_PATH, &body, None).await?;
        let status = response.status();

        if status.is_success() {
            let parsed: EnrollResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Serialization(e.to_string()))?;
            return Ok(parsed.user_id);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(err) => Err(ClientError::Rejected(err.error)),
            Err(_) => Err(ClientError::Status {
                endpoint: ENROLL_PATH.to_string(),
                status: status.as_u16(),
                body: text,
            }),
        }
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST request");

        let mut request = self
            .inner
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        Ok(request.send().await?)
    }

    /// POST and require a 2xx; the response body is ignored.
    async fn post_ack<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let response = self.send(path, body, timeout).await?;
        ensure_success(path, response).await.map(|_| ())
    }

    /// POST and decode a JSON reply from a 2xx.
    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self.send(path, body, None).await?;
        let response = ensure_success(path, response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return serde_json::from_str("{}").map_err(|e| ClientError::Serialization(e.to_string()));
        }
        serde_json::from_str(&text).map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

async fn ensure_success(
    path: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        endpoint: path.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn register(
        &self,
        identity: &ProviderIdentity,
        telemetry: &Telemetry,
        accelerators: &[AcceleratorSpec],
    ) -> Result<(), ClientError> {
        let body = RegisterRequest {
            provider_id: identity.provider_id.clone(),
            user_id: identity.user_id.clone(),
            hardware_specs: telemetry.clone(),
            gpus: accelerators.to_vec(),
        };
        self.post_ack(REGISTER_PATH, &body, None).await?;
        info!(provider_id = %identity.provider_id, gpus = accelerators.len(), "Registered with orchestrator");
        Ok(())
    }

    async fn heartbeat(
        &self,
        provider_id: &ProviderId,
        telemetry: &Telemetry,
    ) -> Result<(), ClientError> {
        let body = HeartbeatRequest {
            provider_id: provider_id.clone(),
            telemetry,
        };
        self.post_ack(HEARTBEAT_PATH, &body, None).await
    }

    async fn go_offline(
        &self,
        provider_id: &ProviderId,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let body = HeartbeatRequest {
            provider_id: provider_id.clone(),
            telemetry: OfflineTelemetry::default(),
        };
        self.post_ack(HEARTBEAT_PATH, &body, Some(timeout)).await
    }

    async fn poll_for_task(&self, provider_id: &ProviderId) -> Result<Option<Task>, ClientError> {
        let body = GetTaskRequest {
            provider_id: provider_id.clone(),
        };
        let response: GetTaskResponse = self.post_json(GET_TASK_PATH, &body).await?;
        Ok(response.task)
    }

    async fn report_status(&self, update: &StatusUpdate) -> Result<(), ClientError> {
        let body = TaskUpdateRequest {
            task_id: update.task_id.clone(),
            status: update.status,
            result_url: update.result_url.clone(),
            details: TaskUpdateDetails {
                stdout: update.logs.clone(),
            },
        };
        self.post_ack(TASK_UPDATE_PATH, &body, None).await
    }
}
