//! Docker-backed sandbox runtime.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, ContainerWaitResponse, DeviceRequest, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{LaunchSpec, LogStream, SandboxHandle, SandboxRuntime};
use crate::error::SandboxError;

/// Runs sandboxes as local Docker containers.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_grace_secs: i32,
}

impl DockerRuntime {
    /// Connect to the local daemon and verify it answers.
    pub async fn connect(stop_grace_secs: i32) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!("Connected to Docker daemon");
        Ok(Self {
            docker,
            stop_grace_secs,
        })
    }

    /// Pull `image` unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!(image = %image, "Runner image not found locally, pulling");
            }
            Err(e) => return Err(e.into()),
        }

        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        info!(image = %image, "Runner image pulled");
        Ok(())
    }
}

/// Translate a launch spec into a container definition.
fn container_body(spec: &LaunchSpec) -> ContainerCreateBody {
    let device_requests = spec.request_all_gpus.then(|| {
        vec![DeviceRequest {
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    let host_config = HostConfig {
        binds: Some(spec.binds.iter().map(|b| b.to_bind_string()).collect()),
        network_mode: Some(spec.network_mode.clone()),
        device_requests,
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        labels: Some(spec.labels.iter().cloned().collect::<HashMap<_, _>>()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let id = self
            .docker
            .create_container(None::<CreateContainerOptions>, container_body(spec))
            .await?
            .id;

        let handle = DockerHandle {
            docker: self.docker.clone(),
            id,
            stop_grace_secs: self.stop_grace_secs,
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions>)
            .await
        {
            // Created but never started: remove it before reporting.
            let mut handle = handle;
            if let Err(remove_err) = handle.remove().await {
                warn!(container = %handle.id, error = %remove_err, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }

        info!(container = %handle.id, image = %spec.image, "Container started");
        Ok(Box::new(handle))
    }
}

/// A running Docker container.
struct DockerHandle {
    docker: Docker,
    id: String,
    stop_grace_secs: i32,
}

#[async_trait]
impl SandboxHandle for DockerHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn logs(&mut self) -> LogStream {
        let options = LogsOptionsBuilder::default()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .build();
        Box::pin(
            self.docker
                .logs(&self.id, Some(options))
                .map(|chunk| chunk.map(|out| out.to_string()).map_err(SandboxError::from)),
        )
    }

    async fn wait(&mut self) -> Result<i64, SandboxError> {
        let mut wait = self
            .docker
            .wait_container(&self.id, None::<WaitContainerOptions>);
        match wait.next().await {
            Some(result) => exit_code(result),
            None => Err(SandboxError::NoExitCode(self.id.clone())),
        }
    }

    async fn stop(&mut self) -> Result<(), SandboxError> {
        let options = StopContainerOptionsBuilder::default()
            .t(self.stop_grace_secs)
            .build();
        self.docker.stop_container(&self.id, Some(options)).await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker.remove_container(&self.id, Some(options)).await?;
        Ok(())
    }
}

/// Exit code from one wait frame. bollard reports non-zero exits as an
/// error carrying the code; a message means the daemon failed the wait.
fn exit_code(
    result: Result<ContainerWaitResponse, bollard::errors::Error>,
) -> Result<i64, SandboxError> {
    match result {
        Ok(response) => match response.error.and_then(|e| e.message) {
            Some(message) if !message.is_empty() => Err(SandboxError::Runtime(message)),
            _ => Ok(response.status_code),
        },
        Err(bollard::errors::Error::DockerContainerWaitError { error, code }) if error.is_empty() => {
            Ok(code)
        }
        Err(bollard::errors::Error::DockerContainerWaitError { error, .. }) => {
            Err(SandboxError::Runtime(error))
        }
        Err(e) => Err(e.into()),
    }
}
