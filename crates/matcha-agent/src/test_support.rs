//! In-memory fakes of the orchestrator, container runtime, and uploader.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;

use matcha_core::{AcceleratorSpec, ProviderId, ProviderIdentity, Task, TaskStatus, Telemetry};

use crate::error::{ClientError, PackageError, SandboxError};
use crate::orchestrator::{Orchestrator, StatusUpdate};
use crate::packager::ResultUploader;
use crate::sandbox::{LaunchSpec, LogStream, SandboxHandle, SandboxRuntime};
use crate::telemetry::TelemetrySource;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// Accelerators advertised at registration.
    Register(Vec<AcceleratorSpec>),
    Heartbeat,
    Offline,
    Poll,
    Status(StatusUpdate),
}

#[derive(Default)]
pub struct FakeOrchestrator {
    pub calls: Mutex<Vec<(Instant, Call)>>,
    pub tasks: Mutex<VecDeque<Task>>,
    pub fail_register: bool,
    pub fail_heartbeat: bool,
    pub fail_offline: bool,
    pub fail_poll: bool,
    pub fail_status: bool,
    /// Simulated latency of every call.
    pub latency: Option<Duration>,
    /// Extra latency of heartbeats only.
    pub heartbeat_latency: Option<Duration>,
}

impl FakeOrchestrator {
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<StatusUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Status(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_statuses(&self) -> Vec<StatusUpdate> {
        self.statuses()
            .into_iter()
            .filter(|u| u.status != TaskStatus::Running)
            .collect()
    }

    async fn record(&self, call: Call, fail: bool) -> Result<(), ClientError> {
        let heartbeat = call == Call::Heartbeat;
        self.calls.lock().unwrap().push((Instant::now(), call));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let (true, Some(latency)) = (heartbeat, self.heartbeat_latency) {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(ClientError::Rejected("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn register(
        &self,
        _identity: &ProviderIdentity,
        _telemetry: &Telemetry,
        accelerators: &[AcceleratorSpec],
    ) -> Result<(), ClientError> {
        self.record(Call::Register(accelerators.to_vec()), self.fail_register)
            .await
    }

    async fn heartbeat(
        &self,
        _provider_id: &ProviderId,
        _telemetry: &Telemetry,
    ) -> Result<(), ClientError> {
        self.record(Call::Heartbeat, self.fail_heartbeat).await
    }

    async fn go_offline(
        &self,
        _provider_id: &ProviderId,
        _timeout: Duration,
    ) -> Result<(), ClientError> {
        self.record(Call::Offline, self.fail_offline).await
    }

    async fn poll_for_task(&self, _provider_id: &ProviderId) -> Result<Option<Task>, ClientError> {
        self.record(Call::Poll, self.fail_poll).await?;
        Ok(self.tasks.lock().unwrap().pop_front())
    }

    async fn report_status(&self, update: &StatusUpdate) -> Result<(), ClientError> {
        self.record(Call::Status(update.clone()), self.fail_status).await
    }
}

#[derive(Debug, Clone)]
pub enum FakeExit {
    Code(i64),
    Hang,
    Error(String),
}

/// How every sandbox launched by a [`FakeRuntime`] behaves.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub launch_error: Option<String>,
    pub chunks: Vec<Result<String, String>>,
    pub hang_logs: bool,
    pub exit: FakeExit,
    /// Files the "container" writes into its output directory.
    pub outputs: Vec<(String, Vec<u8>)>,
    pub stop_error: bool,
    pub remove_error: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            launch_error: None,
            chunks: Vec::new(),
            hang_logs: false,
            exit: FakeExit::Code(0),
            outputs: Vec::new(),
            stop_error: false,
            remove_error: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RuntimeRecord {
    pub launches: Vec<LaunchSpec>,
    pub stops: usize,
    pub removes: usize,
}

#[derive(Default)]
pub struct FakeRuntime {
    pub script: FakeScript,
    pub record: Arc<Mutex<RuntimeRecord>>,
}

impl FakeRuntime {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            record: Arc::default(),
        }
    }

    pub fn stops(&self) -> usize {
        self.record.lock().unwrap().stops
    }

    pub fn removes(&self) -> usize {
        self.record.lock().unwrap().removes
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.record.lock().unwrap().launches.clone()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        self.record.lock().unwrap().launches.push(spec.clone());
        if let Some(message) = &self.script.launch_error {
            return Err(SandboxError::Runtime(message.clone()));
        }

        let output_dir = &spec.binds[0].host_path;
        for (name, bytes) in &self.script.outputs {
            std::fs::write(output_dir.join(name), bytes).map_err(|e| SandboxError::Runtime(e.to_string()))?;
        }

        Ok(Box::new(FakeHandle {
            script: self.script.clone(),
            record: self.record.clone(),
        }))
    }
}

struct FakeHandle {
    script: FakeScript,
    record: Arc<Mutex<RuntimeRecord>>,
}

#[async_trait]
impl SandboxHandle for FakeHandle {
    fn id(&self) -> &str {
        "fake-container"
    }

    fn logs(&mut self) -> LogStream {
        let chunks = stream::iter(
            self.script
                .chunks
                .clone()
                .into_iter()
                .map(|c| c.map_err(SandboxError::Runtime)),
        );
        if self.script.hang_logs {
            Box::pin(chunks.chain(stream::pending()))
        } else {
            Box::pin(chunks)
        }
    }

    async fn wait(&mut self) -> Result<i64, SandboxError> {
        match &self.script.exit {
            FakeExit::Code(code) => Ok(*code),
            FakeExit::Hang => std::future::pending().await,
            FakeExit::Error(message) => Err(SandboxError::Runtime(message.clone())),
        }
    }

    async fn stop(&mut self) -> Result<(), SandboxError> {
        self.record.lock().unwrap().stops += 1;
        if self.script.stop_error {
            return Err(SandboxError::Runtime("stop failed".to_string()));
        }
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), SandboxError> {
        self.record.lock().unwrap().removes += 1;
        if self.script.remove_error {
            return Err(SandboxError::Runtime("remove failed".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUploader {
    /// Destination of every attempt and whether the archive was on disk.
    pub uploads: Mutex<Vec<(String, bool)>>,
    pub fail: bool,
}

impl FakeUploader {
    pub fn uploads(&self) -> Vec<(String, bool)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultUploader for FakeUploader {
    async fn upload(&self, archive: &Path, destination: &str) -> Result<(), PackageError> {
        self.uploads
            .lock()
            .unwrap()
            .push((destination.to_string(), archive.is_file()));
        if self.fail {
            return Err(PackageError::Rejected(500));
        }
        Ok(())
    }
}

/// Telemetry source that never touches the host.
#[derive(Default)]
pub struct StaticTelemetry {
    pub gpu: bool,
}

impl TelemetrySource for StaticTelemetry {
    fn sample(&self) -> Telemetry {
        Telemetry::unavailable()
    }

    fn accelerators(&self) -> Vec<AcceleratorSpec> {
        if self.gpu {
            vec![AcceleratorSpec::new(0, "Fake GPU")]
        } else {
            Vec::new()
        }
    }

    fn has_accelerator(&self) -> bool {
        self.gpu
    }
}
