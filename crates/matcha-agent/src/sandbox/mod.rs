//! Container runtime abstraction.
//!
//! The supervisor drives a sandbox through [`SandboxRuntime`] and
//! [`SandboxHandle`]; [`DockerRuntime`] is the production implementation.

mod docker;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::SandboxError;

pub use docker::DockerRuntime;

/// Ordered output of a running sandbox, stdout and stderr interleaved.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, SandboxError>> + Send>>;

/// A host directory mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_write: bool,
}

impl VolumeBinding {
    /// Docker `-v` syntax.
    pub fn to_bind_string(&self) -> String {
        let mode = if self.read_write { "rw" } else { "ro" };
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            mode
        )
    }
}

/// Everything needed to start one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub binds: Vec<VolumeBinding>,
    pub network_mode: String,
    /// Ask for every accelerator on the host.
    pub request_all_gpus: bool,
    /// Labels attached to the sandbox for operators.
    pub labels: Vec<(String, String)>,
}

/// Starts sandboxes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create and start a sandbox. On error nothing is left running.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError>;
}

/// A started sandbox.
#[async_trait]
pub trait SandboxHandle: Send {
    /// Runtime identifier, for logs.
    fn id(&self) -> &str;

    /// Follow the sandbox output until it closes.
    fn logs(&mut self) -> LogStream;

    /// Wait for exit and return the exit code. Unbounded; callers apply
    /// their own deadline.
    async fn wait(&mut self) -> Result<i64, SandboxError>;

    /// Stop the sandbox if it is still running.
    async fn stop(&mut self) -> Result<(), SandboxError>;

    /// Delete the sandbox.
    async fn remove(&mut self) -> Result<(), SandboxError>;
}
