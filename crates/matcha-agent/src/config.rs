//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use matcha_core::ProviderIdentity;

/// Default orchestrator endpoint.
pub const DEFAULT_ORCHESTRATOR_URL: &str = "https://matcha-orchestrator.onrender.com";

/// Key used when none is configured; accepted only by development orchestrators.
pub const DEFAULT_API_KEY: &str = "debug-provider-key";

/// Image every task runs in.
pub const DEFAULT_RUNNER_IMAGE: &str = "ruasnv/matcha-runner:latest";

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator base URL.
    pub orchestrator_url: String,

    /// Sent as `X-API-Key` on every orchestrator call.
    pub api_key: String,

    /// Dotenv-format file holding `USER_ID` / `PROVIDER_ID`.
    pub credentials_path: PathBuf,

    /// Container image tasks run in.
    pub runner_image: String,

    /// Mount point of the workspace inside the container.
    pub container_output_dir: String,

    /// Parent of per-task workspaces.
    pub workspace_root: PathBuf,

    /// Where result archives are staged before upload.
    pub archive_dir: PathBuf,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Bound on one heartbeat, sampling included. Kept at or below
    /// `poll_interval` so a stuck heartbeat never holds back a poll.
    pub heartbeat_timeout: Duration,

    /// Pause between poll cycles.
    pub poll_interval: Duration,

    /// Wall-clock bound on a task, from launch to exit.
    pub task_timeout: Duration,

    /// Bound on the offline notification sent at shutdown.
    pub offline_timeout: Duration,

    /// Grace period given to a container on forced stop (seconds).
    pub stop_grace_secs: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator_url: DEFAULT_ORCHESTRATOR_URL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            credentials_path: PathBuf::from(".env"),
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            container_output_dir: "/outputs".to_string(),
            workspace_root: std::env::temp_dir(),
            archive_dir: std::env::temp_dir(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(300),
            offline_timeout: Duration::from_secs(2),
            stop_grace_secs: 5,
        }
    }
}

/// Everything a component needs to know about this process, built once at
/// startup and shared read-only.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub identity: ProviderIdentity,
    pub config: Config,
}

impl AgentContext {
    pub fn new(identity: ProviderIdentity, config: Config) -> Self {
        Self { identity, config }
    }
}
