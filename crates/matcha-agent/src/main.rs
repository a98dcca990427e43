//! Matcha provider agent daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use matcha_agent::config::{DEFAULT_API_KEY, DEFAULT_ORCHESTRATOR_URL, DEFAULT_RUNNER_IMAGE};
use matcha_agent::credentials::{resolve_identity, resolve_provider_id, CredentialStore};
use matcha_agent::orchestrator::HttpOrchestrator;
use matcha_agent::packager::{HttpUploader, ResultPackager};
use matcha_agent::sandbox::DockerRuntime;
use matcha_agent::telemetry::{SystemTelemetry, TelemetrySource};
use matcha_agent::{Agent, AgentContext, AgentError, Config, ExecutionSupervisor};
use matcha_core::ProviderIdentity;

/// Matcha provider agent - contributes this machine to the compute pool
#[derive(Parser)]
#[command(name = "matcha-agent")]
#[command(about = "Runs Matcha tasks on this machine", long_about = None)]
struct Args {
    /// Enrollment token; binds this machine to an account and exits
    #[arg(long, value_name = "TOKEN")]
    enroll: Option<String>,

    /// Orchestrator base URL
    #[arg(long, env = "ORCHESTRATOR_URL", default_value = DEFAULT_ORCHESTRATOR_URL)]
    orchestrator_url: String,

    /// Provider API key
    #[arg(long, env = "ORCHESTRATOR_API_KEY_PROVIDERS", default_value = DEFAULT_API_KEY, hide_env_values = true)]
    api_key: String,

    /// Provider id (defaults to the stored or host-derived id)
    #[arg(long, env = "PROVIDER_ID")]
    provider_id: Option<String>,

    /// User id (defaults to the stored id)
    #[arg(long, env = "USER_ID")]
    user_id: Option<String>,

    /// Credentials file written by --enroll
    #[arg(long, env = "MATCHA_CREDENTIALS_FILE", default_value = ".env")]
    credentials_file: PathBuf,

    /// Container image tasks run in
    #[arg(long, env = "MATCHA_RUNNER_IMAGE", default_value = DEFAULT_RUNNER_IMAGE)]
    image: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("matcha=info,matcha_agent=info")),
        )
        .with_target(true)
        .init();

    let mut args = Args::parse();
    match CredentialStore::new(&args.credentials_file).export_to_env() {
        // Flags fall back to the environment, so pick up the file's values.
        Ok(true) => args = Args::parse(),
        Ok(false) => {}
        Err(e) => {
            error!(error = %e, "Failed to read credentials file");
            return ExitCode::FAILURE;
        }
    }

    let config = Config {
        orchestrator_url: args.orchestrator_url.clone(),
        api_key: args.api_key.clone(),
        credentials_path: args.credentials_file.clone(),
        runner_image: args.image.clone(),
        ..Config::default()
    };

    let result = match args.enroll.as_deref() {
        Some(token) => enroll(&args, &config, token).await,
        None => serve(&args, config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Agent stopped");
            ExitCode::FAILURE
        }
    }
}

/// Exchange a token for a user id and persist it.
async fn enroll(args: &Args, config: &Config, token: &str) -> Result<(), AgentError> {
    let store = CredentialStore::new(&config.credentials_path);
    let stored = store.load()?;
    let provider_id = resolve_provider_id(args.provider_id.as_deref(), stored.as_ref());

    info!(provider_id = %provider_id, orchestrator = %config.orchestrator_url, "Enrolling");
    let client =
        HttpOrchestrator::new(&config.orchestrator_url, &config.api_key).map_err(AgentError::Enrollment)?;
    let user_id = client
        .enroll(token, &provider_id)
        .await
        .map_err(AgentError::Enrollment)?;

    store.append(&ProviderIdentity {
        provider_id,
        user_id: user_id.clone(),
    })?;
    info!(
        user_id = %user_id,
        path = %store.path().display(),
        "Enrolled; credentials saved. Start the agent without --enroll."
    );
    Ok(())
}

async fn serve(args: &Args, config: Config) -> Result<(), AgentError> {
    let stored = CredentialStore::new(&config.credentials_path).load()?;
    let identity = resolve_identity(
        args.provider_id.as_deref(),
        args.user_id.as_deref(),
        stored.as_ref(),
    )?;

    info!(
        provider_id = %identity.provider_id,
        orchestrator = %config.orchestrator_url,
        image = %config.runner_image,
        "Starting Matcha agent"
    );

    let runtime = match DockerRuntime::connect(config.stop_grace_secs).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Docker is not reachable. Start Docker Desktop or the docker service, then retry.");
            return Err(AgentError::RuntimeUnavailable(e));
        }
    };

    let telemetry = Arc::new(SystemTelemetry::detect());
    let request_gpus = telemetry.has_accelerator();

    let orchestrator = Arc::new(
        HttpOrchestrator::new(&config.orchestrator_url, &config.api_key)
            .map_err(AgentError::Registration)?,
    );
    let packager = ResultPackager::new(config.archive_dir.clone(), Arc::new(HttpUploader::new()));
    let context = Arc::new(AgentContext::new(identity, config));

    let supervisor = ExecutionSupervisor::new(
        context.clone(),
        Arc::new(runtime),
        orchestrator.clone(),
        packager,
        request_gpus,
    );
    let agent = Agent::new(context, orchestrator, telemetry, supervisor);

    agent.register().await?;
    agent
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for interrupt");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Agent stopped");
    Ok(())
}
