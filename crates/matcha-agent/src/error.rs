//! Error types for the provider agent.

use thiserror::Error;

/// Errors talking to the orchestrator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level HTTP failure (DNS, TLS, connect, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The orchestrator answered with a non-success status.
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The orchestrator rejected the request with an error message.
    #[error("orchestrator error: {0}")]
    Rejected(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Docker API failure.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The runtime returned something unusable.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The container exited without reporting an exit code.
    #[error("container {0} exited without a status code")]
    NoExitCode(String),
}

/// Errors archiving or transferring task output.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("upload failed: {0}")]
    Transfer(#[from] reqwest::Error),

    /// Destination answered with a non-2xx status.
    #[error("upload rejected with HTTP {0}")]
    Rejected(u16),
}

/// Errors reading or writing the local credentials file.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed credentials file {path}: {message}")]
    Malformed { path: String, message: String },
}

/// Fatal startup errors. Each one ends the process with exit code 1.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No user id from the environment and no persisted credentials.
    #[error("USER_ID not found. Run: matcha-agent --enroll <token>")]
    MissingCredentials,

    #[error("enrollment failed: {0}")]
    Enrollment(#[source] ClientError),

    #[error("registration failed: {0}")]
    Registration(#[source] ClientError),

    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    /// The container runtime is not reachable.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[source] SandboxError),
}
