//! Matcha Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - HTTP/orchestrator transport
//! - The container runtime
//! - Host telemetry readers
//!
//! All types here describe what a provider node is, what it is asked to run,
//! and how a single task execution progresses.

pub mod error;
pub mod identity;
pub mod ids;
pub mod status;
pub mod task;
pub mod telemetry;

// Re-export commonly used types
pub use error::CoreError;
pub use identity::ProviderIdentity;
pub use ids::{ProviderId, TaskId, UserId};
pub use status::{ExecutionPhase, ProviderStatus, TaskStatus};
pub use task::{ExecutionResult, Task, DEFAULT_SCRIPT_PATH};
pub use telemetry::{AcceleratorSpec, GpuTelemetry, Telemetry};
