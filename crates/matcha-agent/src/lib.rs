//! Matcha Provider Agent Library
//!
//! This crate turns a host into a compute provider: it registers with the
//! orchestrator, reports liveness and telemetry, and runs assigned tasks in
//! Docker containers, returning their logs and output archives.

pub mod agent;
pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod packager;
pub mod sandbox;
pub mod supervisor;
pub mod telemetry;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use agent::Agent;
pub use config::{AgentContext, Config};
pub use error::AgentError;
pub use supervisor::ExecutionSupervisor;
