//! Hardware telemetry snapshots.

use serde::{Deserialize, Serialize};

use crate::ProviderStatus;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Convert a byte count to GiB rounded to two decimals.
pub fn gib(bytes: u64) -> f64 {
    ((bytes as f64 / BYTES_PER_GIB) * 100.0).round() / 100.0
}

/// Point-in-time utilization of the host. Rebuilt for every call that
/// carries it and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Global CPU load in percent.
    pub cpu_load: f32,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub status: ProviderStatus,
    pub gpu: Option<GpuTelemetry>,
}

impl Telemetry {
    /// Snapshot used when the host could not be read at all.
    pub fn unavailable() -> Self {
        Self {
            cpu_load: 0.0,
            ram_used_gb: 0.0,
            ram_total_gb: 0.0,
            status: ProviderStatus::Idle,
            gpu: None,
        }
    }
}

/// Accelerator section of a telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpuTelemetry {
    /// Live reading.
    Online {
        name: String,
        /// Utilization in percent.
        load: u32,
        vram_used: f64,
        vram_total: f64,
    },
    /// The accelerator exists but could not be queried.
    Offline {
        name: String,
        load: u32,
        status: ProviderStatus,
    },
}

impl GpuTelemetry {
    /// Marker for an accelerator whose live query failed.
    pub fn offline(name: impl Into<String>) -> Self {
        Self::Offline {
            name: name.into(),
            load: 0,
            status: ProviderStatus::Offline,
        }
    }
}

/// One accelerator as advertised at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorSpec {
    /// Positional id, `gpu_<index>`.
    pub id: String,
    pub name: String,
    pub status: ProviderStatus,
}

impl AcceleratorSpec {
    /// Create an idle accelerator entry for the device at `index`.
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            id: format!("gpu_{}", index),
            name: name.into(),
            status: ProviderStatus::Idle,
        }
    }
}
