//! Host telemetry reader.
//!
//! CPU and memory come from `sysinfo`; accelerators are read through
//! `nvidia-smi`. Reading never fails the caller: an accelerator that stops
//! answering is reported with the offline marker instead.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use sysinfo::System;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use matcha_core::telemetry::gib;
use matcha_core::{AcceleratorSpec, GpuTelemetry, ProviderStatus, Telemetry};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// A query slower than this is killed and treated as failed.
const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of hardware snapshots.
pub trait TelemetrySource: Send + Sync {
    /// Take a snapshot. May block briefly to average CPU load.
    fn sample(&self) -> Telemetry;

    /// Accelerators to advertise at registration.
    fn accelerators(&self) -> Vec<AcceleratorSpec>;

    /// Whether tasks should request accelerator devices.
    fn has_accelerator(&self) -> bool;
}

/// Reads the local host.
pub struct SystemTelemetry {
    system: Mutex<System>,
    cpu_window: Duration,
    nvidia_smi: String,
    /// Name of device 0, if one answered at startup.
    primary_gpu: Option<String>,
}

impl SystemTelemetry {
    /// Inspect the host once and build a reader.
    pub fn detect() -> Self {
        Self::with_nvidia_smi("nvidia-smi")
    }

    /// Inspect using a specific `nvidia-smi` binary.
    pub fn with_nvidia_smi(nvidia_smi: impl Into<String>) -> Self {
        let nvidia_smi = nvidia_smi.into();
        let primary_gpu = query_gpu_names(&nvidia_smi)
            .ok()
            .and_then(|names| names.into_iter().next());

        match &primary_gpu {
            Some(name) => info!(gpu = %name, "Accelerator detected"),
            None => info!("No accelerator detected"),
        }

        Self {
            system: Mutex::new(System::new()),
            cpu_window: Duration::from_secs(1),
            nvidia_smi,
            primary_gpu,
        }
    }

    /// Override how long CPU load is averaged over.
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self
    }

    fn sample_gpu(&self) -> Option<GpuTelemetry> {
        let name = self.primary_gpu.as_ref()?;
        match query_gpu_reading(&self.nvidia_smi) {
            Ok(reading) => Some(GpuTelemetry::Online {
                name: name.clone(),
                load: reading.load,
                vram_used: gib(reading.vram_used_mib * BYTES_PER_MIB),
                vram_total: gib(reading.vram_total_mib * BYTES_PER_MIB),
            }),
            Err(e) => {
                warn!(error = %e, gpu = %name, "Accelerator query failed");
                Some(GpuTelemetry::offline(name.clone()))
            }
        }
    }
}

impl TelemetrySource for SystemTelemetry {
    fn sample(&self) -> Telemetry {
        let (cpu_load, ram_used, ram_total) = {
            let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_cpu_usage();
            std::thread::sleep(self.cpu_window);
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            (sys.global_cpu_usage(), sys.used_memory(), sys.total_memory())
        };

        let telemetry = Telemetry {
            cpu_load,
            ram_used_gb: gib(ram_used),
            ram_total_gb: gib(ram_total),
            status: ProviderStatus::Idle,
            gpu: self.sample_gpu(),
        };
        debug!(cpu = telemetry.cpu_load, ram_used_gb = telemetry.ram_used_gb, "Telemetry sampled");
        telemetry
    }

    fn accelerators(&self) -> Vec<AcceleratorSpec> {
        if self.primary_gpu.is_none() {
            return Vec::new();
        }
        match query_gpu_names(&self.nvidia_smi) {
            Ok(names) => names
                .into_iter()
                .enumerate()
                .map(|(i, name)| AcceleratorSpec::new(i, name))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Accelerator inventory failed");
                Vec::new()
            }
        }
    }

    fn has_accelerator(&self) -> bool {
        self.primary_gpu.is_some()
    }
}

/// One live reading of device 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GpuReading {
    load: u32,
    vram_used_mib: u64,
    vram_total_mib: u64,
}

fn run_nvidia_smi(binary: &str, args: &[&str], timeout: Duration) -> Result<String, String> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| e.to_string())?;

    let Some(status) = child.wait_timeout(timeout).map_err(|e| e.to_string())? else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(format!("{} timed out after {:?}", binary, timeout));
    };

    let stdout = read_pipe(child.stdout.take());
    if !status.success() {
        return Err(format!(
            "{} exited with {}: {}",
            binary,
            status,
            read_pipe(child.stderr.take()).trim()
        ));
    }
    Ok(stdout)
}

fn read_pipe(pipe: Option<impl Read>) -> String {
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn query_gpu_names(binary: &str) -> Result<Vec<String>, String> {
    let stdout = run_nvidia_smi(
        binary,
        &["--query-gpu=name", "--format=csv,noheader"],
        NVIDIA_SMI_TIMEOUT,
    )?;
    let names = parse_gpu_names(&stdout);
    if names.is_empty() {
        return Err("no devices reported".to_string());
    }
    Ok(names)
}

fn query_gpu_reading(binary: &str) -> Result<GpuReading, String> {
    let stdout = run_nvidia_smi(
        binary,
        &[
            "--id=0",
            "--query-gpu=utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ],
        NVIDIA_SMI_TIMEOUT,
    )?;
    parse_gpu_reading(&stdout).ok_or_else(|| format!("unparseable reading: {}", stdout.trim()))
}

fn parse_gpu_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_gpu_reading(stdout: &str) -> Option<GpuReading> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split(',').map(str::trim);
    let load = fields.next()?.parse().ok()?;
    let vram_used_mib = fields.next()?.parse().ok()?;
    let vram_total_mib = fields.next()?.parse().ok()?;
    Some(GpuReading {
        load,
        vram_used_mib,
        vram_total_mib,
    })
}
