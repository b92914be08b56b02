//! Hardware capability probe.
//!
//! Detects whether an accelerator is present and selects the execution
//! profile for the whole run: device, compute dtype, and whether base
//! weights go through the 4-bit load path. This is a pure capability query
//! with two possible outcomes; it has no error states.

use candle_core::{DType, Device};
use std::process::Command;
use tracing::{info, warn};

/// Execution profile selected once at startup.
#[derive(Debug, Clone)]
pub struct ComputeProfile {
    pub device: Device,
    pub dtype: DType,
    /// Base weights are stored 4-bit at load time and dequantized per layer
    /// when the model graph is built.
    pub quantized_load: bool,
}

/// Accelerator name and capacity as reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorInfo {
    pub name: String,
    pub total_memory_gb: f64,
}

impl ComputeProfile {
    pub fn detect() -> Self {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(device) => {
                    match query_accelerator() {
                        Some(gpu) => {
                            info!("GPU detected: {} ({:.1} GB)", gpu.name, gpu.total_memory_gb)
                        }
                        None => info!("GPU detected"),
                    }
                    return Self {
                        device,
                        dtype: DType::F16,
                        quantized_load: true,
                    };
                }
                Err(err) => warn!("CUDA reported available but device init failed: {err}"),
            }
        }
        warn!("No GPU detected, using CPU (training will be slow)");
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            quantized_load: false,
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !matches!(self.device, Device::Cpu)
    }
}

/// Query accelerator name and total memory via nvidia-smi.
/// Absence of the tool is not an error, just missing detail.
fn query_accelerator() -> Option<AcceleratorInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_accelerator_line(stdout.lines().next()?)
}

fn parse_accelerator_line(line: &str) -> Option<AcceleratorInfo> {
    let (name, memory) = line.rsplit_once(',')?;
    let memory_mib: f64 = memory.trim().parse().ok()?;
    Some(AcceleratorInfo {
        name: name.trim().to_string(),
        total_memory_gb: memory_mib / 1024.0,
    })
}
