//! Runtime configuration
//!
//! Defaults suit tests and small models. Every field can be overridden from
//! the process environment; the global registry reads the environment once,
//! when it is first built.
//!
//! | variable | field |
//! |----------|-------|
//! | `FULCRUM_GPU_DEVICES` | [`RuntimeConfig::gpu_devices`] (clamped to 1..=16) |
//! | `FULCRUM_GPU_MEMORY_MB` | [`GpuDeviceConfig::memory_size`] |
//! | `FULCRUM_GPU_MAX_BUFFER_MB` | [`GpuDeviceConfig::max_buffer_size`] |
//! | `FULCRUM_GPU_SHARED_BUFFERS` | [`GpuDeviceConfig::use_shared_buffers`] |
//! | `FULCRUM_GPU_OFFLOAD_MIN_BATCH` | [`GpuDeviceConfig::op_offload_min_batch_size`] |
//! | `FULCRUM_GPU_FUSION` | [`GpuDeviceConfig::use_fusion`] |
//! | `FULCRUM_CPU_THREADS` | [`CpuConfig::n_threads`] |

use crate::error::{BackendError, Result};
use serde::Serialize;
use std::str::FromStr;

pub const ENV_GPU_DEVICES: &str = "FULCRUM_GPU_DEVICES";
pub const ENV_GPU_MEMORY_MB: &str = "FULCRUM_GPU_MEMORY_MB";
pub const ENV_GPU_MAX_BUFFER_MB: &str = "FULCRUM_GPU_MAX_BUFFER_MB";
pub const ENV_GPU_SHARED_BUFFERS: &str = "FULCRUM_GPU_SHARED_BUFFERS";
pub const ENV_GPU_OFFLOAD_MIN_BATCH: &str = "FULCRUM_GPU_OFFLOAD_MIN_BATCH";
pub const ENV_GPU_FUSION: &str = "FULCRUM_GPU_FUSION";
pub const ENV_CPU_THREADS: &str = "FULCRUM_CPU_THREADS";

/// Upper bound on modelled GPU devices.
pub const MAX_GPU_DEVICES: usize = 16;

const MIB: usize = 1024 * 1024;

/// Per-device settings of the GPU-class backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDeviceConfig {
    /// Total device memory in bytes
    pub memory_size: usize,
    /// Largest single allocation in bytes
    pub max_buffer_size: usize,
    /// Threadgroup memory available to one dispatch
    pub max_threadgroup_memory: usize,
    /// Prefer host-visible buffers over device-private ones
    pub use_shared_buffers: bool,
    /// Minimum batch before a matrix product is worth offloading
    pub op_offload_min_batch_size: i64,
    /// Fuse norm chains and runs of binary ops into single dispatches
    pub use_fusion: bool,
}

impl Default for GpuDeviceConfig {
    fn default() -> Self {
        Self {
            memory_size: 1024 * MIB,
            max_buffer_size: 256 * MIB,
            max_threadgroup_memory: 32 * 1024,
            use_shared_buffers: true,
            op_offload_min_batch_size: 32,
            use_fusion: true,
        }
    }
}

impl GpuDeviceConfig {
    pub fn with_memory_size(mut self, bytes: usize) -> Self {
        self.memory_size = bytes;
        self
    }

    pub fn with_max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    pub fn with_max_threadgroup_memory(mut self, bytes: usize) -> Self {
        self.max_threadgroup_memory = bytes;
        self
    }

    pub fn with_shared_buffers(mut self, enabled: bool) -> Self {
        self.use_shared_buffers = enabled;
        self
    }

    pub fn with_offload_min_batch(mut self, batch: i64) -> Self {
        self.op_offload_min_batch_size = batch;
        self
    }

    pub fn with_fusion(mut self, enabled: bool) -> Self {
        self.use_fusion = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuConfig {
    /// Worker threads for row-parallel forwards; 0 uses the rayon default
    pub n_threads: usize,
}

impl CpuConfig {
    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }
}

/// Configuration of every compiled-in backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// Number of GPU-class devices to expose
    pub gpu_devices: usize,
    pub gpu: GpuDeviceConfig,
    pub cpu: CpuConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gpu_devices: 1,
            gpu: GpuDeviceConfig::default(),
            cpu: CpuConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_gpu_devices(mut self, n: usize) -> Self {
        self.gpu_devices = n.clamp(1, MAX_GPU_DEVICES);
        self
    }

    pub fn with_gpu(mut self, gpu: GpuDeviceConfig) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }

    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    ///
    /// [`BackendError::InvalidConfig`] when a variable is set but unparsable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(n) = parse::<usize>(&lookup, ENV_GPU_DEVICES)? {
            config = config.with_gpu_devices(n);
        }
        if let Some(mb) = parse::<usize>(&lookup, ENV_GPU_MEMORY_MB)? {
            config.gpu.memory_size = mb.saturating_mul(MIB);
        }
        if let Some(mb) = parse::<usize>(&lookup, ENV_GPU_MAX_BUFFER_MB)? {
            config.gpu.max_buffer_size = mb.saturating_mul(MIB);
        }
        if let Some(flag) = parse_flag(&lookup, ENV_GPU_SHARED_BUFFERS)? {
            config.gpu.use_shared_buffers = flag;
        }
        if let Some(batch) = parse::<i64>(&lookup, ENV_GPU_OFFLOAD_MIN_BATCH)? {
            config.gpu.op_offload_min_batch_size = batch;
        }
        if let Some(flag) = parse_flag(&lookup, ENV_GPU_FUSION)? {
            config.gpu.use_fusion = flag;
        }
        if let Some(n) = parse::<usize>(&lookup, ENV_CPU_THREADS)? {
            config.cpu.n_threads = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations no device could honour.
    pub fn validate(&self) -> Result<()> {
        if self.gpu.max_buffer_size > self.gpu.memory_size {
            return Err(BackendError::InvalidConfig {
                key: ENV_GPU_MAX_BUFFER_MB.into(),
                value: (self.gpu.max_buffer_size / MIB).to_string(),
                reason: format!("exceeds device memory of {} MiB", self.gpu.memory_size / MIB),
            });
        }
        Ok(())
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| BackendError::InvalidConfig {
            key: key.into(),
            value: raw.clone(),
            reason: err.to_string(),
        })
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(BackendError::InvalidConfig {
            key: key.into(),
            value: raw,
            reason: "expected a boolean".into(),
        }),
    }
}
