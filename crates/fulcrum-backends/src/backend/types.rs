//! Plain data shared by every backend: device descriptions, status codes,
//! memory tags and launch geometry

use serde::Serialize;
use std::fmt;

/// Broad class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Gpu,
    /// Accelerator used alongside the CPU (BLAS-style offload engines)
    Accel,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Accel => "ACCEL",
        })
    }
}

/// Closed set of backend implementations.
///
/// Used wherever one backend must recognise its own objects (buffers,
/// events, sibling contexts) before touching their internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    Cpu,
    Gpu,
}

/// What a device can do beyond the mandatory interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCaps {
    /// Transfers and dispatches return before the work completes
    pub async_compute: bool,
    /// Offers a pinned host buffer type
    pub host_buffer: bool,
    /// Can wrap caller-owned host memory without copying
    pub buffer_from_host_ptr: bool,
    pub events: bool,
}

/// Snapshot of a device's identity and memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProps {
    pub name: String,
    pub description: String,
    pub memory_free: usize,
    pub memory_total: usize,
    pub device_type: DeviceType,
    pub caps: DeviceCaps,
}

/// Name/value pair advertised by a backend registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feature {
    pub name: &'static str,
    pub value: String,
}

impl Feature {
    pub fn new(name: &'static str, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// Outcome of `graph_compute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    Success,
    /// A kernel failed to compile or run; the graph output is undefined
    ComputeError,
    /// The graph references storage this backend cannot reach
    Unsupported,
    /// The abort callback asked to stop before every node was issued
    Aborted,
}

impl ComputeStatus {
    pub fn is_success(self) -> bool {
        self == ComputeStatus::Success
    }
}

/// Host visibility of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Visible to both host and device
    Shared,
    /// Device-only; the host reaches it through the command stream
    Private,
}

/// Grid dimensions for kernel launch
///
/// Number of threadgroups in each dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_groups(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GridDim {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Threads within one threadgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_threads(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Geometry and threadgroup memory of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: GridDim,
    pub block: BlockDim,
    /// Threadgroup memory in bytes
    pub shared_memory: usize,
}

impl LaunchConfig {
    pub const fn new(grid: GridDim, block: BlockDim, shared_memory: usize) -> Self {
        Self {
            grid,
            block,
            shared_memory,
        }
    }

    /// One thread per element, `block_size` threads per group.
    pub const fn linear(total_elements: u32, block_size: u32) -> Self {
        Self {
            grid: GridDim::linear(total_elements.div_ceil(block_size)),
            block: BlockDim::linear(block_size),
            shared_memory: 0,
        }
    }

    pub const fn total_threads(&self) -> u64 {
        self.grid.total_groups() * self.block.total_threads() as u64
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid={}, block={}, smem={}B",
            self.grid, self.block, self.shared_memory
        )
    }
}
