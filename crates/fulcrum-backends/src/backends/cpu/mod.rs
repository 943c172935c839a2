//! CPU backend
//!
//! Reference backend: host buffers, a synchronous execution context, and
//! the reference forwards in [`ops`], parallelised over rows with rayon.
//!
//! # Architecture
//!
//! ```text
//! CpuBackendReg "CPU"
//! └── CpuDevice "CPU"
//!     ├── CpuBufferType "CPU"  - host memory, 64-byte alignment
//!     └── CpuBackend           - runs each node inline, optional rayon pool
//! ```
//!
//! # Usage
//!
//! ```rust
//! use fulcrum_backends::backends::cpu::CpuBackendReg;
//! use fulcrum_backends::config::CpuConfig;
//! use fulcrum_backends::backend::BackendReg;
//!
//! let reg = CpuBackendReg::new(CpuConfig::default());
//! let device = reg.device(0);
//! let buffer = device.buffer_type().alloc_buffer(1024).unwrap();
//! assert_eq!(buffer.size(), 1024);
//! ```

pub mod memory;
pub mod ops;
pub mod vec;

use crate::backend::{
    AbortCallback, Backend, BackendFamily, BackendReg, Buffer, BufferRef, BufferType, BufferTypeRef, ComputeStatus,
    Device, DeviceCaps, DeviceRef, DeviceType, Feature, PendingRead,
};
use crate::backends::common::{HostAccess, HostMemory};
use crate::config::CpuConfig;
use crate::error::{BackendError, Result};
use crate::tensor::{ComputeGraph, Tensor};
use fulcrum_tracing::performance;
use memory::HostBuffer;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

pub const CPU_NAME: &str = "CPU";

/// Alignment of host allocations.
pub const CPU_ALIGNMENT: usize = 64;

// ============================================================================
// Registration
// ============================================================================

#[derive(Debug)]
pub struct CpuBackendReg {
    device: Arc<CpuDevice>,
}

impl CpuBackendReg {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            device: CpuDevice::new(config),
        }
    }
}

impl BackendReg for CpuBackendReg {
    fn name(&self) -> &str {
        CPU_NAME
    }

    fn device_count(&self) -> usize {
        1
    }

    fn device(&self, index: usize) -> DeviceRef {
        crate::ensure!(index == 0, "CPU device index {index} out of range (1 device)");
        Arc::clone(&self.device) as DeviceRef
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::new("threads", self.device.threads().to_string()),
            Feature::new("vec_dot", "f32"),
        ]
    }
}

// ============================================================================
// Device
// ============================================================================

pub struct CpuDevice {
    this: Weak<CpuDevice>,
    config: CpuConfig,
    description: String,
    buft: OnceLock<Arc<CpuBufferType>>,
}

impl CpuDevice {
    pub fn new(config: CpuConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            description: format!("host CPU, {} threads", resolve_threads(&config)),
            config,
            buft: OnceLock::new(),
        })
    }

    /// Worker threads used by row-parallel forwards.
    pub fn threads(&self) -> usize {
        resolve_threads(&self.config)
    }

    fn host_buft(&self) -> Arc<CpuBufferType> {
        let buft = self.buft.get_or_init(|| {
            tracing::debug!(device = CPU_NAME, "buffer type CPU created");
            Arc::new_cyclic(|this| CpuBufferType {
                this: this.clone(),
                device: self.this.clone(),
            })
        });
        Arc::clone(buft)
    }

    fn self_ref(&self) -> Result<Arc<CpuDevice>> {
        self.this
            .upgrade()
            .ok_or_else(|| BackendError::Other("CPU device dropped".into()))
    }
}

impl fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuDevice").field("config", &self.config).finish()
    }
}

fn resolve_threads(config: &CpuConfig) -> usize {
    match config.n_threads {
        0 => rayon::current_num_threads(),
        n => n,
    }
}

/// `(available, total)` host memory in bytes.
fn system_memory() -> (usize, usize) {
    let system = System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()));
    let bytes = |n: u64| usize::try_from(n).unwrap_or(usize::MAX);
    (bytes(system.available_memory()), bytes(system.total_memory()))
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        CPU_NAME
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn memory(&self) -> (usize, usize) {
        system_memory()
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            async_compute: false,
            host_buffer: false,
            buffer_from_host_ptr: true,
            events: false,
        }
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Cpu
    }

    fn init_backend(&self, _params: Option<&str>) -> Result<Box<dyn Backend>> {
        Ok(Box::new(CpuBackend::new(self.self_ref()?)?))
    }

    fn buffer_type(&self) -> BufferTypeRef {
        self.host_buft()
    }

    fn buffer_from_host(&self, memory: HostMemory, _max_tensor_size: usize) -> Result<BufferRef> {
        let size = memory.len();
        tracing::debug!(device = CPU_NAME, size, "wrapping host memory");
        Ok(Buffer::new(self.host_buft(), size, Box::new(HostBuffer::wrap(memory))).into_ref())
    }

    fn supports_op(&self, op: &Tensor) -> bool {
        ops::supports(op)
    }

    fn supports_buft(&self, buft: &dyn BufferType) -> bool {
        buft.is_host()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Buffer type
// ============================================================================

pub struct CpuBufferType {
    this: Weak<CpuBufferType>,
    device: Weak<CpuDevice>,
}

impl fmt::Debug for CpuBufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBufferType").field("name", &CPU_NAME).finish()
    }
}

impl BufferType for CpuBufferType {
    fn name(&self) -> &str {
        CPU_NAME
    }

    fn alloc_buffer(&self, size: usize) -> Result<BufferRef> {
        let buft = self
            .this
            .upgrade()
            .ok_or_else(|| BackendError::allocation(CPU_NAME, size, "buffer type dropped"))?;
        let start = Instant::now();
        // zero-byte requests still get a distinct allocation
        let iface = HostBuffer::new(size.max(1));
        performance::record_allocation(CPU_NAME, CPU_NAME, size, start.elapsed().as_micros() as u64);
        Ok(Buffer::new(buft, size, Box::new(iface)).into_ref())
    }

    fn alignment(&self) -> usize {
        CPU_ALIGNMENT
    }

    fn is_host(&self) -> bool {
        true
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Cpu
    }

    fn device(&self) -> Option<DeviceRef> {
        self.device.upgrade().map(|d| d as DeviceRef)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Execution context
// ============================================================================

/// Synchronous execution context: every call has completed when it returns.
pub struct CpuBackend {
    device: Arc<CpuDevice>,
    pool: Option<rayon::ThreadPool>,
    abort: Option<AbortCallback>,
}

impl CpuBackend {
    pub fn new(device: Arc<CpuDevice>) -> Result<Self> {
        let pool = match device.config.n_threads {
            0 => None,
            n => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("fulcrum-cpu-{i}"))
                    .build()
                    .map_err(|err| BackendError::Other(format!("failed to build CPU thread pool: {err}")))?,
            ),
        };
        tracing::debug!(device = CPU_NAME, threads = device.threads(), "CPU context created");
        Ok(Self {
            device,
            pool,
            abort: None,
        })
    }

    fn compute_nodes(&self, graph: &ComputeGraph) -> (ComputeStatus, usize) {
        let mut dispatched = 0;
        for node in graph.nodes() {
            if node.op().is_empty() {
                continue;
            }
            if self.abort.as_ref().is_some_and(|abort| abort()) {
                tracing::warn!(backend = CPU_NAME, node = node.name(), "graph aborted");
                return (ComputeStatus::Aborted, dispatched);
            }
            if !ops::supports(node) {
                crate::fatal!(
                    "{}: unsupported op {} ({}) on node {}",
                    CPU_NAME,
                    node.op(),
                    node.dtype(),
                    node.name()
                );
            }
            let reachable = std::iter::once(node.as_ref())
                .chain(node.srcs().map(|s| s.as_ref()))
                .all(|t| t.buffer().is_none_or(|b| b.base().is_some()));
            if !reachable {
                tracing::warn!(backend = CPU_NAME, node = node.name(), "node bound to device-only memory");
                return (ComputeStatus::Unsupported, dispatched);
            }
            if let Err(err) = ops::forward(node, &HostAccess) {
                tracing::error!(backend = CPU_NAME, node = node.name(), op = %node.op(), error = %err, "forward failed");
                return (ComputeStatus::ComputeError, dispatched);
            }
            dispatched += 1;
        }
        (ComputeStatus::Success, dispatched)
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        CPU_NAME
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Cpu
    }

    fn device(&self) -> DeviceRef {
        Arc::clone(&self.device) as DeviceRef
    }

    fn set_tensor_async(&self, tensor: &Tensor, data: Vec<u8>, offset: usize) -> Result<()> {
        tensor.set_bytes(&data, offset)
    }

    fn get_tensor_async(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<PendingRead> {
        Ok(PendingRead::ready(Ok(tensor.get_bytes(offset, size)?)))
    }

    fn synchronize(&self) {}

    #[tracing::instrument(skip_all, fields(backend = CPU_NAME, n_nodes = graph.len()))]
    fn graph_compute(&self, graph: &ComputeGraph) -> ComputeStatus {
        let run = || self.compute_nodes(graph);
        let ((status, dispatched), duration_us) = fulcrum_tracing::timed_block!("graph_compute", {
            match &self.pool {
                Some(pool) => pool.install(run),
                None => run(),
            }
        });
        performance::record_graph(CPU_NAME, graph.len(), dispatched, duration_us);
        status
    }

    fn set_abort_callback(&mut self, callback: Option<AbortCallback>) {
        self.abort = callback;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
