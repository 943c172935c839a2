//! GPU-class backend
//!
//! Models a discrete accelerator: a fixed memory budget split between
//! host-visible and device-private allocations, one asynchronous command
//! stream per execution context, counter-based events, and kernels that are
//! specialized and compiled on first use through a per-device
//! [`PipelineLibrary`].
//!
//! # Architecture
//!
//! ```text
//! GpuBackendReg "GPU"
//! └── GpuDevice "GPU{i}"
//!     ├── MemoryPool          - memory budget from GpuDeviceConfig
//!     ├── GpuBufferType x3    - GPU{i}, GPU{i}_Private, GPU{i}_Mapped (lazy)
//!     ├── PipelineLibrary     - specialization cache + compile oracle
//!     ├── transfer stream     - host access to private buffers
//!     └── GpuBackend          - execution context, one CommandStream each
//! ```
//!
//! # Usage
//!
//! ```rust
//! use fulcrum_backends::backends::gpu::GpuBackendReg;
//! use fulcrum_backends::config::RuntimeConfig;
//! use fulcrum_backends::backend::BackendReg;
//!
//! let reg = GpuBackendReg::new(&RuntimeConfig::default().with_gpu_devices(2));
//! assert_eq!(reg.device_count(), 2);
//! let device = reg.device(1);
//! assert_eq!(device.name(), "GPU1");
//! let buffer = device.buffer_type().alloc_buffer(1024).unwrap();
//! assert_eq!(buffer.size(), 1024);
//! ```

pub mod compiler;
pub mod context;
pub mod encoder;
pub mod event;
pub mod memory;
pub mod stream;

pub use compiler::ReferenceCompiler;
pub use context::GpuBackend;
pub use event::GpuEvent;
pub use memory::{BufferPolicy, GpuBufferType, MemoryPool};

use crate::backend::{
    Backend, BackendFamily, BackendReg, BufferRef, BufferType, BufferTypeRef, Device, DeviceCaps, DeviceRef,
    DeviceType, Event, Feature,
};
use crate::backends::common::HostMemory;
use crate::config::{GpuDeviceConfig, RuntimeConfig};
use crate::error::{BackendError, Result};
use crate::pipeline::{node_kernels, KernelCompiler, PipelineLibrary};
use crate::tensor::{Op, Tensor};
use std::any::Any;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock, Weak};
use stream::CommandStream;

pub const GPU_NAME: &str = "GPU";

// ============================================================================
// Registration
// ============================================================================

pub struct GpuBackendReg {
    devices: Vec<Arc<GpuDevice>>,
    compiler: Arc<dyn KernelCompiler>,
    use_fusion: bool,
}

impl GpuBackendReg {
    /// `config.gpu_devices` devices sharing `config.gpu`, compiling with the
    /// [`ReferenceCompiler`].
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_compiler(config, Arc::new(ReferenceCompiler::new()))
    }

    pub fn with_compiler(config: &RuntimeConfig, compiler: Arc<dyn KernelCompiler>) -> Self {
        let devices: Vec<_> = (0..config.gpu_devices)
            .map(|index| GpuDevice::new(index, config.gpu.clone(), Arc::clone(&compiler)))
            .collect();
        tracing::debug!(
            backend = GPU_NAME,
            devices = devices.len(),
            compiler = compiler.name(),
            "GPU backend registered"
        );
        Self {
            devices,
            compiler,
            use_fusion: config.gpu.use_fusion,
        }
    }
}

impl fmt::Debug for GpuBackendReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBackendReg")
            .field("devices", &self.devices.len())
            .field("compiler", &self.compiler.name())
            .finish()
    }
}

impl BackendReg for GpuBackendReg {
    fn name(&self) -> &str {
        GPU_NAME
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, index: usize) -> DeviceRef {
        match self.devices.get(index) {
            Some(device) => Arc::clone(device) as DeviceRef,
            None => crate::fatal!(
                "GPU device index {index} out of range ({} devices)",
                self.devices.len()
            ),
        }
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::new("compiler", self.compiler.name()),
            Feature::new("devices", self.devices.len().to_string()),
            Feature::new("fusion", self.use_fusion.to_string()),
        ]
    }
}

// ============================================================================
// Device
// ============================================================================

pub struct GpuDevice {
    this: Weak<GpuDevice>,
    name: String,
    description: String,
    config: GpuDeviceConfig,
    pool: Arc<MemoryPool>,
    library: PipelineLibrary,
    shared: OnceLock<Arc<GpuBufferType>>,
    private: OnceLock<Arc<GpuBufferType>>,
    mapped: OnceLock<Arc<GpuBufferType>>,
    transfer: OnceLock<Arc<CommandStream>>,
    contexts: AtomicUsize,
}

impl GpuDevice {
    pub fn new(index: usize, config: GpuDeviceConfig, compiler: Arc<dyn KernelCompiler>) -> Arc<Self> {
        let name = format!("{GPU_NAME}{index}");
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            description: format!(
                "modelled GPU {index}, {} MiB, {} compiler",
                config.memory_size / (1024 * 1024),
                compiler.name()
            ),
            pool: MemoryPool::new(name.clone(), config.memory_size),
            library: PipelineLibrary::new(name.clone(), compiler),
            name,
            config,
            shared: OnceLock::new(),
            private: OnceLock::new(),
            mapped: OnceLock::new(),
            transfer: OnceLock::new(),
            contexts: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &GpuDeviceConfig {
        &self.config
    }

    pub fn library(&self) -> &PipelineLibrary {
        &self.library
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// The buffer type for `policy`, built on first use.
    pub fn buffer_type_for(&self, policy: BufferPolicy) -> Arc<GpuBufferType> {
        let slot = match policy {
            BufferPolicy::Shared => &self.shared,
            BufferPolicy::Private => &self.private,
            BufferPolicy::Mapped => &self.mapped,
        };
        Arc::clone(slot.get_or_init(|| GpuBufferType::new(self, policy)))
    }

    /// Stream serving host access to private buffers.
    fn transfer_stream(&self) -> Result<Arc<CommandStream>> {
        if let Some(stream) = self.transfer.get() {
            return Ok(Arc::clone(stream));
        }
        let stream = CommandStream::spawn(format!("{}-transfer", self.name))?;
        Ok(Arc::clone(self.transfer.get_or_init(|| stream)))
    }

    fn self_ref(&self) -> Result<Arc<GpuDevice>> {
        self.this
            .upgrade()
            .ok_or_else(|| BackendError::Other(format!("{} dropped", self.name)))
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("memory_used", &self.pool.used())
            .finish()
    }
}

impl Device for GpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn memory(&self) -> (usize, usize) {
        (self.pool.free(), self.pool.total())
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Gpu
    }

    fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            async_compute: true,
            host_buffer: false,
            buffer_from_host_ptr: true,
            events: true,
        }
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Gpu
    }

    fn init_backend(&self, _params: Option<&str>) -> Result<Box<dyn Backend>> {
        Ok(Box::new(GpuBackend::new(self.self_ref()?)?))
    }

    fn buffer_type(&self) -> BufferTypeRef {
        let policy = if self.config.use_shared_buffers {
            BufferPolicy::Shared
        } else {
            BufferPolicy::Private
        };
        self.buffer_type_for(policy)
    }

    fn buffer_from_host(&self, memory: HostMemory, max_tensor_size: usize) -> Result<BufferRef> {
        self.buffer_type_for(BufferPolicy::Mapped).wrap(memory, max_tensor_size)
    }

    fn supports_op(&self, op: &Tensor) -> bool {
        op.op().is_empty() || node_kernels(op).is_ok()
    }

    fn supports_buft(&self, buft: &dyn BufferType) -> bool {
        buft.as_any()
            .downcast_ref::<GpuBufferType>()
            .is_some_and(|gpu| gpu.belongs_to(self))
    }

    fn offload_op(&self, op: &Tensor) -> bool {
        let min_batch = self.config.op_offload_min_batch_size;
        match op.op() {
            Op::MulMat => op.ne()[1] >= min_batch,
            Op::MulMatId => op.ne()[2] >= min_batch,
            _ => false,
        }
    }

    fn event_new(&self) -> Option<Event> {
        Some(Event::new(&self.name, BackendFamily::Gpu, Box::new(GpuEvent::new())))
    }

    fn event_synchronize(&self, event: &Event) {
        event::gpu_event(&self.name, event).synchronize();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKind;
    use crate::tensor::{DataType, UnaryOp};

    fn reg(config: RuntimeConfig) -> GpuBackendReg {
        GpuBackendReg::new(&config)
    }

    fn gpu(config: GpuDeviceConfig) -> Arc<GpuDevice> {
        GpuDevice::new(0, config, Arc::new(ReferenceCompiler::new()))
    }

    #[test]
    fn test_device_enumeration() {
        let reg = reg(RuntimeConfig::default().with_gpu_devices(3));
        assert_eq!(reg.device_count(), 3);
        let names: Vec<_> = (0..3).map(|i| reg.device(i).name().to_string()).collect();
        assert_eq!(names, ["GPU0", "GPU1", "GPU2"]);
        assert!(reg.features().iter().any(|f| f.name == "compiler" && f.value == "reference"));
    }

    #[test]
    #[should_panic(expected = "GPU device index 1 out of range")]
    fn test_device_index_out_of_range() {
        reg(RuntimeConfig::default()).device(1);
    }

    #[test]
    fn test_props_and_caps() {
        let dev = gpu(GpuDeviceConfig::default().with_memory_size(1 << 20).with_max_buffer_size(1 << 18));
        let props = dev.props();
        assert_eq!(props.device_type, DeviceType::Gpu);
        assert!(props.caps.async_compute && props.caps.events && props.caps.buffer_from_host_ptr);
        assert!(!props.caps.host_buffer);
        assert_eq!((props.memory_free, props.memory_total), (1 << 20, 1 << 20));
        assert!(dev.host_buffer_type().is_none());
    }

    #[test]
    fn test_buffer_types_memoized_per_policy() {
        let dev = gpu(GpuDeviceConfig::default());
        let a = dev.buffer_type_for(BufferPolicy::Private);
        let b = dev.buffer_type_for(BufferPolicy::Private);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "GPU0_Private");
        assert_eq!(dev.buffer_type_for(BufferPolicy::Mapped).name(), "GPU0_Mapped");
        assert_eq!(dev.buffer_type().name(), "GPU0");
        assert_eq!(a.alignment(), 32);
        assert!(!a.is_host());
    }

    #[test]
    fn test_preferred_policy_follows_config() {
        let dev = gpu(GpuDeviceConfig::default().with_shared_buffers(false));
        let buft = dev.buffer_type();
        assert_eq!(buft.name(), "GPU0_Private");
        let buf = buft.alloc_buffer(64).unwrap();
        assert_eq!(buf.memory_kind(), MemoryKind::Private);
        assert!(buf.base().is_none());
        buf.memset(0, 0x5A, 64).unwrap();
        assert!(buf.read(0, 64).unwrap().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_allocation_limits() {
        let dev = gpu(GpuDeviceConfig::default().with_memory_size(1000).with_max_buffer_size(600));
        let buft = dev.buffer_type();
        assert!(matches!(buft.alloc_buffer(601), Err(BackendError::AllocationFailed { .. })));
        let first = buft.alloc_buffer(600).unwrap();
        assert_eq!(dev.memory().0, 400);
        assert!(buft.alloc_buffer(500).is_err());
        drop(first);
        assert_eq!(dev.memory().0, 1000);

        let empty = buft.alloc_buffer(0).unwrap();
        assert_eq!(empty.size(), 0);
        assert!(empty.base().is_some());
    }

    #[test]
    fn test_supports_only_own_buffer_types() {
        let a = gpu(GpuDeviceConfig::default());
        let b = gpu(GpuDeviceConfig::default());
        for policy in [BufferPolicy::Shared, BufferPolicy::Private, BufferPolicy::Mapped] {
            assert!(a.supports_buft(a.buffer_type_for(policy).as_ref()));
        }
        assert!(!a.supports_buft(b.buffer_type().as_ref()));
        let cpu = crate::backends::cpu::CpuDevice::new(Default::default());
        assert!(!a.supports_buft(cpu.buffer_type().as_ref()));
    }

    #[test]
    fn test_mapped_host_memory_is_shared() {
        let dev = gpu(GpuDeviceConfig::default().with_memory_size(1 << 16).with_max_buffer_size(1024));
        let host = crate::backends::common::MemoryRegion::shared(4096);
        let buf = dev.buffer_from_host(Arc::clone(&host), 256).unwrap();
        assert_eq!(buf.buffer_type().name(), "GPU0_Mapped");
        assert_eq!(buf.size(), 4096);
        // wrapped memory is not charged against the device
        assert_eq!(dev.memory().0, 1 << 16);

        let views = buf
            .interface()
            .as_any()
            .downcast_ref::<memory::SharedBuffer>()
            .unwrap()
            .views()
            .to_vec();
        assert_eq!(views.first().map(|v| v.start), Some(0));
        assert_eq!(views.last().map(|v| v.end), Some(4096));
        assert!(views.iter().all(|v| v.len() <= 1024));

        buf.set(100, &[7]).unwrap();
        assert_eq!(host.read_vec(100, 1).unwrap(), [7]);
        assert!(dev.buffer_from_host(host, 1024).is_err());
    }

    #[test]
    fn test_offload_threshold() {
        let dev = gpu(GpuDeviceConfig::default().with_offload_min_batch(32));
        let w = Tensor::new_2d("w", DataType::F32, 64, 64).into_ref();
        let x = Tensor::new_2d("x", DataType::F32, 64, 32).into_ref();
        let big = Tensor::with_op("mm", Op::MulMat, DataType::F32, [64, 32, 1, 1], vec![Some(w.clone()), Some(x)]);
        assert!(dev.offload_op(&big));
        let x = Tensor::new_2d("x", DataType::F32, 64, 31).into_ref();
        let small = Tensor::with_op("mm", Op::MulMat, DataType::F32, [64, 31, 1, 1], vec![Some(w), Some(x)]);
        assert!(!dev.offload_op(&small));
    }

    #[test]
    fn test_supports_op() {
        let dev = gpu(GpuDeviceConfig::default());
        let a = Tensor::new_1d("a", DataType::F32, 8).into_ref();
        let relu = Tensor::with_op("r", Op::Unary(UnaryOp::Relu), DataType::F32, [8, 1, 1, 1], vec![Some(a.clone())]);
        assert!(dev.supports_op(&relu));
        let view = Tensor::with_op("v", Op::View, DataType::F32, [8, 1, 1, 1], vec![Some(a)]);
        assert!(dev.supports_op(&view));
        let ids = Tensor::new_1d("ids", DataType::F32, 2).into_ref();
        let rows = Tensor::new_2d("rows", DataType::F32, 8, 4).into_ref();
        let bad = Tensor::with_op("g", Op::GetRows, DataType::F32, [8, 2, 1, 1], vec![Some(rows), Some(ids)]);
        assert!(!dev.supports_op(&bad));
    }

    #[test]
    fn test_events() {
        let dev = gpu(GpuDeviceConfig::default());
        let event = dev.event_new().unwrap();
        assert_eq!(event.device(), "GPU0");
        // never recorded: already signalled
        dev.event_synchronize(&event);
        dev.event_free(event);
    }
}
