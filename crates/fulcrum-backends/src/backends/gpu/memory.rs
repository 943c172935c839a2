//! GPU device memory
//!
//! Three buffer policies per device:
//! - `GPU{i}` / `GPU{i}_Private` - the device's preferred policy, chosen by
//!   `use_shared_buffers`; shared allocations are host visible, private ones
//!   are reached only through a command stream
//! - `GPU{i}_Mapped` - caller host memory wrapped without copying, split into
//!   overlapping views when larger than one device allocation
//!
//! Every allocation is charged against the device's [`MemoryPool`] and
//! returned when the buffer drops.

use super::stream::CommandStream;
use super::GpuDevice;
use crate::backend::{
    BackendFamily, Buffer, BufferInterface, BufferRef, BufferType, DeviceRef, MemoryKind,
};
use crate::backends::common::{HostMemory, MemoryRegion, TensorAccess};
use crate::error::{BackendError, Result};
use crate::pipeline::tuning;
use crate::tensor::Tensor;
use fulcrum_tracing::performance;
use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Alignment of device allocations.
pub const GPU_ALIGNMENT: usize = 32;

// ================================================================================================
// Memory accounting
// ================================================================================================

/// Fixed device memory budget.
#[derive(Debug)]
pub struct MemoryPool {
    device: String,
    total: usize,
    used: AtomicUsize,
}

impl MemoryPool {
    pub fn new(device: impl Into<String>, total: usize) -> Arc<Self> {
        Arc::new(Self {
            device: device.into(),
            total,
            used: AtomicUsize::new(0),
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn free(&self) -> usize {
        self.total.saturating_sub(self.used())
    }

    /// Charge `size` bytes; released when the returned guard drops.
    pub fn reserve(self: &Arc<Self>, size: usize) -> Result<Reservation> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&next| next <= self.total)
            })
            .map_err(|used| {
                BackendError::allocation(
                    &self.device,
                    size,
                    format!("out of device memory ({} of {} bytes free)", self.total.saturating_sub(used), self.total),
                )
            })?;
        Ok(Reservation {
            pool: Arc::clone(self),
            size,
        })
    }
}

#[derive(Debug)]
pub struct Reservation {
    pool: Arc<MemoryPool>,
    size: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Bytes backing one GPU buffer, tagged with the policy they were made for.
#[derive(Debug)]
pub struct DeviceMemory {
    region: HostMemory,
    kind: MemoryKind,
    _reservation: Option<Reservation>,
}

impl DeviceMemory {
    /// Fresh allocation charged to `pool`. Zero-byte requests get one byte.
    pub fn allocate(pool: &Arc<MemoryPool>, size: usize, kind: MemoryKind) -> Result<Self> {
        let reservation = pool.reserve(size)?;
        Ok(Self {
            region: Arc::new(MemoryRegion::new(size.max(1))),
            kind,
            _reservation: Some(reservation),
        })
    }

    /// Caller-owned memory; not charged to the device.
    pub fn wrap(region: HostMemory) -> Self {
        Self {
            region,
            kind: MemoryKind::Shared,
            _reservation: None,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

// ================================================================================================
// Buffer interfaces
// ================================================================================================

/// Host-visible memory: every access is a direct copy.
#[derive(Debug)]
pub struct SharedBuffer {
    memory: DeviceMemory,
    views: Vec<Range<usize>>,
}

impl SharedBuffer {
    pub(crate) fn new(memory: DeviceMemory) -> Self {
        let len = memory.region.len();
        Self::mapped(memory, vec![0..len])
    }

    pub(crate) fn mapped(memory: DeviceMemory, views: Vec<Range<usize>>) -> Self {
        Self { memory, views }
    }

    /// Device mappings covering the allocation, in address order.
    pub fn views(&self) -> &[Range<usize>] {
        &self.views
    }

    fn region(&self) -> &MemoryRegion {
        crate::ensure!(
            self.memory.kind == MemoryKind::Shared,
            "shared buffer interface used on {:?} memory",
            self.memory.kind
        );
        &self.memory.region
    }
}

impl BufferInterface for SharedBuffer {
    fn memory_kind(&self) -> MemoryKind {
        MemoryKind::Shared
    }

    fn base(&self) -> Option<usize> {
        Some(self.region().base_addr())
    }

    fn memset(&self, offset: usize, value: u8, size: usize) -> Result<()> {
        self.region().fill(offset, value, size)
    }

    fn set(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.region().write(offset, data)
    }

    fn get(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.region().read(offset, out)
    }

    fn clear(&self, value: u8) -> Result<()> {
        let region = self.region();
        region.fill(0, value, region.len())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Device-only memory: the host reaches it through the device's transfer
/// stream and waits for each access to complete.
#[derive(Debug)]
pub struct PrivateBuffer {
    memory: DeviceMemory,
    stream: Arc<CommandStream>,
}

impl PrivateBuffer {
    pub(crate) fn new(memory: DeviceMemory, stream: Arc<CommandStream>) -> Self {
        Self { memory, stream }
    }

    fn region(&self) -> HostMemory {
        crate::ensure!(
            self.memory.kind == MemoryKind::Private,
            "private buffer interface used on {:?} memory",
            self.memory.kind
        );
        Arc::clone(&self.memory.region)
    }
}

impl BufferInterface for PrivateBuffer {
    fn memory_kind(&self) -> MemoryKind {
        MemoryKind::Private
    }

    fn base(&self) -> Option<usize> {
        None
    }

    fn memset(&self, offset: usize, value: u8, size: usize) -> Result<()> {
        let region = self.region();
        self.stream
            .run_blocking("memset", move || region.fill(offset, value, size))
    }

    fn set(&self, offset: usize, data: &[u8]) -> Result<()> {
        let region = self.region();
        let data = data.to_vec();
        self.stream.run_blocking("upload", move || region.write(offset, &data))
    }

    fn get(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let region = self.region();
        let size = out.len();
        let bytes = self
            .stream
            .run_blocking("download", move || region.read_vec(offset, size))?;
        out.copy_from_slice(&bytes);
        Ok(())
    }

    fn clear(&self, value: u8) -> Result<()> {
        let region = self.region();
        self.stream.run_blocking("clear", move || {
            let len = region.len();
            region.fill(0, value, len)
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Device-side view of a GPU buffer's bytes, bypassing the host interface.
pub(crate) fn device_region(buffer: &Buffer) -> Option<&HostMemory> {
    let iface = buffer.interface().as_any();
    if let Some(shared) = iface.downcast_ref::<SharedBuffer>() {
        return Some(&shared.memory.region);
    }
    iface.downcast_ref::<PrivateBuffer>().map(|private| &private.memory.region)
}

/// Tensor access from inside a command stream.
///
/// Goes straight to device memory; going through [`PrivateBuffer`] here would
/// wait on a stream from within a stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceAccess;

impl DeviceAccess {
    fn locate(tensor: &Tensor) -> Result<(&HostMemory, usize)> {
        let storage = tensor.storage_or_err()?;
        let region = device_region(&storage.buffer)
            .ok_or_else(|| BackendError::invalid_tensor(tensor.name(), "not in GPU memory"))?;
        Ok((region, storage.offset))
    }
}

impl TensorAccess for DeviceAccess {
    fn read(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<Vec<u8>> {
        let (region, base) = Self::locate(tensor)?;
        region.read_vec(base + offset, size)
    }

    fn write(&self, tensor: &Tensor, offset: usize, data: &[u8]) -> Result<()> {
        let (region, base) = Self::locate(tensor)?;
        region.write(base + offset, data)
    }
}

// ================================================================================================
// Buffer types
// ================================================================================================

/// Allocation policy of a [`GpuBufferType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    Shared,
    Private,
    Mapped,
}

impl BufferPolicy {
    fn suffix(self) -> &'static str {
        match self {
            BufferPolicy::Shared => "",
            BufferPolicy::Private => "_Private",
            BufferPolicy::Mapped => "_Mapped",
        }
    }
}

pub struct GpuBufferType {
    this: Weak<GpuBufferType>,
    device: Weak<GpuDevice>,
    policy: BufferPolicy,
    name: String,
    max_size: usize,
}

impl GpuBufferType {
    pub(crate) fn new(device: &GpuDevice, policy: BufferPolicy) -> Arc<Self> {
        let name = format!("{}{}", device.name, policy.suffix());
        tracing::debug!(device = %device.name, buft = %name, "buffer type created");
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            device: device.this.clone(),
            policy,
            name,
            max_size: device.config.max_buffer_size,
        })
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub(crate) fn belongs_to(&self, device: &GpuDevice) -> bool {
        std::ptr::eq(self.device.as_ptr(), device)
    }

    fn upgrade(&self, size: usize) -> Result<(Arc<GpuBufferType>, Arc<GpuDevice>)> {
        let buft = self
            .this
            .upgrade()
            .ok_or_else(|| BackendError::allocation(&self.name, size, "buffer type dropped"))?;
        let device = self
            .device
            .upgrade()
            .ok_or_else(|| BackendError::allocation(&self.name, size, "device dropped"))?;
        Ok((buft, device))
    }

    /// Wrap caller memory, split into views of at most `max_size` bytes that
    /// overlap by `max_tensor_size`.
    pub(crate) fn wrap(&self, memory: HostMemory, max_tensor_size: usize) -> Result<BufferRef> {
        let size = memory.len();
        let (buft, _device) = self.upgrade(size)?;
        let views = split_views(size, self.max_size, max_tensor_size)
            .ok_or_else(|| {
                BackendError::allocation(
                    &self.name,
                    size,
                    format!("tensors of {max_tensor_size} bytes do not fit a {} byte view", self.max_size),
                )
            })?;
        tracing::debug!(buft = %self.name, size, views = views.len(), "wrapping host memory");
        let iface = SharedBuffer::mapped(DeviceMemory::wrap(memory), views);
        Ok(Buffer::new(buft, size, Box::new(iface)).into_ref())
    }
}

/// Views covering `size` bytes, each at most `max_view` long, consecutive
/// views overlapping by `overlap` so any tensor of that size lies wholly in
/// one view.
fn split_views(size: usize, max_view: usize, overlap: usize) -> Option<Vec<Range<usize>>> {
    if size <= max_view {
        return Some(vec![0..size]);
    }
    if overlap >= max_view {
        return None;
    }
    let step = max_view - overlap;
    let mut views = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + max_view).min(size);
        views.push(start..end);
        if end == size {
            return Some(views);
        }
        start += step;
    }
}

impl fmt::Debug for GpuBufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBufferType")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

impl BufferType for GpuBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc_buffer(&self, size: usize) -> Result<BufferRef> {
        if size > self.max_size {
            tracing::warn!(buft = %self.name, size, max = self.max_size, "allocation exceeds max buffer size");
            return Err(BackendError::allocation(
                &self.name,
                size,
                format!("exceeds max buffer size of {} bytes", self.max_size),
            ));
        }
        let (buft, device) = self.upgrade(size)?;
        let start = Instant::now();
        let iface: Box<dyn BufferInterface> = match self.policy {
            BufferPolicy::Private => {
                let memory = DeviceMemory::allocate(&device.pool, size, MemoryKind::Private)?;
                Box::new(PrivateBuffer::new(memory, device.transfer_stream()?))
            }
            BufferPolicy::Shared | BufferPolicy::Mapped => {
                let memory = DeviceMemory::allocate(&device.pool, size, MemoryKind::Shared)?;
                Box::new(SharedBuffer::new(memory))
            }
        };
        tracing::debug!(
            buft = %self.name,
            size,
            free = device.pool.free(),
            "allocated buffer"
        );
        performance::record_allocation(&device.name, &self.name, size, start.elapsed().as_micros() as u64);
        Ok(Buffer::new(buft, size, iface).into_ref())
    }

    fn alignment(&self) -> usize {
        GPU_ALIGNMENT
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn alloc_size(&self, tensor: &Tensor) -> usize {
        tuning::gpu_alloc_size(tensor)
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Gpu
    }

    fn device(&self) -> Option<DeviceRef> {
        self.device.upgrade().map(|d| d as DeviceRef)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
