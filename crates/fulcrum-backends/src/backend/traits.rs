//! Capability interfaces every backend implements
//!
//! The rest of the runtime depends only on these traits:
//!
//! ```text
//! BackendReg ──owns──► Device ──yields──► BufferType ──allocates──► Buffer
//!                        │
//!                        └──init_backend──► Backend (execution context)
//!                                              │
//!                                              └── record/wait ──► Event
//! ```
//!
//! Registrations and devices live for the whole process. Buffer types are
//! memoized per (device, policy). Buffers, events and execution contexts
//! belong to whoever requested them and are released on drop.

use super::buffer::{Buffer, BufferRef};
use super::event::{Event, PendingRead};
use super::types::{BackendFamily, ComputeStatus, DeviceCaps, DeviceProps, DeviceType, Feature, MemoryKind};
use crate::backends::common::memory::HostMemory;
use crate::error::{BackendError, Result};
use crate::tensor::{ComputeGraph, Tensor};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub type BackendRegRef = Arc<dyn BackendReg>;
pub type DeviceRef = Arc<dyn Device>;
pub type BufferTypeRef = Arc<dyn BufferType>;

/// Predicate polled between graph nodes; `true` stops further submission.
pub type AbortCallback = Box<dyn Fn() -> bool + Send + Sync>;

// ============================================================================
// Registration
// ============================================================================

/// A compiled-in backend and the devices it exposes.
pub trait BackendReg: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn device_count(&self) -> usize;

    /// Device `index`.
    ///
    /// # Panics
    ///
    /// Aborts when `index >= device_count()`.
    fn device(&self, index: usize) -> DeviceRef;

    /// Build-time features, e.g. the compile oracle in use.
    fn features(&self) -> Vec<Feature> {
        Vec::new()
    }
}

// ============================================================================
// Device
// ============================================================================

/// One physical (or modelled) compute device.
pub trait Device: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// `(free, total)` bytes, read live.
    fn memory(&self) -> (usize, usize);

    fn device_type(&self) -> DeviceType;

    fn caps(&self) -> DeviceCaps;

    fn family(&self) -> BackendFamily;

    fn props(&self) -> DeviceProps {
        let (memory_free, memory_total) = self.memory();
        DeviceProps {
            name: self.name().to_string(),
            description: self.description().to_string(),
            memory_free,
            memory_total,
            device_type: self.device_type(),
            caps: self.caps(),
        }
    }

    /// Create an execution context on this device.
    ///
    /// `params` is backend-specific and may be ignored.
    fn init_backend(&self, params: Option<&str>) -> Result<Box<dyn Backend>>;

    /// Preferred buffer type for tensors computed on this device.
    fn buffer_type(&self) -> BufferTypeRef;

    /// Pinned host buffer type, when `caps().host_buffer` is set.
    fn host_buffer_type(&self) -> Option<BufferTypeRef> {
        None
    }

    /// Wrap caller-owned host memory as a device buffer without copying.
    ///
    /// `max_tensor_size` bounds the largest tensor that will be placed in
    /// the buffer, so that split views can overlap enough to hold any one
    /// tensor whole.
    fn buffer_from_host(&self, memory: HostMemory, max_tensor_size: usize) -> Result<BufferRef> {
        let _ = (memory, max_tensor_size);
        Err(BackendError::unsupported(format!(
            "{} cannot wrap host memory",
            self.name()
        )))
    }

    fn supports_op(&self, op: &Tensor) -> bool;

    fn supports_buft(&self, buft: &dyn BufferType) -> bool;

    /// Whether an op whose weights live elsewhere is worth moving here.
    fn offload_op(&self, op: &Tensor) -> bool {
        let _ = op;
        false
    }

    /// New event, or `None` when the device has no event support.
    fn event_new(&self) -> Option<Event> {
        None
    }

    /// Destroy an event. Dropping it has the same effect.
    fn event_free(&self, event: Event) {
        drop(event);
    }

    /// Block the host until `event` has been reached by the stream that
    /// last recorded it.
    fn event_synchronize(&self, event: &Event) {
        crate::fatal!(
            "event_synchronize on {} which has no event support (event from {})",
            self.name(),
            event.device()
        );
    }

    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Buffer types and buffers
// ============================================================================

/// Named allocation policy scoped to one device.
pub trait BufferType: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Allocate `size` bytes.
    ///
    /// # Errors
    ///
    /// [`BackendError::AllocationFailed`] when the device cannot satisfy the
    /// request. There is no retry.
    fn alloc_buffer(&self, size: usize) -> Result<BufferRef>;

    fn alignment(&self) -> usize;

    /// Largest single allocation.
    fn max_size(&self) -> usize {
        usize::MAX
    }

    /// Bytes to reserve for `tensor`, including any kernel scratch space
    /// that follows its data.
    fn alloc_size(&self, tensor: &Tensor) -> usize {
        tensor.nbytes()
    }

    fn is_host(&self) -> bool {
        false
    }

    fn family(&self) -> BackendFamily;

    /// Owning device, if still alive.
    fn device(&self) -> Option<DeviceRef>;

    fn as_any(&self) -> &dyn Any;
}

/// Policy-specific implementation behind a [`Buffer`].
///
/// Offsets are absolute within the allocation and already bounds-checked by
/// [`Buffer`].
pub trait BufferInterface: Send + Sync + fmt::Debug {
    fn memory_kind(&self) -> MemoryKind;

    /// Host address of byte 0, or `None` for device-only memory.
    fn base(&self) -> Option<usize>;

    fn memset(&self, offset: usize, value: u8, size: usize) -> Result<()>;

    fn set(&self, offset: usize, data: &[u8]) -> Result<()>;

    fn get(&self, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Device-side copy of `size` bytes from `src` into this buffer.
    /// Returns `false` when not handled; the caller falls back to a host
    /// round trip.
    fn cpy(&self, src: &Buffer, src_offset: usize, dst_offset: usize, size: usize) -> bool {
        let _ = (src, src_offset, dst_offset, size);
        false
    }

    fn clear(&self, value: u8) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Execution context
// ============================================================================

/// Execution context bound to one device; owns one command stream.
///
/// Work issued through a context executes in issue order. Only
/// [`Backend::synchronize`], [`Backend::event_wait`] and
/// [`PendingRead::wait`] block the caller.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn family(&self) -> BackendFamily;

    fn device(&self) -> DeviceRef;

    /// Enqueue a host-to-device write of `data` at `offset` within `tensor`.
    fn set_tensor_async(&self, tensor: &Tensor, data: Vec<u8>, offset: usize) -> Result<()>;

    /// Enqueue a device-to-host read of `size` bytes at `offset`.
    fn get_tensor_async(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<PendingRead>;

    /// Enqueue a device-to-device copy from `src` (reachable by this context)
    /// into `dst` (reachable by `dst_backend`). Returns `false` when this
    /// pairing is not handled.
    fn cpy_tensor_async(&self, dst_backend: &dyn Backend, src: &Tensor, dst: &Tensor) -> bool {
        let _ = (dst_backend, src, dst);
        false
    }

    /// Block until everything enqueued so far has completed.
    fn synchronize(&self);

    /// Issue every node of `graph`.
    ///
    /// # Panics
    ///
    /// Aborts if a node is an op the device does not support.
    fn graph_compute(&self, graph: &ComputeGraph) -> ComputeStatus;

    fn event_record(&self, event: &Event) {
        crate::fatal!("{} cannot record events (event from {})", self.name(), event.device());
    }

    fn event_wait(&self, event: &Event) {
        crate::fatal!("{} cannot wait on events (event from {})", self.name(), event.device());
    }

    fn set_abort_callback(&mut self, callback: Option<AbortCallback>);

    fn as_any(&self) -> &dyn Any;
}
