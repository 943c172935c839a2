//! Device allocations

use super::traits::{BufferInterface, BufferTypeRef};
use super::types::{BackendFamily, MemoryKind};
use crate::error::{BackendError, Result};
use crate::tensor::Tensor;
use std::fmt;
use std::sync::Arc;

pub type BufferRef = Arc<Buffer>;

/// One allocation made by a [`super::BufferType`].
///
/// Every access is bounds-checked here before it reaches the policy-specific
/// [`BufferInterface`]. Dropping the last handle releases the memory.
pub struct Buffer {
    buft: BufferTypeRef,
    size: usize,
    iface: Box<dyn BufferInterface>,
}

impl Buffer {
    pub fn new(buft: BufferTypeRef, size: usize, iface: Box<dyn BufferInterface>) -> Self {
        Self { buft, size, iface }
    }

    pub fn into_ref(self) -> BufferRef {
        Arc::new(self)
    }

    pub fn buffer_type(&self) -> &BufferTypeRef {
        &self.buft
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn family(&self) -> BackendFamily {
        self.buft.family()
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.iface.memory_kind()
    }

    pub fn is_host(&self) -> bool {
        self.buft.is_host()
    }

    pub fn base(&self) -> Option<usize> {
        self.iface.base()
    }

    /// The policy implementation, for backends that need their own state.
    pub fn interface(&self) -> &dyn BufferInterface {
        self.iface.as_ref()
    }

    fn check(&self, offset: usize, size: usize) -> Result<()> {
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size: self.size,
            });
        }
        Ok(())
    }

    pub fn memset(&self, offset: usize, value: u8, size: usize) -> Result<()> {
        self.check(offset, size)?;
        self.iface.memset(offset, value, size)
    }

    pub fn set(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.iface.set(offset, data)
    }

    pub fn get(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        self.iface.get(offset, out)
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; size];
        self.get(offset, &mut out)?;
        Ok(out)
    }

    /// Copy `src` into `dst` (which must live in this buffer) on the device.
    ///
    /// Returns `false` when the policy does not handle the copy, or when the
    /// tensors are unbound or differ in size.
    pub fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> bool {
        let (Some(src_storage), Some(dst_storage)) = (src.storage(), dst.storage()) else {
            return false;
        };
        if !std::ptr::eq(Arc::as_ptr(&dst_storage.buffer), self) || src.nbytes() != dst.nbytes() {
            return false;
        }
        let size = src.nbytes();
        if src_storage.buffer.check(src_storage.offset, size).is_err() || self.check(dst_storage.offset, size).is_err()
        {
            return false;
        }
        self.iface
            .cpy(&src_storage.buffer, src_storage.offset, dst_storage.offset, size)
    }

    /// Fill the whole allocation with `value`.
    pub fn clear(&self, value: u8) -> Result<()> {
        self.iface.clear(value)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer_type", &self.buft.name())
            .field("size", &self.size)
            .field("memory_kind", &self.iface.memory_kind())
            .finish()
    }
}
