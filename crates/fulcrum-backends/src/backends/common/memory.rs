//! Byte storage shared across backends
//!
//! Every backend models its memory as [`MemoryRegion`]s:
//! - CPU: host buffers, and caller memory wrapped by `buffer_from_host`
//! - GPU: shared allocations (host visible) and private allocations (reached
//!   only by the command stream)
//!
//! A region never moves once created, so its base address is stable for the
//! lifetime of the allocation.

use crate::error::{BackendError, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

// ================================================================================================
// Memory Region
// ================================================================================================

/// Fixed-size block of zero-initialised bytes.
///
/// Reads take a shared lock and writes an exclusive one; there is no other
/// concurrency control, matching the contract that buffers carry none beyond
/// memory safety.
pub struct MemoryRegion {
    data: RwLock<Box<[u8]>>,
}

/// Caller-owned host memory, shared with any buffer that wraps it.
pub type HostMemory = Arc<MemoryRegion>;

impl MemoryRegion {
    /// Allocate `size` zeroed bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data.into_boxed_slice()),
        }
    }

    /// Convenience for building caller-owned memory.
    pub fn shared(size: usize) -> HostMemory {
        Arc::new(Self::new(size))
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host address of byte 0.
    pub fn base_addr(&self) -> usize {
        self.data.read().as_ptr() as usize
    }

    fn check(len: usize, offset: usize, size: usize) -> Result<()> {
        if offset.checked_add(size).is_none_or(|end| end > len) {
            return Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size: len,
            });
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        Self::check(data.len(), offset, out.len())?;
        out.copy_from_slice(&data[offset..offset + out.len()]);
        Ok(())
    }

    pub fn read_vec(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; size];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        Self::check(data.len(), offset, bytes.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&self, offset: usize, value: u8, size: usize) -> Result<()> {
        let mut data = self.data.write();
        Self::check(data.len(), offset, size)?;
        data[offset..offset + size].fill(value);
        Ok(())
    }

    /// Copy `size` bytes from `src` at `src_offset` to `dst_offset` here.
    ///
    /// `src` may be this region. Cross-region copies stage through a
    /// temporary so two opposite copies never hold both locks at once.
    pub fn copy_from(&self, src: &MemoryRegion, src_offset: usize, dst_offset: usize, size: usize) -> Result<()> {
        if std::ptr::eq(self, src) {
            let mut data = self.data.write();
            Self::check(data.len(), src_offset, size)?;
            Self::check(data.len(), dst_offset, size)?;
            data.copy_within(src_offset..src_offset + size, dst_offset);
            return Ok(());
        }
        let staged = src.read_vec(src_offset, size)?;
        self.write(dst_offset, &staged)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("len", &self.len())
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .finish()
    }
}
