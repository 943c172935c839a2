//! Host buffers

use crate::backend::{Buffer, BufferInterface, MemoryKind};
use crate::backends::common::memory::{HostMemory, MemoryRegion};
use crate::error::Result;
use std::any::Any;
use std::sync::Arc;

/// Buffer interface over plain host memory.
///
/// Also used for caller memory wrapped by `buffer_from_host`, in which case
/// the region is shared with the caller.
#[derive(Debug)]
pub struct HostBuffer {
    region: HostMemory,
}

impl HostBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            region: Arc::new(MemoryRegion::new(size)),
        }
    }

    pub fn wrap(region: HostMemory) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &HostMemory {
        &self.region
    }
}

impl BufferInterface for HostBuffer {
    fn memory_kind(&self) -> MemoryKind {
        MemoryKind::Shared
    }

    fn base(&self) -> Option<usize> {
        Some(self.region.base_addr())
    }

    fn memset(&self, offset: usize, value: u8, size: usize) -> Result<()> {
        self.region.fill(offset, value, size)
    }

    fn set(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.region.write(offset, data)
    }

    fn get(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.region.read(offset, out)
    }

    /// memcpy when `src` is host memory; anything else is declined.
    fn cpy(&self, src: &Buffer, src_offset: usize, dst_offset: usize, size: usize) -> bool {
        if !src.is_host() {
            return false;
        }
        let copied = match src.interface().as_any().downcast_ref::<HostBuffer>() {
            Some(host) => self.region.copy_from(&host.region, src_offset, dst_offset, size),
            None => src
                .read(src_offset, size)
                .and_then(|bytes| self.region.write(dst_offset, &bytes)),
        };
        copied.is_ok()
    }

    fn clear(&self, value: u8) -> Result<()> {
        self.region.fill(0, value, self.region.len())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
