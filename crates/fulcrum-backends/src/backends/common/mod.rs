//! Infrastructure shared by the CPU and GPU backends
//!
//! - `memory` - fixed-size byte regions backing every buffer
//! - `access` - typed tensor reads and writes used by the reference forwards

pub mod access;
pub mod memory;

pub use access::{HostAccess, TensorAccess};
pub use memory::{HostMemory, MemoryRegion};
