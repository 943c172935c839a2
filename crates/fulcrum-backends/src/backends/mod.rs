//! Backend implementations
//!
//! - `common` - byte regions and typed tensor access shared by both backends
//! - `cpu` - reference backend, synchronous, always compiled in
//! - `gpu` - GPU-class backend with asynchronous command streams (feature `gpu`)

pub mod common;
pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;

pub use cpu::{CpuBackend, CpuBackendReg, CpuDevice};
#[cfg(feature = "gpu")]
pub use gpu::{GpuBackend, GpuBackendReg, GpuDevice};
