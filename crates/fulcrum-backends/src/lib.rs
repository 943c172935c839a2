//! Pluggable compute-backend runtime for tensor graphs
//!
//! This crate provides:
//! - **Registry**: discovery of backends and devices, best-device selection
//! - **Device model**: buffer types, buffers, events and execution contexts
//! - **CPU Backend**: synchronous reference implementation
//! - **GPU Backend**: asynchronous command streams, kernel fusion and a
//!   lazily compiled pipeline cache (feature `gpu`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Registry                            │
//! │        (backends in priority order, flat device list)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!     ┌─────────────┐       ┌─────────────┐
//!     │ GPU Backend │       │ CPU Backend │
//!     │ GPU0..GPUn  │       │    CPU      │
//!     └──────┬──────┘       └──────┬──────┘
//!            │                     │
//!            ▼                     ▼
//!   PipelineLibrary ──▶ cpu::ops reference forwards
//!   (derive → cache → compile)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use fulcrum_backends::{ComputeGraph, ComputeStatus, DataType, Op, Tensor};
//! use fulcrum_backends::config::RuntimeConfig;
//! use fulcrum_backends::registry::Registry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::with_config(&RuntimeConfig::default());
//! let backend = registry.init_best().ok_or("no backend")?;
//! let device = backend.device();
//!
//! let a = Tensor::new_1d("a", DataType::F32, 4).into_ref();
//! let b = Tensor::new_1d("b", DataType::F32, 4).into_ref();
//! let sum = Tensor::with_op("sum", Op::Add, DataType::F32, [4, 1, 1, 1], vec![Some(a.clone()), Some(b.clone())])
//!     .into_ref();
//!
//! let buffer = device.buffer_type().alloc_buffer(3 * 64)?;
//! a.bind(&buffer, 0)?;
//! b.bind(&buffer, 64)?;
//! sum.bind(&buffer, 128)?;
//! a.set_f32(&[1.0, 2.0, 3.0, 4.0])?;
//! b.set_f32(&[10.0, 20.0, 30.0, 40.0])?;
//!
//! let graph = ComputeGraph::build_forward(&[sum.clone()]);
//! assert_eq!(backend.graph_compute(&graph), ComputeStatus::Success);
//! backend.synchronize();
//! assert_eq!(sum.to_f32_vec()?, vec![11.0, 22.0, 33.0, 44.0]);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod tensor;

// Re-export public API
pub use backend::{
    Backend, BackendFamily, BackendReg, Buffer, BufferRef, BufferType, ComputeStatus, Device, DeviceProps, DeviceType,
    Event, PendingRead,
};
pub use backends::{CpuBackend, CpuBackendReg, CpuDevice};
#[cfg(feature = "gpu")]
pub use backends::{GpuBackend, GpuBackendReg, GpuDevice};
pub use config::{CpuConfig, GpuDeviceConfig, RuntimeConfig};
pub use error::{BackendError, Result};
pub use registry::{registry, Inventory, Registry};
pub use tensor::{ComputeGraph, DataType, Op, Tensor, TensorRef};

// used by `fatal!` so callers need no direct `tracing` dependency
#[doc(hidden)]
pub use tracing as __tracing;
