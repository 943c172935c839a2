//! Capability interfaces and the plain types they exchange

mod buffer;
mod event;
mod traits;
mod types;

pub use buffer::{Buffer, BufferRef};
pub use event::{Event, PendingRead};
pub use traits::{
    AbortCallback, Backend, BackendReg, BackendRegRef, BufferInterface, BufferType, BufferTypeRef, Device, DeviceRef,
};
pub use types::{
    BackendFamily, BlockDim, ComputeStatus, DeviceCaps, DeviceProps, DeviceType, Feature, GridDim, LaunchConfig,
    MemoryKind,
};
