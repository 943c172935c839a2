//! Typed tensor access for reference forwards
//!
//! Forwards are written once against [`TensorAccess`] and run unchanged on
//! the CPU (through the buffer's host interface) and inside the GPU command
//! stream (directly against device memory). The helpers here gather strided
//! tensors into logical element order and scatter results back.

use crate::error::{BackendError, Result};
use crate::tensor::{DataType, Tensor, MAX_DIMS};
use bytemuck::Pod;

/// Byte-level access to a tensor's storage.
///
/// Offsets are relative to the tensor's first byte.
pub trait TensorAccess: Sync {
    fn read(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<Vec<u8>>;

    fn write(&self, tensor: &Tensor, offset: usize, data: &[u8]) -> Result<()>;
}

/// Access through the blocking buffer interface.
///
/// Only valid where the caller may block on the buffer, i.e. outside any
/// command stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAccess;

impl TensorAccess for HostAccess {
    fn read(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<Vec<u8>> {
        tensor.get_bytes(offset, size)
    }

    fn write(&self, tensor: &Tensor, offset: usize, data: &[u8]) -> Result<()> {
        tensor.set_bytes(data, offset)
    }
}

/// Element type a tensor can be loaded as.
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

fn check_dtype<T: Element>(tensor: &Tensor) -> Result<()> {
    if tensor.dtype() != T::DTYPE {
        return Err(BackendError::unsupported_type(tensor.op(), tensor.dtype()));
    }
    Ok(())
}

/// Byte offsets of every element in logical (row-major, ne0 fastest) order.
fn element_offsets(tensor: &Tensor) -> impl Iterator<Item = usize> {
    let ne = tensor.ne().map(|n| n.max(0) as usize);
    let nb = tensor.nb();
    (0..ne[3]).flat_map(move |i3| {
        (0..ne[2]).flat_map(move |i2| {
            (0..ne[1]).flat_map(move |i1| (0..ne[0]).map(move |i0| i0 * nb[0] + i1 * nb[1] + i2 * nb[2] + i3 * nb[3]))
        })
    })
}

/// Load every element of `tensor` in logical order.
pub fn load<T: Element>(access: &dyn TensorAccess, tensor: &Tensor) -> Result<Vec<T>> {
    check_dtype::<T>(tensor)?;
    let bytes = access.read(tensor, 0, tensor.nbytes())?;
    if tensor.is_contiguous() {
        return Ok(bytemuck::pod_collect_to_vec(&bytes));
    }
    let width = std::mem::size_of::<T>();
    Ok(element_offsets(tensor)
        .map(|off| bytemuck::pod_read_unaligned(&bytes[off..off + width]))
        .collect())
}

/// Store `values` (logical order) into `tensor`.
pub fn store<T: Element>(access: &dyn TensorAccess, tensor: &Tensor, values: &[T]) -> Result<()> {
    check_dtype::<T>(tensor)?;
    if values.len() as i64 != tensor.nelements() {
        return Err(BackendError::invalid_tensor(
            tensor.name(),
            format!("expected {} elements, got {}", tensor.nelements(), values.len()),
        ));
    }
    if tensor.is_contiguous() {
        return access.write(tensor, 0, bytemuck::cast_slice(values));
    }
    let width = std::mem::size_of::<T>();
    let mut bytes = access.read(tensor, 0, tensor.nbytes())?;
    for (off, value) in element_offsets(tensor).zip(values) {
        bytes[off..off + width].copy_from_slice(bytemuck::bytes_of(value));
    }
    access.write(tensor, 0, &bytes)
}

/// Logical extents as `usize`.
pub fn dims(tensor: &Tensor) -> [usize; MAX_DIMS] {
    tensor.ne().map(|n| n.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory access keyed by tensor name.
    #[derive(Default)]
    struct MapAccess(Mutex<HashMap<String, Vec<u8>>>);

    impl TensorAccess for MapAccess {
        fn read(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<Vec<u8>> {
            let map = self.0.lock().unwrap();
            let bytes = map.get(tensor.name()).cloned().unwrap_or_else(|| vec![0; tensor.nbytes()]);
            Ok(bytes[offset..offset + size].to_vec())
        }

        fn write(&self, tensor: &Tensor, offset: usize, data: &[u8]) -> Result<()> {
            let mut map = self.0.lock().unwrap();
            let entry = map.entry(tensor.name().to_string()).or_insert_with(|| vec![0; tensor.nbytes()]);
            entry[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn test_strided_gather_scatter() {
        let access = MapAccess::default();
        // 2x2 view over rows 12 bytes apart
        let view = Tensor::new_2d("v", DataType::F32, 2, 2).with_strides([4, 12, 24, 24]);
        store(&access, &view, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let raw: Vec<f32> = bytemuck::pod_collect_to_vec(&access.read(&view, 0, view.nbytes()).unwrap());
        assert_eq!(raw, [1.0, 2.0, 0.0, 3.0, 4.0]);
        assert_eq!(load::<f32>(&access, &view).unwrap(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dtype_mismatch() {
        let access = MapAccess::default();
        let t = Tensor::new_1d("ids", DataType::I32, 4);
        assert!(load::<f32>(&access, &t).is_err());
        assert!(store::<i32>(&access, &t, &[1, 2]).is_err());
    }
}
