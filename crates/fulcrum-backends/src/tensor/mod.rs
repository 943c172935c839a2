//! Tensor descriptors consumed by the runtime
//!
//! A [`Tensor`] carries just what backends need to allocate, bind and
//! dispatch: element type, 4-D extents and byte strides, the producing
//! [`Op`], its positional sources, and a write-once storage binding.
//!
//! ```rust
//! use fulcrum_backends::tensor::{DataType, Op, Tensor};
//!
//! let a = Tensor::new_2d("a", DataType::F32, 8, 4).into_ref();
//! let b = Tensor::new_2d("b", DataType::F32, 8, 4).into_ref();
//! let sum = Tensor::with_op("sum", Op::Add, DataType::F32, [8, 4, 1, 1], vec![Some(a), Some(b)]);
//! assert_eq!(sum.nbytes(), 8 * 4 * 4);
//! assert_eq!(sum.nrows(), 4);
//! ```

mod dtype;
mod graph;
mod op;

pub use dtype::DataType;
pub use graph::ComputeGraph;
pub use op::{GluOp, Op, PoolOp, RopeMode, SortOrder, UnaryOp};

use crate::backend::BufferRef;
use crate::error::{BackendError, Result};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Maximum number of dimensions.
pub const MAX_DIMS: usize = 4;

/// Shared handle to a tensor.
pub type TensorRef = Arc<Tensor>;

/// Where a tensor's bytes live.
#[derive(Debug, Clone)]
pub struct TensorStorage {
    pub buffer: BufferRef,
    /// Byte offset of element 0 inside `buffer`.
    pub offset: usize,
}

pub struct Tensor {
    name: String,
    dtype: DataType,
    ne: [i64; MAX_DIMS],
    nb: [usize; MAX_DIMS],
    op: Op,
    src: Vec<Option<TensorRef>>,
    storage: OnceLock<TensorStorage>,
}

impl Tensor {
    /// Leaf tensor with contiguous strides.
    pub fn new(name: impl Into<String>, dtype: DataType, ne: [i64; MAX_DIMS]) -> Self {
        Self::with_op(name, Op::None, dtype, ne, Vec::new())
    }

    pub fn new_1d(name: impl Into<String>, dtype: DataType, ne0: i64) -> Self {
        Self::new(name, dtype, [ne0, 1, 1, 1])
    }

    pub fn new_2d(name: impl Into<String>, dtype: DataType, ne0: i64, ne1: i64) -> Self {
        Self::new(name, dtype, [ne0, ne1, 1, 1])
    }

    pub fn new_3d(name: impl Into<String>, dtype: DataType, ne0: i64, ne1: i64, ne2: i64) -> Self {
        Self::new(name, dtype, [ne0, ne1, ne2, 1])
    }

    /// Result of `op` applied to `src`, with contiguous strides.
    pub fn with_op(
        name: impl Into<String>,
        op: Op,
        dtype: DataType,
        ne: [i64; MAX_DIMS],
        src: Vec<Option<TensorRef>>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            ne,
            nb: contiguous_strides(dtype, ne),
            op,
            src,
            storage: OnceLock::new(),
        }
    }

    /// Replace the byte strides (for permuted or padded layouts).
    pub fn with_strides(mut self, nb: [usize; MAX_DIMS]) -> Self {
        self.nb = nb;
        self
    }

    pub fn into_ref(self) -> TensorRef {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn ne(&self) -> [i64; MAX_DIMS] {
        self.ne
    }

    pub fn nb(&self) -> [usize; MAX_DIMS] {
        self.nb
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Source operand `i`, if present.
    pub fn src(&self, i: usize) -> Option<&TensorRef> {
        self.src.get(i).and_then(|s| s.as_ref())
    }

    pub fn srcs(&self) -> impl Iterator<Item = &TensorRef> {
        self.src.iter().flatten()
    }

    pub fn nelements(&self) -> i64 {
        self.ne.iter().product()
    }

    /// Rows are everything past the first dimension.
    pub fn nrows(&self) -> i64 {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    /// Bytes spanned by the tensor, honouring its strides.
    pub fn nbytes(&self) -> usize {
        if self.ne.iter().any(|&n| n <= 0) {
            return 0;
        }
        let blck = self.dtype.block_size();
        let mut nbytes = if blck == 1 {
            self.dtype.type_size()
        } else {
            self.ne[0] as usize * self.nb[0] / blck
        };
        let first = if blck == 1 { 0 } else { 1 };
        for i in first..MAX_DIMS {
            nbytes += (self.ne[i] as usize - 1) * self.nb[i];
        }
        nbytes
    }

    /// Bytes of one row of `ne[0]` elements.
    pub fn row_size(&self) -> usize {
        self.dtype.row_size(self.ne[0])
    }

    pub fn is_contiguous(&self) -> bool {
        self.nb == contiguous_strides(self.dtype, self.ne)
    }

    /// Elements within each row are packed, rows may be strided.
    pub fn is_contiguous_rows(&self) -> bool {
        self.ne[0] == self.dtype.block_size() as i64 || self.nb[0] == self.dtype.type_size()
    }

    /// Same extents in every dimension.
    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.ne == other.ne
    }

    /// `other` can be broadcast across `self` by repetition.
    pub fn can_repeat_from(&self, other: &Tensor) -> bool {
        (0..MAX_DIMS).all(|i| other.ne[i] > 0 && self.ne[i] % other.ne[i] == 0)
    }

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------

    /// Bind the tensor to `buffer` at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the tensor is already bound, or if the buffer type's
    /// allocation size for this tensor does not fit at `offset`.
    pub fn bind(&self, buffer: &BufferRef, offset: usize) -> Result<()> {
        let needed = buffer.buffer_type().alloc_size(self);
        if offset.checked_add(needed).is_none_or(|end| end > buffer.size()) {
            return Err(BackendError::BufferOutOfBounds {
                offset,
                size: needed,
                buffer_size: buffer.size(),
            });
        }
        self.storage
            .set(TensorStorage {
                buffer: Arc::clone(buffer),
                offset,
            })
            .map_err(|_| BackendError::invalid_tensor(&self.name, "already bound to a buffer"))
    }

    /// Bind as a view into `parent`'s storage, `offset` bytes in.
    pub fn bind_view(&self, parent: &Tensor, offset: usize) -> Result<()> {
        let storage = parent.storage_or_err()?;
        let offset = storage
            .offset
            .checked_add(offset)
            .ok_or_else(|| BackendError::invalid_tensor(&self.name, "view offset overflows"))?;
        self.storage
            .set(TensorStorage {
                buffer: Arc::clone(&storage.buffer),
                offset,
            })
            .map_err(|_| BackendError::invalid_tensor(&self.name, "already bound to a buffer"))
    }

    pub fn storage(&self) -> Option<&TensorStorage> {
        self.storage.get()
    }

    pub fn buffer(&self) -> Option<&BufferRef> {
        self.storage.get().map(|s| &s.buffer)
    }

    pub fn is_bound(&self) -> bool {
        self.storage.get().is_some()
    }

    pub(crate) fn storage_or_err(&self) -> Result<&TensorStorage> {
        self.storage
            .get()
            .ok_or_else(|| BackendError::invalid_tensor(&self.name, "not bound to a buffer"))
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        let nbytes = self.nbytes();
        if offset.checked_add(size).is_none_or(|end| end > nbytes) {
            return Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size: nbytes,
            });
        }
        Ok(())
    }

    /// Blocking write of `data` at byte `offset` within the tensor.
    pub fn set_bytes(&self, data: &[u8], offset: usize) -> Result<()> {
        self.check_range(offset, data.len())?;
        let storage = self.storage_or_err()?;
        storage.buffer.set(storage.offset + offset, data)
    }

    /// Blocking read of `size` bytes at byte `offset` within the tensor.
    pub fn get_bytes(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        self.check_range(offset, size)?;
        let storage = self.storage_or_err()?;
        let mut out = vec![0u8; size];
        storage.buffer.get(storage.offset + offset, &mut out)?;
        Ok(out)
    }

    /// Blocking fill of `size` bytes at `offset` with `value`.
    pub fn memset(&self, value: u8, offset: usize, size: usize) -> Result<()> {
        self.check_range(offset, size)?;
        let storage = self.storage_or_err()?;
        storage.buffer.memset(storage.offset + offset, value, size)
    }

    pub fn set_f32(&self, values: &[f32]) -> Result<()> {
        self.set_bytes(bytemuck::cast_slice(values), 0)
    }

    pub fn set_i32(&self, values: &[i32]) -> Result<()> {
        self.set_bytes(bytemuck::cast_slice(values), 0)
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let bytes = self.get_bytes(0, self.nbytes())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn to_i32_vec(&self) -> Result<Vec<i32>> {
        let bytes = self.get_bytes(0, self.nbytes())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("op", &self.op.name())
            .field("dtype", &self.dtype)
            .field("ne", &self.ne)
            .field("nb", &self.nb)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Packed strides for `ne` elements of `dtype`.
pub fn contiguous_strides(dtype: DataType, ne: [i64; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let nb0 = dtype.type_size();
    let nb1 = nb0 * (ne[0].max(0) as usize / dtype.block_size());
    let nb2 = nb1 * ne[1].max(0) as usize;
    let nb3 = nb2 * ne[2].max(0) as usize;
    [nb0, nb1, nb2, nb3]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_geometry() {
        let t = Tensor::new_3d("t", DataType::F32, 5, 3, 2);
        assert_eq!(t.nb(), [4, 20, 60, 120]);
        assert_eq!(t.nelements(), 30);
        assert_eq!(t.nrows(), 6);
        assert_eq!(t.nbytes(), 120);
        assert!(t.is_contiguous());
    }

    #[test]
    fn test_quantized_nbytes() {
        let t = Tensor::new_2d("w", DataType::Q8_0, 64, 3);
        assert_eq!(t.row_size(), 2 * 34);
        assert_eq!(t.nbytes(), 3 * 2 * 34);
    }

    #[test]
    fn test_strided_nbytes() {
        // a 4x2 view with rows 32 bytes apart
        let t = Tensor::new_2d("v", DataType::F32, 4, 2).with_strides([4, 32, 64, 64]);
        assert_eq!(t.nbytes(), 4 + 3 * 4 + 32);
        assert!(!t.is_contiguous());
        assert!(t.is_contiguous_rows());
    }

    #[test]
    fn test_empty_tensor_has_no_bytes() {
        let t = Tensor::new_2d("e", DataType::F32, 0, 7);
        assert_eq!(t.nbytes(), 0);
    }

    #[test]
    fn test_sources_and_repeat() {
        let a = Tensor::new_2d("a", DataType::F32, 8, 4).into_ref();
        let row = Tensor::new_1d("row", DataType::F32, 8).into_ref();
        let add = Tensor::with_op("add", Op::Add, DataType::F32, [8, 4, 1, 1], vec![Some(a.clone()), Some(row.clone())]);
        assert!(add.can_repeat_from(&row));
        assert_eq!(add.srcs().count(), 2);
        assert!(add.src(2).is_none());
        assert!(!add.is_bound());
        assert!(add.get_bytes(0, 4).is_err());
    }

    #[test]
    fn test_huge_offsets_are_rejected() {
        use crate::backend::Device;
        let device = crate::backends::cpu::CpuDevice::new(Default::default());
        let buffer = device.buffer_type().alloc_buffer(64).unwrap();
        let t = Tensor::new_1d("t", DataType::F32, 4);
        assert!(matches!(t.bind(&buffer, usize::MAX), Err(BackendError::BufferOutOfBounds { .. })));

        t.bind(&buffer, 0).unwrap();
        assert!(matches!(t.set_bytes(&[0; 4], usize::MAX), Err(BackendError::BufferOutOfBounds { .. })));
        assert!(t.get_bytes(usize::MAX - 1, 4).is_err());

        let view = Tensor::new_1d("v", DataType::F32, 1);
        assert!(matches!(view.bind_view(&t, usize::MAX), Err(BackendError::InvalidTensor { .. })));
    }
}
