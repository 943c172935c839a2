//! Tuning data for GPU-class kernels
//!
//! Everything here is configuration, not logic: specialization-constant slot
//! bases, per-quantization threadgroup sizing, flash-attention tiling, and
//! the scratch-space formulas `alloc_size` adds after a tensor's data.

use crate::tensor::{DataType, Op, Tensor};

// ============================================================================
// Specialization constant slots
// ============================================================================

/// First slot of each family's constant block.
pub mod slots {
    pub const FLASH_ATTN_EXT_PAD: u16 = 100;
    pub const FLASH_ATTN_EXT_BLK: u16 = 200;
    pub const FLASH_ATTN_EXT: u16 = 300;
    pub const FLASH_ATTN_EXT_VEC: u16 = 400;
    pub const FLASH_ATTN_EXT_VEC_REDUCE: u16 = 500;
    pub const MUL_MV: u16 = 600;
    pub const MUL_MM: u16 = 700;
}

// ============================================================================
// Row-per-simdgroup sizing
// ============================================================================

/// Simdgroup width.
pub const SIMD_WIDTH: usize = 32;

/// Sizing of a matrix-vector kernel for one weight type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantTuning {
    /// Simdgroups per threadgroup
    pub nsg: i32,
    /// src0 rows per simdgroup
    pub nr0: i32,
    /// Threadgroup memory in bytes
    pub smem: usize,
}

const fn row(nsg: i32, nr0: i32, smem: usize) -> Option<QuantTuning> {
    Some(QuantTuning { nsg, nr0, smem })
}

/// Matrix-vector sizing for a block-quantized weight type.
///
/// `None` for float and integer types, which are sized from the row length
/// instead (see [`float_mul_mv`]).
pub const fn quant_tuning(ty: DataType) -> Option<QuantTuning> {
    const F: usize = std::mem::size_of::<f32>();
    match ty {
        DataType::Q4_0 | DataType::Q4_1 | DataType::Q5_0 | DataType::Q5_1 => row(2, 4, 0),
        DataType::Q8_0 => row(4, 2, SIMD_WIDTH * F * 2),
        DataType::Mxfp4 => row(2, 2, SIMD_WIDTH * F),
        DataType::Q2K => row(2, 4, 0),
        DataType::Q3K | DataType::Q4K | DataType::Q5K | DataType::Q6K => row(2, 2, 0),
        DataType::Iq2Xxs => row(2, 4, 256 * 8 + 128),
        DataType::Iq2Xs => row(2, 4, 512 * 8 + 128),
        DataType::Iq3Xxs => row(2, 4, 256 * 4 + 128),
        DataType::Iq3S => row(2, 4, 512 * 4),
        DataType::Iq2S | DataType::Iq1S | DataType::Iq1M => row(2, 4, 0),
        DataType::Iq4Nl | DataType::Iq4Xs => row(2, 2, SIMD_WIDTH * F),
        DataType::F32 | DataType::F16 | DataType::Bf16 | DataType::I8 | DataType::I16 | DataType::I32 => None,
    }
}

/// Matrix-vector sizing for a float weight row of `ne00` elements.
///
/// Returns the tuning and whether the `short` variant applies. `allow_short`
/// is false for the expert-routed kernel, which has no short variant.
pub fn float_mul_mv(ne00: i64, allow_short: bool) -> (QuantTuning, bool) {
    if allow_short && ne00 < SIMD_WIDTH as i64 {
        return (QuantTuning { nsg: 1, nr0: 32, smem: 0 }, true);
    }
    let nsg = ((ne00 + 127) / 128).clamp(1, 4) as i32;
    let nr0 = 2;
    let tuning = QuantTuning {
        nsg,
        nr0,
        smem: SIMD_WIDTH * std::mem::size_of::<f32>() * nr0 as usize,
    };
    (tuning, false)
}

/// Threadgroup memory of the reduction kernels (sum_rows, soft_max, norms).
pub const REDUCE_SMEM: usize = SIMD_WIDTH * std::mem::size_of::<f32>();

/// argmax keeps one (value, index) pair per lane.
pub const ARGMAX_SMEM: usize = SIMD_WIDTH * (std::mem::size_of::<f32>() + std::mem::size_of::<i32>());

/// Matrix-matrix threadgroup memory with and without output bounds checks.
pub const MUL_MM_SMEM_BC_OUT: usize = 8192;
pub const MUL_MM_SMEM: usize = 4096 + 2048;
pub const MUL_MM_ID_SMEM: usize = 8192;

/// Batch size at which matrix-matrix kernels beat matrix-vector ones.
pub const MUL_MM_MIN_BATCH: i64 = 8;

/// Longest src1 batch handled by the extended matrix-vector kernel.
pub const MUL_MV_EXT_MAX_BATCH: i64 = 8;

// ============================================================================
// Flash attention
// ============================================================================

/// Queries per threadgroup
pub const FA_NQPTG: i64 = 8;
/// Cache items per simdgroup
pub const FA_NCPSG: i64 = 64;
/// Cache items per simdgroup, vector kernel
pub const FA_VEC_NCPSG: i64 = 32;
/// Workgroups the vector kernel splits the cache across
pub const FA_VEC_NWG: i64 = 32;
/// Simdgroups per threadgroup
pub const FA_NSG: i32 = 4;
pub const FA_VEC_NSG: i32 = 1;

/// Single-query batches with 32-aligned heads use the vector kernel.
pub fn flash_attn_use_vec(op: &Tensor) -> bool {
    let (Some(q), Some(k)) = (op.src(0), op.src(1)) else {
        return false;
    };
    q.ne()[1] < 20 && k.ne()[0] % 32 == 0
}

fn pad_to(x: usize, n: usize) -> usize {
    x.div_ceil(n) * n
}

// ============================================================================
// Scratch sizes
// ============================================================================

/// Tokens-per-expert counters appended after a `MulMatId` result.
pub fn mul_mat_id_extra_tpe(op: &Tensor) -> usize {
    let ne02 = op.src(0).map_or(0, |w| w.ne()[2].max(0) as usize);
    std::mem::size_of::<i32>() * ne02
}

/// Expert-to-token id map appended after a `MulMatId` result.
pub fn mul_mat_id_extra_ids(op: &Tensor) -> usize {
    let ne02 = op.src(0).map_or(0, |w| w.ne()[2].max(0) as usize);
    let ne21 = op.src(2).map_or(0, |ids| ids.ne()[1].max(0) as usize);
    std::mem::size_of::<i32>() * ne02 * ne21
}

/// Padded copies of K, V and mask when the cache length is not a multiple
/// of the per-simdgroup tile.
pub fn flash_attn_extra_pad(op: &Tensor) -> usize {
    let (Some(k), Some(v)) = (op.src(1), op.src(2)) else {
        return 0;
    };
    let ncpsg = if flash_attn_use_vec(op) { FA_VEC_NCPSG } else { FA_NCPSG };
    let ne11 = k.ne()[1];
    if ne11 % ncpsg == 0 {
        return 0;
    }
    let ncpsg = ncpsg as usize;
    let (kn, kb) = (k.ne().map(|n| n.max(0) as usize), k.nb());
    let (vn, vb) = (v.ne().map(|n| n.max(0) as usize), v.nb());
    let mut res = ncpsg * (kb[1] * kn[2] * kn[3]) + ncpsg * (vb[1] * vn[2] * vn[3]);
    if let Some(mask) = op.src(3) {
        let mn = mask.ne().map(|n| n.max(0) as usize);
        res += ncpsg * DataType::F16.type_size() * mn[1] * mn[2] * mn[3];
    }
    res
}

/// Per-tile mask summary used to skip fully masked blocks.
pub fn flash_attn_extra_blk(op: &Tensor) -> usize {
    if flash_attn_use_vec(op) {
        return 0;
    }
    let (Some(q), Some(mask)) = (op.src(0), op.src(3)) else {
        return 0;
    };
    let ne01 = q.ne()[1].max(0) as usize;
    let mn = mask.ne().map(|n| n.max(0) as usize);
    let nblk0 = mn[0].div_ceil(FA_NCPSG as usize);
    let nblk1 = ne01.div_ceil(FA_NQPTG as usize);
    pad_to(nblk0 * nblk1 * mn[2] * mn[3], 32)
}

/// Partial results of the vector kernel before the cross-workgroup reduce.
pub fn flash_attn_extra_tmp(op: &Tensor) -> usize {
    if !flash_attn_use_vec(op) {
        return 0;
    }
    let (Some(q), Some(v)) = (op.src(0), op.src(2)) else {
        return 0;
    };
    let qn = q.ne().map(|n| n.max(0) as usize);
    let ne20 = v.ne()[0].max(0) as usize;
    let nrows = qn[1].min(32) * qn[2] * qn[3];
    std::mem::size_of::<f32>() * nrows * FA_VEC_NWG as usize * (ne20 + 2)
}

/// Bytes a GPU buffer reserves for `tensor`: its data plus kernel scratch.
pub fn gpu_alloc_size(tensor: &Tensor) -> usize {
    let nbytes = tensor.nbytes();
    match tensor.op() {
        Op::MulMatId => nbytes + mul_mat_id_extra_tpe(tensor) + mul_mat_id_extra_ids(tensor),
        Op::FlashAttnExt { .. } => {
            nbytes + flash_attn_extra_pad(tensor) + flash_attn_extra_blk(tensor) + flash_attn_extra_tmp(tensor)
        }
        Op::Cumsum | Op::Argsort { .. } => nbytes * 2,
        Op::TopK { .. } => {
            let n = tensor.src(0).map_or(0, |s| s.nelements().max(0) as usize);
            2 * std::mem::size_of::<i32>() * n
        }
        _ => nbytes,
    }
}
