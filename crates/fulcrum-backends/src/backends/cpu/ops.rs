//! Reference forwards
//!
//! One function per operation, written against [`TensorAccess`] so the same
//! code serves the CPU context and the GPU reference compiler. Inputs are
//! gathered into logical order with [`load`], computed row by row in
//! parallel, and scattered back with [`store`].

use super::vec::{self, type_traits};
use crate::backends::common::access::{dims, load, store, Element, TensorAccess};
use crate::error::{BackendError, Result};
use crate::tensor::{DataType, GluOp, Op, SortOrder, Tensor, TensorRef, UnaryOp, MAX_DIMS};
use rayon::prelude::*;

fn src<'a>(node: &'a Tensor, i: usize) -> Result<&'a TensorRef> {
    node.src(i)
        .ok_or_else(|| BackendError::invalid_tensor(node.name(), format!("{} is missing source {i}", node.op())))
}

/// `(i1, i2, i3)` of logical row `r`.
#[inline]
fn row_coords(r: usize, ne: [usize; MAX_DIMS]) -> (usize, usize, usize) {
    (r % ne[1], (r / ne[1]) % ne[2], r / (ne[1] * ne[2]))
}

#[inline]
fn row_index(i1: usize, i2: usize, i3: usize, ne: [usize; MAX_DIMS]) -> usize {
    (i3 * ne[2] + i2) * ne[1] + i1
}

fn all_f32(node: &Tensor) -> bool {
    node.dtype() == DataType::F32 && node.srcs().all(|s| s.dtype() == DataType::F32)
}

fn same_elements(node: &Tensor) -> bool {
    node.src(0).is_some_and(|s| s.nelements() == node.nelements())
}

fn plain(ty: DataType) -> bool {
    matches!(ty, DataType::F32 | DataType::I32)
}

/// Whether [`forward`] implements `node` for its operand types.
pub fn supports(node: &Tensor) -> bool {
    let s0 = node.src(0);
    let s1 = node.src(1);
    match *node.op() {
        ref op if op.is_empty() => true,
        Op::Add | Op::Sub | Op::Mul | Op::Div => {
            all_f32(node)
                && s0.is_some_and(|a| a.same_shape(node))
                && s1.is_some_and(|b| node.can_repeat_from(b))
        }
        Op::Scale { .. }
        | Op::Clamp { .. }
        | Op::LeakyRelu { .. }
        | Op::Sqr
        | Op::Sqrt
        | Op::Log
        | Op::Sin
        | Op::Cos
        | Op::Unary(_) => all_f32(node) && same_elements(node),
        Op::Glu { op: GluOp::SwigluOai, .. } => false,
        Op::Glu { .. } => all_f32(node),
        Op::Sum | Op::SumRows | Op::Mean | Op::Cumsum => all_f32(node),
        Op::SoftMax { .. } => all_f32(node) && same_elements(node),
        Op::Norm { .. } | Op::RmsNorm { .. } | Op::L2Norm { .. } => all_f32(node) && same_elements(node),
        Op::MulMat => match (s0, s1) {
            (Some(w), Some(x)) => {
                node.dtype() == DataType::F32
                    && type_traits(w.dtype()).is_some_and(|t| x.dtype() == t.vec_dot_type)
                    && w.ne()[0] == x.ne()[0]
                    && x.ne()[2] % w.ne()[2].max(1) == 0
                    && x.ne()[3] % w.ne()[3].max(1) == 0
            }
            _ => false,
        },
        Op::Cpy | Op::Dup => s0.is_some_and(|a| a.dtype() == node.dtype() && plain(a.dtype())) && same_elements(node),
        Op::GetRows => {
            node.dtype() == DataType::F32
                && s0.is_some_and(|a| a.dtype() == DataType::F32)
                && s1.is_some_and(|ids| ids.dtype() == DataType::I32)
        }
        Op::Argmax | Op::Argsort { .. } | Op::TopK { .. } => {
            node.dtype() == DataType::I32 && s0.is_some_and(|a| a.dtype() == DataType::F32)
        }
        Op::Concat { dim } => {
            dim < MAX_DIMS && plain(node.dtype()) && node.srcs().count() == 2 && node.srcs().all(|s| s.dtype() == node.dtype())
        }
        Op::Repeat => s0.is_some_and(|a| a.dtype() == node.dtype() && plain(a.dtype()) && node.can_repeat_from(a)),
        _ => false,
    }
}

/// Compute `node` from its sources.
///
/// # Errors
///
/// [`BackendError::UnsupportedOperation`] for ops without a forward;
/// [`BackendError::UnsupportedType`] / [`BackendError::InvalidTensor`] when
/// operands do not match what the forward expects.
pub fn forward(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    if node.op().is_empty() || node.nelements() == 0 {
        return Ok(());
    }
    match *node.op() {
        Op::Add => binary(node, access, |a, b| a + b),
        Op::Sub => binary(node, access, |a, b| a - b),
        Op::Mul => binary(node, access, |a, b| a * b),
        Op::Div => binary(node, access, |a, b| a / b),
        Op::Scale { scale, bias } => map(node, access, move |x| x * scale + bias),
        Op::Clamp { min, max } => map(node, access, move |x| x.clamp(min, max)),
        Op::LeakyRelu { slope } => map(node, access, move |x| if x > 0.0 { x } else { slope * x }),
        Op::Sqr => map(node, access, |x| x * x),
        Op::Sqrt => map(node, access, f32::sqrt),
        Op::Log => map(node, access, f32::ln),
        Op::Sin => map(node, access, f32::sin),
        Op::Cos => map(node, access, f32::cos),
        Op::Unary(op) => unary(node, access, op),
        Op::Glu { op, swapped } => glu(node, access, op, swapped),
        Op::Sum => sum(node, access),
        Op::SumRows => reduce_rows(node, access, false),
        Op::Mean => reduce_rows(node, access, true),
        Op::Cumsum => cumsum(node, access),
        Op::SoftMax { scale, max_bias } => soft_max(node, access, scale, max_bias),
        Op::Norm { eps } => norm(node, access, eps),
        Op::RmsNorm { eps } => rms_norm(node, access, eps),
        Op::L2Norm { eps } => l2_norm(node, access, eps),
        Op::MulMat => mul_mat(node, access),
        Op::Cpy | Op::Dup => match node.dtype() {
            DataType::I32 => copy::<i32>(node, access),
            _ => copy::<f32>(node, access),
        },
        Op::GetRows => get_rows(node, access),
        Op::Argmax => argmax(node, access),
        Op::Argsort { order } => argsort(node, access, order),
        Op::TopK { .. } => top_k(node, access),
        Op::Concat { dim } => match node.dtype() {
            DataType::I32 => concat::<i32>(node, access, dim),
            _ => concat::<f32>(node, access, dim),
        },
        Op::Repeat => match node.dtype() {
            DataType::I32 => repeat::<i32>(node, access),
            _ => repeat::<f32>(node, access),
        },
        ref other => Err(BackendError::unsupported(format!("no CPU forward for {other}"))),
    }
}

// ============================================================================
// Element-wise
// ============================================================================

fn binary(node: &Tensor, access: &dyn TensorAccess, f: fn(f32, f32) -> f32) -> Result<()> {
    let a = src(node, 0)?;
    let b = src(node, 1)?;
    if !a.same_shape(node) || !node.can_repeat_from(b) {
        return Err(BackendError::invalid_tensor(node.name(), "operands do not broadcast"));
    }
    let av = load::<f32>(access, a)?;
    let bv = load::<f32>(access, b)?;
    let ne = dims(node);
    let bn = dims(b);

    let mut out = vec![0.0f32; av.len()];
    out.par_chunks_mut(ne[0]).enumerate().for_each(|(r, row)| {
        let (i1, i2, i3) = row_coords(r, ne);
        let brow = row_index(i1 % bn[1], i2 % bn[2], i3 % bn[3], bn) * bn[0];
        let arow = &av[r * ne[0]..(r + 1) * ne[0]];
        for (i0, o) in row.iter_mut().enumerate() {
            *o = f(arow[i0], bv[brow + i0 % bn[0]]);
        }
    });
    store(access, node, &out)
}

fn map(node: &Tensor, access: &dyn TensorAccess, f: impl Fn(f32) -> f32 + Sync) -> Result<()> {
    let a = src(node, 0)?;
    let mut values = load::<f32>(access, a)?;
    values.par_iter_mut().for_each(|x| *x = f(*x));
    store(access, node, &values)
}

fn unary(node: &Tensor, access: &dyn TensorAccess, op: UnaryOp) -> Result<()> {
    match op {
        UnaryOp::Abs => map(node, access, f32::abs),
        UnaryOp::Sgn => map(node, access, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }),
        UnaryOp::Neg => map(node, access, |x| -x),
        UnaryOp::Step => map(node, access, |x| if x > 0.0 { 1.0 } else { 0.0 }),
        UnaryOp::Tanh => map(node, access, f32::tanh),
        UnaryOp::Elu => map(node, access, |x| if x > 0.0 { x } else { x.exp_m1() }),
        UnaryOp::Relu => map(node, access, |x| x.max(0.0)),
        UnaryOp::Sigmoid => map(node, access, vec::sigmoid),
        UnaryOp::Gelu => map(node, access, vec::gelu),
        UnaryOp::GeluErf => map(node, access, vec::gelu_erf),
        UnaryOp::GeluQuick => map(node, access, vec::gelu_quick),
        UnaryOp::Silu => {
            let traits = leaf_traits(node)?;
            let a = src(node, 0)?;
            let x = load::<f32>(access, a)?;
            let ne0 = dims(node)[0];
            let mut out = vec![0.0f32; x.len()];
            out.par_chunks_mut(ne0)
                .zip(x.par_chunks(ne0))
                .for_each(|(y, x)| (traits.vec_silu)(ne0, y, x));
            store(access, node, &out)
        }
        UnaryOp::Hardswish => map(node, access, |x| x * vec::hardsigmoid(x)),
        UnaryOp::Hardsigmoid => map(node, access, vec::hardsigmoid),
        UnaryOp::Exp => map(node, access, f32::exp),
    }
}

fn leaf_traits(node: &Tensor) -> Result<&'static vec::CpuTypeTraits> {
    type_traits(node.dtype()).ok_or_else(|| BackendError::unsupported_type(node.op(), node.dtype()))
}

fn glu(node: &Tensor, access: &dyn TensorAccess, op: GluOp, swapped: bool) -> Result<()> {
    let a = src(node, 0)?;
    let nc = dims(node)[0];
    let av = load::<f32>(access, a)?;

    // split: gate is a second tensor; fused: each row holds both halves
    let (x_stride, g_stride, x_off, g_off, gv) = match node.src(1) {
        Some(b) => (nc, nc, 0, 0, load::<f32>(access, b)?),
        None => {
            if dims(a)[0] != 2 * nc {
                return Err(BackendError::invalid_tensor(node.name(), "fused glu input must be twice the output width"));
            }
            let (x_off, g_off) = if swapped { (nc, 0) } else { (0, nc) };
            (2 * nc, 2 * nc, x_off, g_off, Vec::new())
        }
    };
    let gate = if gv.is_empty() { &av } else { &gv };
    let traits = leaf_traits(node)?;
    let act: fn(f32) -> f32 = match op {
        GluOp::Reglu => |x: f32| x.max(0.0),
        GluOp::Geglu => vec::gelu,
        GluOp::GegluErf => vec::gelu_erf,
        GluOp::GegluQuick => vec::gelu_quick,
        GluOp::Swiglu => vec::silu,
        GluOp::SwigluOai => return Err(BackendError::unsupported("swiglu_oai has no CPU forward")),
    };

    let mut out = vec![0.0f32; node.nelements() as usize];
    out.par_chunks_mut(nc).enumerate().for_each(|(r, y)| {
        let x = &av[r * x_stride + x_off..][..nc];
        let g = &gate[r * g_stride + g_off..][..nc];
        if op == GluOp::Swiglu {
            (traits.vec_swiglu)(nc, y, x, g);
        } else {
            for ((o, &xv), &gv) in y.iter_mut().zip(x).zip(g) {
                *o = act(xv) * gv;
            }
        }
    });
    store(access, node, &out)
}

// ============================================================================
// Reductions
// ============================================================================

fn sum(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let values = load::<f32>(access, src(node, 0)?)?;
    let total: f32 = values.par_iter().sum();
    store(access, node, &[total])
}

fn reduce_rows(node: &Tensor, access: &dyn TensorAccess, mean: bool) -> Result<()> {
    let a = src(node, 0)?;
    let ne0 = dims(a)[0];
    let values = load::<f32>(access, a)?;
    let out: Vec<f32> = values
        .par_chunks(ne0.max(1))
        .map(|row| {
            let s: f32 = row.iter().sum();
            if mean {
                s / ne0 as f32
            } else {
                s
            }
        })
        .collect();
    store(access, node, &out)
}

fn cumsum(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let a = src(node, 0)?;
    let mut values = load::<f32>(access, a)?;
    values.par_chunks_mut(dims(a)[0]).for_each(|row| {
        let mut acc = 0.0;
        for x in row {
            acc += *x;
            *x = acc;
        }
    });
    store(access, node, &values)
}

/// ALiBi slope for head `h`.
fn alibi_slope(max_bias: f32, n_head: usize, h: usize) -> f32 {
    if max_bias <= 0.0 {
        return 1.0;
    }
    let n_head_log2 = 1usize << (usize::BITS - 1 - n_head.max(1).leading_zeros());
    let m0 = 2f32.powf(-max_bias / n_head_log2 as f32);
    let m1 = 2f32.powf(-(max_bias / 2.0) / n_head_log2 as f32);
    if h < n_head_log2 {
        m0.powi(h as i32 + 1)
    } else {
        m1.powi(2 * (h - n_head_log2) as i32 + 1)
    }
}

fn soft_max(node: &Tensor, access: &dyn TensorAccess, scale: f32, max_bias: f32) -> Result<()> {
    let a = src(node, 0)?;
    let ne = dims(a);
    let values = load::<f32>(access, a)?;
    let mask = node.src(1).map(|m| load::<f32>(access, m).map(|v| (v, dims(m)))).transpose()?;
    if let Some((_, mn)) = &mask {
        if mn[0] < ne[0] {
            return Err(BackendError::invalid_tensor(node.name(), "mask rows are shorter than the input"));
        }
    }

    let mut out = vec![0.0f32; values.len()];
    out.par_chunks_mut(ne[0]).enumerate().for_each(|(r, y)| {
        let (i1, i2, i3) = row_coords(r, ne);
        let slope = alibi_slope(max_bias, ne[2], i2);
        let x = &values[r * ne[0]..(r + 1) * ne[0]];
        let mrow = mask.as_ref().map(|(mv, mn)| {
            let start = row_index(i1 % mn[1], i2 % mn[2], i3 % mn[3], *mn) * mn[0];
            &mv[start..start + ne[0]]
        });
        let mut max = f32::NEG_INFINITY;
        for (i, o) in y.iter_mut().enumerate() {
            *o = x[i] * scale + mrow.map_or(0.0, |m| slope * m[i]);
            max = max.max(*o);
        }
        let mut sum = 0.0;
        for o in y.iter_mut() {
            *o = if max == f32::NEG_INFINITY { 0.0 } else { (*o - max).exp() };
            sum += *o;
        }
        let inv = if sum > 0.0 { 1.0 / sum } else { 0.0 };
        y.iter_mut().for_each(|o| *o *= inv);
    });
    store(access, node, &out)
}

fn per_row(node: &Tensor, access: &dyn TensorAccess, f: impl Fn(&[f32], &mut [f32]) + Sync) -> Result<()> {
    let a = src(node, 0)?;
    let ne0 = dims(a)[0];
    let values = load::<f32>(access, a)?;
    let mut out = vec![0.0f32; values.len()];
    out.par_chunks_mut(ne0)
        .zip(values.par_chunks(ne0))
        .for_each(|(y, x)| f(x, y));
    store(access, node, &out)
}

fn norm(node: &Tensor, access: &dyn TensorAccess, eps: f32) -> Result<()> {
    per_row(node, access, |x, y| {
        let n = x.len() as f32;
        let mean = x.iter().sum::<f32>() / n;
        let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let scale = 1.0 / (var + eps).sqrt();
        for (o, v) in y.iter_mut().zip(x) {
            *o = (v - mean) * scale;
        }
    })
}

fn rms_norm(node: &Tensor, access: &dyn TensorAccess, eps: f32) -> Result<()> {
    per_row(node, access, |x, y| {
        let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let scale = 1.0 / (mean_sq + eps).sqrt();
        for (o, v) in y.iter_mut().zip(x) {
            *o = v * scale;
        }
    })
}

fn l2_norm(node: &Tensor, access: &dyn TensorAccess, eps: f32) -> Result<()> {
    per_row(node, access, |x, y| {
        let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt();
        let scale = 1.0 / norm.max(eps);
        for (o, v) in y.iter_mut().zip(x) {
            *o = v * scale;
        }
    })
}

// ============================================================================
// Matrix product
// ============================================================================

/// `dst[m, n] = dot(src0 row m, src1 row n)`, src0 broadcast over dims 2/3.
fn mul_mat(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let w = src(node, 0)?;
    let x = src(node, 1)?;
    let traits = type_traits(w.dtype()).ok_or_else(|| BackendError::unsupported_type(node.op(), w.dtype()))?;
    if x.dtype() != traits.vec_dot_type {
        return Err(BackendError::unsupported_type(node.op(), x.dtype()));
    }
    let wn = dims(w);
    let xn = dims(x);
    let k = wn[0];
    if xn[0] != k || wn[2] == 0 || wn[3] == 0 || xn[2] % wn[2] != 0 || xn[3] % wn[3] != 0 {
        return Err(BackendError::invalid_tensor(node.name(), "mul_mat operands do not match"));
    }
    let (r2, r3) = (xn[2] / wn[2], xn[3] / wn[3]);
    let wv = load::<f32>(access, w)?;
    let xv = load::<f32>(access, x)?;
    let m = wn[1];

    let mut out = vec![0.0f32; m * xn[1] * xn[2] * xn[3]];
    out.par_chunks_mut(m).enumerate().for_each(|(r, y)| {
        let (_, i2, i3) = row_coords(r, xn);
        let xrow = &xv[r * k..(r + 1) * k];
        let plane = ((i3 / r3) * wn[2] + i2 / r2) * m * k;
        for (j, o) in y.iter_mut().enumerate() {
            let wrow = &wv[plane + j * k..plane + (j + 1) * k];
            (traits.vec_dot)(k, o, wrow, xrow);
        }
    });
    store(access, node, &out)
}

// ============================================================================
// Data movement
// ============================================================================

fn copy<T: Element + Send + Sync>(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let values = load::<T>(access, src(node, 0)?)?;
    store(access, node, &values)
}

/// `dst` row `(i10, i11, i12)` is `src0` row `ids[i10, i11, i12]` of plane `(i11, i12)`.
fn get_rows(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let a = src(node, 0)?;
    let ids = src(node, 1)?;
    let an = dims(a);
    let values = load::<f32>(access, a)?;
    let idx = load::<i32>(access, ids)?;
    let idn = dims(ids);

    let mut out = vec![0.0f32; node.nelements() as usize];
    out.par_chunks_mut(an[0])
        .zip(idx.par_iter())
        .enumerate()
        .try_for_each(|(r, (y, &id))| -> Result<()> {
            let i11 = (r / idn[0]) % idn[1].max(1);
            let i12 = r / (idn[0] * idn[1].max(1));
            let row = usize::try_from(id).ok().filter(|&i| i < an[1]).ok_or_else(|| {
                BackendError::invalid_tensor(ids.name(), format!("row id {id} out of range 0..{}", an[1]))
            })?;
            let start = row_index(row, i11 % an[2], i12 % an[3], an) * an[0];
            y.copy_from_slice(&values[start..start + an[0]]);
            Ok(())
        })?;
    store(access, node, &out)
}

fn concat<T: Element + Send + Sync>(node: &Tensor, access: &dyn TensorAccess, dim: usize) -> Result<()> {
    let a = src(node, 0)?;
    let b = src(node, 1)?;
    let (an, bn, ne) = (dims(a), dims(b), dims(node));
    if (0..MAX_DIMS).any(|d| if d == dim { an[d] + bn[d] != ne[d] } else { an[d] != ne[d] || bn[d] != ne[d] }) {
        return Err(BackendError::invalid_tensor(node.name(), format!("cannot concat along dim {dim}")));
    }
    let av = load::<T>(access, a)?;
    let bv = load::<T>(access, b)?;
    let mut out = vec![T::zeroed(); node.nelements() as usize];
    out.par_chunks_mut(ne[0]).enumerate().for_each(|(r, y)| {
        let (i1, i2, i3) = row_coords(r, ne);
        for (i0, o) in y.iter_mut().enumerate() {
            let mut i = [i0, i1, i2, i3];
            *o = if i[dim] < an[dim] {
                av[row_index(i[1], i[2], i[3], an) * an[0] + i[0]]
            } else {
                i[dim] -= an[dim];
                bv[row_index(i[1], i[2], i[3], bn) * bn[0] + i[0]]
            };
        }
    });
    store(access, node, &out)
}

fn repeat<T: Element + Send + Sync>(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let a = src(node, 0)?;
    let (an, ne) = (dims(a), dims(node));
    let av = load::<T>(access, a)?;
    let mut out = vec![T::zeroed(); node.nelements() as usize];
    out.par_chunks_mut(ne[0]).enumerate().for_each(|(r, y)| {
        let (i1, i2, i3) = row_coords(r, ne);
        let start = row_index(i1 % an[1], i2 % an[2], i3 % an[3], an) * an[0];
        for (i0, o) in y.iter_mut().enumerate() {
            *o = av[start + i0 % an[0]];
        }
    });
    store(access, node, &out)
}

// ============================================================================
// Index selection
// ============================================================================

fn argmax(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let a = src(node, 0)?;
    let values = load::<f32>(access, a)?;
    let out: Vec<i32> = values
        .par_chunks(dims(a)[0])
        .map(|row| {
            let mut best = 0;
            for (i, v) in row.iter().enumerate() {
                if *v > row[best] {
                    best = i;
                }
            }
            best as i32
        })
        .collect();
    store(access, node, &out)
}

fn sorted_indices(row: &[f32], order: SortOrder) -> Vec<i32> {
    let mut idx: Vec<i32> = (0..row.len() as i32).collect();
    match order {
        SortOrder::Asc => idx.sort_by(|&i, &j| row[i as usize].total_cmp(&row[j as usize])),
        SortOrder::Desc => idx.sort_by(|&i, &j| row[j as usize].total_cmp(&row[i as usize])),
    }
    idx
}

fn argsort(node: &Tensor, access: &dyn TensorAccess, order: SortOrder) -> Result<()> {
    let a = src(node, 0)?;
    let values = load::<f32>(access, a)?;
    let out: Vec<i32> = values
        .par_chunks(dims(a)[0])
        .flat_map_iter(|row| sorted_indices(row, order))
        .collect();
    store(access, node, &out)
}

/// Indices of the `ne0` largest values of each row, largest first.
fn top_k(node: &Tensor, access: &dyn TensorAccess) -> Result<()> {
    let a = src(node, 0)?;
    let k = dims(node)[0];
    if k > dims(a)[0] {
        return Err(BackendError::invalid_tensor(node.name(), "k exceeds the row length"));
    }
    let values = load::<f32>(access, a)?;
    let out: Vec<i32> = values
        .par_chunks(dims(a)[0])
        .flat_map_iter(|row| sorted_indices(row, SortOrder::Desc).into_iter().take(k))
        .collect();
    store(access, node, &out)
}
