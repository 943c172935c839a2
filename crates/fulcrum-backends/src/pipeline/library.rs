//! Per-device pipeline library: key derivation, cache and compile oracle
//!
//! [`derive_kernels`] turns a fused node group into the ordered list of
//! kernels it dispatches. Most groups need one kernel; flash attention and
//! expert-routed matrix products stage data through auxiliary kernels first.
//! The last entry always writes the group's output.

use super::tuning::{self, slots};
use super::{
    BinaryOp, KernelBase, KernelCompiler, KernelFamily, Pipeline, PipelineCache, PipelineKey, PipelineMeta,
    SpecConstants, Variant,
};
use crate::error::{BackendError, Result};
use crate::tensor::{DataType, Op, Tensor, TensorRef};
use fulcrum_tracing::performance;
use std::sync::Arc;

/// One kernel to dispatch: its cache key and the metadata to attach if it
/// has to be compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpec {
    pub key: PipelineKey,
    pub meta: PipelineMeta,
}

impl KernelSpec {
    fn new(base: KernelBase, constants: SpecConstants, meta: PipelineMeta) -> Self {
        Self {
            key: PipelineKey::new(base, constants),
            meta,
        }
    }

    fn plain(base: KernelBase) -> Self {
        Self::new(base, SpecConstants::new(), PipelineMeta::default())
    }

    fn with_smem(base: KernelBase, smem: usize) -> Self {
        Self::new(base, SpecConstants::new(), PipelineMeta::with_smem(smem))
    }
}

// ============================================================================
// Library
// ============================================================================

/// Pipeline cache plus the compiler that fills it, scoped to one device.
#[derive(Debug)]
pub struct PipelineLibrary {
    device: String,
    cache: PipelineCache,
    compiler: Arc<dyn KernelCompiler>,
}

impl PipelineLibrary {
    pub fn new(device: impl Into<String>, compiler: Arc<dyn KernelCompiler>) -> Self {
        Self {
            device: device.into(),
            cache: PipelineCache::new(),
            compiler,
        }
    }

    pub fn cache(&self) -> &PipelineCache {
        &self.cache
    }

    pub fn compiler(&self) -> &Arc<dyn KernelCompiler> {
        &self.compiler
    }

    /// Cached pipeline for `spec`, compiled on first use.
    pub fn get(&self, spec: &KernelSpec) -> Result<Arc<Pipeline>> {
        self.cache.get_or_compile(&spec.key, |key| {
            let span = tracing::debug_span!("compile", device = %self.device, kernel = %key.base);
            let _entered = span.enter();
            let (kernel, duration_us) = fulcrum_tracing::timed_block!("pipeline_compile", {
                self.compiler.compile(&key.base, &key.constants)
            });
            let kernel = kernel.inspect_err(|err| {
                tracing::warn!(device = %self.device, pipeline = %key, error = %err, "pipeline compile failed");
            })?;
            performance::record_compile(&key.to_string(), key.constants.len(), duration_us);
            tracing::debug!(
                device = %self.device,
                pipeline = %key,
                smem = spec.meta.smem,
                nsg = spec.meta.nsg,
                "compiled pipeline"
            );
            Ok(Pipeline::new(key.clone(), spec.meta, kernel))
        })
    }

    /// Every pipeline `group` dispatches, in dispatch order.
    pub fn pipelines_for(&self, group: &[TensorRef]) -> Result<Vec<Arc<Pipeline>>> {
        derive_kernels(group)?.iter().map(|spec| self.get(spec)).collect()
    }
}

// ============================================================================
// Key derivation
// ============================================================================

fn src<'a>(op: &'a Tensor, i: usize) -> Result<&'a TensorRef> {
    op.src(i)
        .ok_or_else(|| BackendError::invalid_tensor(op.name(), format!("{} is missing source {i}", op.op())))
}

fn vec4_if(cond: bool) -> Variant {
    if cond {
        Variant::Vec4
    } else {
        Variant::Plain
    }
}

fn require_f32(op: &Tensor, ty: DataType) -> Result<()> {
    if ty != DataType::F32 {
        return Err(BackendError::unsupported_type(op.op(), ty));
    }
    Ok(())
}

/// Kernels dispatched for `group`, a run of nodes fused into one dispatch.
///
/// The group head selects the family; trailing nodes only contribute the
/// fuse count.
///
/// # Errors
///
/// [`BackendError::UnsupportedType`] / [`BackendError::UnsupportedOperation`]
/// when no kernel exists for the operand types or shape.
pub fn derive_kernels(group: &[TensorRef]) -> Result<Vec<KernelSpec>> {
    match group.first() {
        Some(head) => derive(head, group.len()),
        None => Ok(Vec::new()),
    }
}

/// Kernels dispatched for `op` on its own.
pub fn node_kernels(op: &Tensor) -> Result<Vec<KernelSpec>> {
    derive(op, 1)
}

fn derive(op: &Tensor, n_fuse: usize) -> Result<Vec<KernelSpec>> {
    let spec = match *op.op() {
        Op::Add | Op::Sub | Op::Mul | Op::Div => binary(op, n_fuse)?,
        Op::Norm { .. } | Op::RmsNorm { .. } => norm(op, n_fuse)?,
        Op::MulMat => return mul_mat(op),
        Op::MulMatId => return mul_mat_id(op),
        Op::FlashAttnExt { .. } => return flash_attn_ext(op),
        _ if n_fuse > 1 => {
            return Err(BackendError::unsupported(format!("{} cannot head a fused group", op.op())));
        }
        _ => single(op)?,
    };
    Ok(vec![spec])
}

fn binary(op: &Tensor, n_fuse: usize) -> Result<KernelSpec> {
    let bin = match op.op() {
        Op::Add => BinaryOp::Add,
        Op::Sub => BinaryOp::Sub,
        Op::Mul => BinaryOp::Mul,
        _ => BinaryOp::Div,
    };
    if !(1..=8).contains(&n_fuse) {
        return Err(BackendError::unsupported(format!("{} fuse of {n_fuse} nodes", bin.name())));
    }
    let a = src(op, 0)?;
    let b = src(op, 1)?;
    require_f32(op, a.dtype())?;
    require_f32(op, b.dtype())?;
    if !op.can_repeat_from(b) {
        return Err(BackendError::invalid_tensor(op.name(), "second operand does not broadcast"));
    }
    let row = b.nrows() == 1 && b.is_contiguous() && a.ne()[0] % 4 == 0 && b.ne()[0] == a.ne()[0];
    let variant = if row { Variant::Row } else { Variant::Plain };
    Ok(KernelSpec::plain(
        KernelBase::new(KernelFamily::Binary(bin))
            .with_variant(variant)
            .with_param(n_fuse as i32),
    ))
}

fn norm(op: &Tensor, n_fuse: usize) -> Result<KernelSpec> {
    let family = if matches!(op.op(), Op::Norm { .. }) {
        KernelFamily::Norm
    } else {
        KernelFamily::RmsNorm
    };
    if !(1..=3).contains(&n_fuse) {
        return Err(BackendError::unsupported(format!("{} fuse of {n_fuse} nodes", op.op())));
    }
    let a = src(op, 0)?;
    require_f32(op, a.dtype())?;
    if !a.is_contiguous_rows() {
        return Err(BackendError::invalid_tensor(a.name(), "norm input rows must be contiguous"));
    }
    Ok(KernelSpec::with_smem(
        KernelBase::new(family)
            .with_variant(vec4_if(op.ne()[0] % 4 == 0))
            .with_param(n_fuse as i32),
        tuning::REDUCE_SMEM,
    ))
}

fn elementwise_family(op: &Op) -> Option<KernelFamily> {
    Some(match *op {
        Op::Scale { .. } => KernelFamily::Scale,
        Op::Clamp { .. } => KernelFamily::Clamp,
        Op::Sqr => KernelFamily::Sqr,
        Op::Sqrt => KernelFamily::Sqrt,
        Op::Sin => KernelFamily::Sin,
        Op::Cos => KernelFamily::Cos,
        Op::Log => KernelFamily::Log,
        Op::LeakyRelu { .. } => KernelFamily::LeakyRelu,
        Op::Unary(u) => KernelFamily::Unary(u),
        _ => return None,
    })
}

/// Families dispatched as exactly one kernel with no fusion.
fn single(op: &Tensor) -> Result<KernelSpec> {
    let spec = match *op.op() {
        Op::Scale { .. }
        | Op::Clamp { .. }
        | Op::Sqr
        | Op::Sqrt
        | Op::Sin
        | Op::Cos
        | Op::Log
        | Op::LeakyRelu { .. }
        | Op::Unary(_) => {
            let a = src(op, 0)?;
            if !a.is_contiguous() {
                return Err(BackendError::invalid_tensor(a.name(), "unary input must be contiguous"));
            }
            if !a.dtype().is_float() {
                return Err(BackendError::unsupported_type(op.op(), a.dtype()));
            }
            let family = elementwise_family(op.op())
                .ok_or_else(|| BackendError::unsupported(format!("no kernel for {}", op.op())))?;
            KernelSpec::plain(
                KernelBase::new(family)
                    .with_types(&[a.dtype()])
                    .with_variant(vec4_if(op.nelements() % 4 == 0)),
            )
        }
        Op::Glu { op: glu, .. } => {
            let a = src(op, 0)?;
            if !a.is_contiguous_rows() {
                return Err(BackendError::invalid_tensor(a.name(), "glu input rows must be contiguous"));
            }
            if !a.dtype().is_float() {
                return Err(BackendError::unsupported_type(op.op(), a.dtype()));
            }
            KernelSpec::plain(KernelBase::new(KernelFamily::Glu(glu)).with_types(&[a.dtype()]))
        }
        Op::Sum => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            KernelSpec::plain(KernelBase::new(KernelFamily::Sum).with_types(&[a.dtype()]))
        }
        Op::SumRows | Op::Mean => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            let family = if matches!(op.op(), Op::Mean) {
                KernelFamily::Mean
            } else {
                KernelFamily::SumRows
            };
            KernelSpec::with_smem(KernelBase::new(family).with_types(&[a.dtype()]), tuning::REDUCE_SMEM)
        }
        Op::Cumsum => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            KernelSpec::with_smem(KernelBase::new(KernelFamily::Cumsum).with_types(&[a.dtype()]), tuning::REDUCE_SMEM)
        }
        Op::SoftMax { .. } => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            let mask_ty = op.src(1).map_or(DataType::F32, |m| m.dtype());
            if !matches!(mask_ty, DataType::F32 | DataType::F16) {
                return Err(BackendError::unsupported_type(op.op(), mask_ty));
            }
            KernelSpec::with_smem(
                KernelBase::new(KernelFamily::SoftMax)
                    .with_types(&[mask_ty])
                    .with_variant(vec4_if(a.ne()[0] % 4 == 0)),
                tuning::REDUCE_SMEM,
            )
        }
        Op::L2Norm { .. } => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            if a.ne()[0] % 4 != 0 {
                return Err(BackendError::unsupported("l2_norm rows must be a multiple of 4"));
            }
            KernelSpec::with_smem(KernelBase::new(KernelFamily::L2Norm).with_types(&[DataType::F32]), tuning::REDUCE_SMEM)
        }
        Op::GroupNorm { .. } => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            if !a.is_contiguous() {
                return Err(BackendError::invalid_tensor(a.name(), "group_norm input must be contiguous"));
            }
            KernelSpec::with_smem(
                KernelBase::new(KernelFamily::GroupNorm).with_types(&[DataType::F32]),
                tuning::REDUCE_SMEM,
            )
        }
        Op::Dup | Op::Cpy => {
            let a = src(op, 0)?;
            KernelSpec::plain(KernelBase::new(KernelFamily::Cpy).with_types(&[a.dtype(), op.dtype()]))
        }
        Op::GetRows => {
            let a = src(op, 0)?;
            let ids = src(op, 1)?;
            if ids.dtype() != DataType::I32 {
                return Err(BackendError::unsupported_type(op.op(), ids.dtype()));
            }
            KernelSpec::plain(KernelBase::new(KernelFamily::GetRows).with_types(&[a.dtype()]))
        }
        Op::SetRows => {
            let ids = src(op, 1)?;
            if !matches!(ids.dtype(), DataType::I32) {
                return Err(BackendError::unsupported_type(op.op(), ids.dtype()));
            }
            KernelSpec::plain(KernelBase::new(KernelFamily::SetRows).with_types(&[op.dtype(), ids.dtype()]))
        }
        Op::Repeat => {
            let a = src(op, 0)?;
            KernelSpec::plain(KernelBase::new(KernelFamily::Repeat).with_types(&[a.dtype()]))
        }
        Op::Concat { .. } => KernelSpec::plain(KernelBase::new(KernelFamily::Concat)),
        Op::AddId => KernelSpec::plain(KernelBase::new(KernelFamily::AddId)),
        Op::Argmax => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            if !a.is_contiguous_rows() {
                return Err(BackendError::invalid_tensor(a.name(), "argmax input rows must be contiguous"));
            }
            KernelSpec::with_smem(KernelBase::new(KernelFamily::Argmax).with_types(&[a.dtype()]), tuning::ARGMAX_SMEM)
        }
        Op::Argsort { order } => {
            let a = src(op, 0)?;
            KernelSpec::plain(KernelBase::new(KernelFamily::Argsort(order)).with_types(&[a.dtype(), op.dtype()]))
        }
        Op::TopK { .. } => {
            let a = src(op, 0)?;
            KernelSpec::plain(KernelBase::new(KernelFamily::TopK).with_types(&[a.dtype(), op.dtype()]))
        }
        Op::SsmConv => {
            let a = src(op, 0)?;
            let b = src(op, 1)?;
            require_f32(op, a.dtype())?;
            require_f32(op, b.dtype())?;
            KernelSpec::plain(
                KernelBase::new(KernelFamily::SsmConv)
                    .with_types(&[a.dtype(), b.dtype()])
                    .with_variant(vec4_if(b.ne()[0] % 4 == 0)),
            )
        }
        Op::SsmScan => {
            let a = src(op, 0)?;
            let nsg = ((a.ne()[0] + 31) / 32).max(1) as i32;
            KernelSpec::new(
                KernelBase::new(KernelFamily::SsmScan)
                    .with_types(&[a.dtype()])
                    .with_param(nsg),
                SpecConstants::new(),
                PipelineMeta {
                    smem: tuning::REDUCE_SMEM * nsg as usize,
                    nsg,
                    ..PipelineMeta::default()
                },
            )
        }
        Op::RwkvWkv6 | Op::RwkvWkv7 => {
            let a = src(op, 0)?;
            let heads = a.ne()[1];
            if heads <= 0 || op.ne()[0] % heads != 0 || op.ne()[0] / heads != 64 {
                return Err(BackendError::unsupported("rwkv requires 64-wide heads"));
            }
            let family = if matches!(op.op(), Op::RwkvWkv6) {
                KernelFamily::RwkvWkv6
            } else {
                KernelFamily::RwkvWkv7
            };
            KernelSpec::plain(KernelBase::new(family).with_types(&[a.dtype()]))
        }
        Op::Rope { mode, .. } => {
            let a = src(op, 0)?;
            KernelSpec::plain(KernelBase::new(KernelFamily::Rope(mode)).with_types(&[a.dtype()]))
        }
        Op::Im2col => {
            if !matches!(op.dtype(), DataType::F32 | DataType::F16) {
                return Err(BackendError::unsupported_type(op.op(), op.dtype()));
            }
            KernelSpec::plain(KernelBase::new(KernelFamily::Im2col).with_types(&[op.dtype()]))
        }
        Op::ConvTranspose1d | Op::ConvTranspose2d => {
            let a = src(op, 0)?;
            let b = src(op, 1)?;
            require_f32(op, b.dtype())?;
            let family = if matches!(op.op(), Op::ConvTranspose1d) {
                KernelFamily::ConvTranspose1d
            } else {
                KernelFamily::ConvTranspose2d
            };
            KernelSpec::plain(KernelBase::new(family).with_types(&[a.dtype(), b.dtype()]))
        }
        Op::Pool2d { op: pool } => {
            let a = src(op, 0)?;
            require_f32(op, a.dtype())?;
            KernelSpec::plain(KernelBase::new(KernelFamily::Pool2d(pool)).with_types(&[a.dtype()]))
        }
        Op::Upscale | Op::Pad | Op::PadReflect1d | Op::TimestepEmbedding | Op::OptStepAdamw | Op::OptStepSgd => {
            let a = src(op, 0)?;
            let family = match *op.op() {
                Op::Upscale => KernelFamily::Upscale,
                Op::Pad => KernelFamily::Pad,
                Op::PadReflect1d => KernelFamily::PadReflect1d,
                Op::TimestepEmbedding => KernelFamily::TimestepEmbedding,
                Op::OptStepAdamw => KernelFamily::OptStepAdamw,
                _ => KernelFamily::OptStepSgd,
            };
            KernelSpec::plain(KernelBase::new(family).with_types(&[a.dtype()]))
        }
        Op::Arange => KernelSpec::plain(KernelBase::new(KernelFamily::Arange).with_types(&[op.dtype()])),
        other => return Err(BackendError::unsupported(format!("no kernel for {other}"))),
    };
    Ok(spec)
}

// ----------------------------------------------------------------------------
// Matrix products
// ----------------------------------------------------------------------------

/// Weight types the extended matrix-vector kernel handles.
fn mul_mv_ext_supported(ty: DataType) -> bool {
    matches!(
        ty,
        DataType::F32
            | DataType::F16
            | DataType::Bf16
            | DataType::Q4_0
            | DataType::Q4_1
            | DataType::Q5_0
            | DataType::Q5_1
            | DataType::Q8_0
            | DataType::Mxfp4
            | DataType::Iq4Nl
            | DataType::Q4K
            | DataType::Q5K
            | DataType::Q6K
    )
}

/// Matrix-vector sizing for `tsrc0` with rows of `ne00` elements.
fn mul_mv_tuning(op: &Tensor, tsrc0: DataType, ne00: i64, allow_short: bool) -> Result<(tuning::QuantTuning, Variant)> {
    if matches!(tsrc0, DataType::F32 | DataType::F16 | DataType::Bf16) {
        let (t, short) = tuning::float_mul_mv(ne00, allow_short);
        let variant = if short {
            Variant::Short
        } else {
            vec4_if(ne00 % 4 == 0)
        };
        return Ok((t, variant));
    }
    tuning::quant_tuning(tsrc0)
        .map(|t| (t, Variant::Plain))
        .ok_or_else(|| BackendError::unsupported_type(op.op(), tsrc0))
}

fn mul_mat(op: &Tensor) -> Result<Vec<KernelSpec>> {
    let w = src(op, 0)?;
    let x = src(op, 1)?;
    let (tsrc0, tsrc1) = (w.dtype(), x.dtype());
    if !matches!(tsrc1, DataType::F32 | DataType::F16) {
        return Err(BackendError::unsupported_type(op.op(), tsrc1));
    }
    let ne00 = w.ne()[0];
    let ne11 = x.ne()[1];

    // small batches: several src1 rows per threadgroup
    if (2..=tuning::MUL_MV_EXT_MAX_BATCH).contains(&ne11)
        && ne00 % 128 == 0
        && tsrc1 == DataType::F32
        && mul_mv_ext_supported(tsrc0)
    {
        let nsg: i16 = 2;
        let nxpsg: i16 = if ne00 % 256 == 0 && ne11 < 3 { 16 } else { 8 };
        let r1ptg = match ne11 {
            2 => 2,
            3 | 6 => 3,
            5 => 5,
            _ => 4,
        };
        return Ok(vec![KernelSpec::new(
            KernelBase::new(KernelFamily::MulMvExt)
                .with_types(&[tsrc0, tsrc1])
                .with_param(r1ptg),
            SpecConstants::new()
                .with_i16(slots::MUL_MV, nsg)
                .with_i16(slots::MUL_MV + 1, nxpsg),
            PipelineMeta {
                nsg: nsg as i32,
                nr1: r1ptg,
                ..PipelineMeta::default()
            },
        )]);
    }

    // large batches: tiled matrix-matrix
    if ne11 > tuning::MUL_MM_MIN_BATCH && ne00 >= 64 {
        let bc_inp = ne00 % 32 != 0;
        let bc_out = op.ne()[0] % 64 != 0 || op.ne()[1] % 32 != 0;
        let smem = if bc_out {
            tuning::MUL_MM_SMEM_BC_OUT
        } else {
            tuning::MUL_MM_SMEM
        };
        return Ok(vec![KernelSpec::new(
            KernelBase::new(KernelFamily::MulMm).with_types(&[tsrc0, tsrc1]),
            SpecConstants::new()
                .with_bool(slots::MUL_MM, bc_inp)
                .with_bool(slots::MUL_MM + 1, bc_out),
            PipelineMeta::with_smem(smem),
        )]);
    }

    let (t, variant) = mul_mv_tuning(op, tsrc0, ne00, true)?;
    Ok(vec![KernelSpec::new(
        KernelBase::new(KernelFamily::MulMv)
            .with_types(&[tsrc0, tsrc1])
            .with_variant(variant),
        SpecConstants::new().with_i16(slots::MUL_MV, t.nsg as i16),
        PipelineMeta {
            smem: t.smem,
            nr0: t.nr0,
            nr1: 1,
            nsg: t.nsg,
        },
    )])
}

/// Token count at which routed products switch to the tiled kernel.
const MUL_MM_ID_MIN_TOKENS: i64 = 32;

fn mul_mat_id(op: &Tensor) -> Result<Vec<KernelSpec>> {
    let w = src(op, 0)?;
    let x = src(op, 1)?;
    let ids = src(op, 2)?;
    if ids.dtype() != DataType::I32 {
        return Err(BackendError::unsupported_type(op.op(), ids.dtype()));
    }
    let (tsrc0, tsrc1) = (w.dtype(), x.dtype());
    if tsrc1 != DataType::F32 {
        return Err(BackendError::unsupported_type(op.op(), tsrc1));
    }
    let ne00 = w.ne()[0];
    let ne02 = w.ne()[2];
    let ne20 = ids.ne()[0];
    let n_tokens = x.ne()[2];

    if n_tokens >= MUL_MM_ID_MIN_TOKENS && ne00 >= 64 {
        let map0 = KernelSpec::with_smem(
            KernelBase::new(KernelFamily::MulMmIdMap0).with_param(ne20 as i32),
            (ne02 * ne20) as usize * std::mem::size_of::<u16>(),
        );
        let mm = KernelSpec::new(
            KernelBase::new(KernelFamily::MulMmId).with_types(&[tsrc0, tsrc1]),
            SpecConstants::new().with_bool(slots::MUL_MM, ne00 % 32 != 0),
            PipelineMeta::with_smem(tuning::MUL_MM_ID_SMEM),
        );
        return Ok(vec![map0, mm]);
    }

    let (t, variant) = mul_mv_tuning(op, tsrc0, ne00, false)?;
    Ok(vec![KernelSpec::new(
        KernelBase::new(KernelFamily::MulMvId)
            .with_types(&[tsrc0, tsrc1])
            .with_variant(variant),
        SpecConstants::new().with_i16(slots::MUL_MV, t.nsg as i16),
        PipelineMeta {
            smem: t.smem,
            nr0: t.nr0,
            nr1: 1,
            nsg: t.nsg,
        },
    )])
}

// ----------------------------------------------------------------------------
// Flash attention
// ----------------------------------------------------------------------------

fn pad(x: i64, n: i64) -> i64 {
    (x + n - 1) / n * n
}

fn flash_attn_ext(op: &Tensor) -> Result<Vec<KernelSpec>> {
    let Op::FlashAttnExt {
        max_bias, softcap, ..
    } = *op.op()
    else {
        return Err(BackendError::unsupported(format!("{} is not flash attention", op.op())));
    };
    let q = src(op, 0)?;
    let k = src(op, 1)?;
    let v = src(op, 2)?;
    require_f32(op, q.dtype())?;

    let mask = op.src(3);
    let has_mask = mask.is_some();
    let has_sinks = op.src(4).is_some();
    let has_bias = max_bias != 0.0;
    let has_scap = softcap != 0.0;

    let dk = k.ne()[0] as i32;
    let dv = v.ne()[0] as i32;
    let ns10 = (k.nb()[1] / k.nb()[0].max(1)) as i32;
    let ns20 = (v.nb()[1] / v.nb()[0].max(1)) as i32;

    let use_vec = tuning::flash_attn_use_vec(op);
    let ncpsg = if use_vec {
        tuning::FA_VEC_NCPSG
    } else {
        tuning::FA_NCPSG
    };
    let has_kvpad = k.ne()[1] % ncpsg != 0;

    let mut specs = Vec::with_capacity(3);

    if has_kvpad {
        specs.push(KernelSpec::new(
            KernelBase::new(KernelFamily::FlashAttnExtPad),
            SpecConstants::new()
                .with_bool(slots::FLASH_ATTN_EXT_PAD, has_mask)
                .with_i32(slots::FLASH_ATTN_EXT_PAD + 25, ncpsg as i32),
            PipelineMeta::default(),
        ));
    }

    // q/k/v tiles are staged as f16
    const HALF: i64 = 2;
    let is_q = k.dtype().is_quantized() as i64;

    if use_vec {
        let nsg = tuning::FA_VEC_NSG;
        let nwg = tuning::FA_VEC_NWG as i32;
        let smem = pad(
            (pad(dk as i64, 128) + 4 * ncpsg * nsg as i64 + 2 * pad(dv as i64, 128) * nsg as i64) * HALF,
            16,
        ) as usize;
        specs.push(KernelSpec::new(
            KernelBase::new(KernelFamily::FlashAttnExtVec)
                .with_types(&[k.dtype()])
                .with_param(dk)
                .with_param(dv),
            SpecConstants::new()
                .with_bool(slots::FLASH_ATTN_EXT_VEC, has_mask)
                .with_bool(slots::FLASH_ATTN_EXT_VEC + 1, has_sinks)
                .with_bool(slots::FLASH_ATTN_EXT_VEC + 2, has_bias)
                .with_bool(slots::FLASH_ATTN_EXT_VEC + 3, has_scap)
                .with_bool(slots::FLASH_ATTN_EXT_VEC + 4, has_kvpad)
                .with_i32(slots::FLASH_ATTN_EXT_VEC + 20, ns10)
                .with_i32(slots::FLASH_ATTN_EXT_VEC + 21, ns20)
                .with_i32(slots::FLASH_ATTN_EXT_VEC + 22, nsg)
                .with_i32(slots::FLASH_ATTN_EXT_VEC + 23, nwg),
            PipelineMeta {
                smem,
                nsg,
                ..PipelineMeta::default()
            },
        ));
        if nwg > 1 {
            specs.push(KernelSpec::new(
                KernelBase::new(KernelFamily::FlashAttnExtVecReduce),
                SpecConstants::new()
                    .with_i32(slots::FLASH_ATTN_EXT_VEC_REDUCE, dv)
                    .with_i32(slots::FLASH_ATTN_EXT_VEC_REDUCE + 1, nwg),
                PipelineMeta::default(),
            ));
        }
        return Ok(specs);
    }

    if has_mask {
        specs.push(KernelSpec::new(
            KernelBase::new(KernelFamily::FlashAttnExtBlk),
            SpecConstants::new()
                .with_i32(slots::FLASH_ATTN_EXT_BLK + 24, tuning::FA_NQPTG as i32)
                .with_i32(slots::FLASH_ATTN_EXT_BLK + 25, ncpsg as i32),
            PipelineMeta::default(),
        ));
    }

    let nsg = tuning::FA_NSG;
    let bc_mask = mask.is_some_and(|m| m.ne()[1] % 8 != 0);
    let smem = pad(
        (tuning::FA_NQPTG * (dk as i64 + 2 * pad(dv as i64, 64) + 4 * ncpsg) + is_q * 16 * 32 * nsg as i64)
            * HALF,
        16,
    ) as usize;
    specs.push(KernelSpec::new(
        KernelBase::new(KernelFamily::FlashAttnExt)
            .with_types(&[k.dtype()])
            .with_param(dk)
            .with_param(dv),
        SpecConstants::new()
            .with_bool(slots::FLASH_ATTN_EXT, has_mask)
            .with_bool(slots::FLASH_ATTN_EXT + 1, has_sinks)
            .with_bool(slots::FLASH_ATTN_EXT + 2, has_bias)
            .with_bool(slots::FLASH_ATTN_EXT + 3, has_scap)
            .with_bool(slots::FLASH_ATTN_EXT + 4, has_kvpad)
            .with_bool(slots::FLASH_ATTN_EXT + 10, bc_mask)
            .with_i32(slots::FLASH_ATTN_EXT + 20, ns10)
            .with_i32(slots::FLASH_ATTN_EXT + 21, ns20)
            .with_i32(slots::FLASH_ATTN_EXT + 22, nsg),
        PipelineMeta {
            smem,
            nsg,
            ..PipelineMeta::default()
        },
    ));
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ConstValue;
    use crate::tensor::{SortOrder, UnaryOp};

    fn leaf(name: &str, dtype: DataType, ne: [i64; 4]) -> TensorRef {
        Tensor::new(name, dtype, ne).into_ref()
    }

    fn node(op: Op, dtype: DataType, ne: [i64; 4], srcs: Vec<TensorRef>) -> TensorRef {
        Tensor::with_op("n", op, dtype, ne, srcs.into_iter().map(Some).collect()).into_ref()
    }

    fn one(group: &[TensorRef]) -> KernelSpec {
        let mut specs = derive_kernels(group).unwrap();
        assert_eq!(specs.len(), 1);
        specs.remove(0)
    }

    #[test]
    fn test_unary_vec4_selection() {
        let a = leaf("a", DataType::F32, [8, 2, 1, 1]);
        let spec = one(&[node(Op::Unary(UnaryOp::Silu), DataType::F32, [8, 2, 1, 1], vec![a])]);
        assert_eq!(spec.key.base.variant, Variant::Vec4);
        assert_eq!(spec.key.base.to_string(), "kernel_silu_f32_4");

        let b = leaf("b", DataType::F32, [7, 1, 1, 1]);
        let spec = one(&[node(Op::Sqr, DataType::F32, [7, 1, 1, 1], vec![b])]);
        assert_eq!(spec.key.base.variant, Variant::Plain);
    }

    #[test]
    fn test_mul_mv_float_rows() {
        let x = leaf("x", DataType::F32, [4096, 1, 1, 1]);
        let w = leaf("w", DataType::F16, [4096, 64, 1, 1]);
        let spec = one(&[node(Op::MulMat, DataType::F32, [64, 1, 1, 1], vec![w, x])]);
        assert_eq!(spec.key.base.family, KernelFamily::MulMv);
        assert_eq!(spec.key.base.variant, Variant::Vec4);
        assert_eq!(spec.key.constants.get(slots::MUL_MV), Some(ConstValue::I16(4)));
        assert_eq!((spec.meta.nsg, spec.meta.nr0, spec.meta.smem), (4, 2, 256));

        let x = leaf("x", DataType::F32, [16, 1, 1, 1]);
        let w = leaf("w", DataType::F32, [16, 64, 1, 1]);
        let spec = one(&[node(Op::MulMat, DataType::F32, [64, 1, 1, 1], vec![w, x])]);
        assert_eq!(spec.key.base.variant, Variant::Short);
        assert_eq!((spec.meta.nsg, spec.meta.nr0), (1, 32));
    }

    #[test]
    fn test_mul_mv_quantized_rows() {
        let x = leaf("x", DataType::F32, [256, 1, 1, 1]);
        let w = leaf("w", DataType::Q8_0, [256, 64, 1, 1]);
        let spec = one(&[node(Op::MulMat, DataType::F32, [64, 1, 1, 1], vec![w, x])]);
        assert_eq!((spec.meta.nsg, spec.meta.nr0, spec.meta.smem), (4, 2, 256));

        let x = leaf("x", DataType::F32, [256, 1, 1, 1]);
        let w = leaf("w", DataType::I32, [256, 64, 1, 1]);
        assert!(derive_kernels(&[node(Op::MulMat, DataType::F32, [64, 1, 1, 1], vec![w, x])]).is_err());
    }

    #[test]
    fn test_mul_mm_bounds_checks() {
        let x = leaf("x", DataType::F32, [128, 32, 1, 1]);
        let w = leaf("w", DataType::F16, [128, 64, 1, 1]);
        let spec = one(&[node(Op::MulMat, DataType::F32, [64, 32, 1, 1], vec![w, x])]);
        assert_eq!(spec.key.base.family, KernelFamily::MulMm);
        assert_eq!(spec.key.constants.get(slots::MUL_MM), Some(ConstValue::Bool(false)));
        assert_eq!(spec.key.constants.get(slots::MUL_MM + 1), Some(ConstValue::Bool(false)));
        assert_eq!(spec.meta.smem, 6144);

        let x = leaf("x", DataType::F32, [100, 20, 1, 1]);
        let w = leaf("w", DataType::F16, [100, 64, 1, 1]);
        let spec = one(&[node(Op::MulMat, DataType::F32, [64, 20, 1, 1], vec![w, x])]);
        assert_eq!(spec.key.constants.get(slots::MUL_MM), Some(ConstValue::Bool(true)));
        assert_eq!(spec.key.constants.get(slots::MUL_MM + 1), Some(ConstValue::Bool(true)));
        assert_eq!(spec.meta.smem, 8192);
    }

    #[test]
    fn test_mul_mv_ext_small_batch() {
        let x = leaf("x", DataType::F32, [256, 2, 1, 1]);
        let w = leaf("w", DataType::Q4_0, [256, 64, 1, 1]);
        let spec = one(&[node(Op::MulMat, DataType::F32, [64, 2, 1, 1], vec![w, x])]);
        assert_eq!(spec.key.base.family, KernelFamily::MulMvExt);
        assert_eq!(spec.key.base.params, vec![2]);
        assert_eq!(spec.key.constants.get(slots::MUL_MV + 1), Some(ConstValue::I16(16)));
    }

    #[test]
    fn test_mul_mat_id_paths() {
        let w = leaf("w", DataType::F16, [128, 64, 8, 1]);
        let x = leaf("x", DataType::F32, [128, 2, 40, 1]);
        let ids = leaf("ids", DataType::I32, [2, 40, 1, 1]);
        let specs = derive_kernels(&[node(Op::MulMatId, DataType::F32, [64, 2, 40, 1], vec![w.clone(), x, ids])])
            .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].key.base.family, KernelFamily::MulMmIdMap0);
        assert_eq!(specs[0].meta.smem, 8 * 2 * 2);
        assert_eq!(specs[1].meta.smem, 8192);

        let x = leaf("x", DataType::F32, [128, 2, 4, 1]);
        let ids = leaf("ids", DataType::I32, [2, 4, 1, 1]);
        let spec = one(&[node(Op::MulMatId, DataType::F32, [64, 2, 4, 1], vec![w, x, ids])]);
        assert_eq!(spec.key.base.family, KernelFamily::MulMvId);
    }

    #[test]
    fn test_flash_attn_kernels() {
        let op = Op::FlashAttnExt {
            scale: 0.125,
            max_bias: 0.0,
            softcap: 0.0,
        };
        let q = leaf("q", DataType::F32, [64, 40, 4, 1]);
        let k = leaf("k", DataType::F16, [64, 100, 4, 1]);
        let v = leaf("v", DataType::F16, [64, 100, 4, 1]);
        let mask = leaf("m", DataType::F16, [100, 40, 1, 1]);
        let specs = derive_kernels(&[node(op, DataType::F32, [64, 4, 40, 1], vec![q, k, v, mask])]).unwrap();
        let families: Vec<_> = specs.iter().map(|s| s.key.base.family).collect();
        assert_eq!(
            families,
            [KernelFamily::FlashAttnExtPad, KernelFamily::FlashAttnExtBlk, KernelFamily::FlashAttnExt]
        );
        let main = &specs[2].key;
        assert_eq!(main.base.params, vec![64, 64]);
        assert_eq!(main.constants.get(slots::FLASH_ATTN_EXT), Some(ConstValue::Bool(true)));
        assert_eq!(main.constants.get(slots::FLASH_ATTN_EXT + 4), Some(ConstValue::Bool(true)));
        assert_eq!(main.constants.get(slots::FLASH_ATTN_EXT + 20), Some(ConstValue::I32(64)));

        let q = leaf("q", DataType::F32, [64, 1, 4, 1]);
        let k = leaf("k", DataType::F16, [64, 64, 4, 1]);
        let v = leaf("v", DataType::F16, [64, 64, 4, 1]);
        let specs = derive_kernels(&[node(op, DataType::F32, [64, 4, 1, 1], vec![q, k, v])]).unwrap();
        let families: Vec<_> = specs.iter().map(|s| s.key.base.family).collect();
        assert_eq!(families, [KernelFamily::FlashAttnExtVec, KernelFamily::FlashAttnExtVecReduce]);
    }

    #[test]
    fn test_fused_norm_and_binary() {
        let x = leaf("x", DataType::F32, [64, 4, 1, 1]);
        let w = leaf("w", DataType::F32, [64, 1, 1, 1]);
        let n = node(Op::RmsNorm { eps: 1e-6 }, DataType::F32, [64, 4, 1, 1], vec![x.clone()]);
        let m = node(Op::Mul, DataType::F32, [64, 4, 1, 1], vec![n.clone(), w.clone()]);
        let a = node(Op::Add, DataType::F32, [64, 4, 1, 1], vec![m.clone(), w.clone()]);
        let spec = one(&[n, m, a]);
        assert_eq!(spec.key.base.to_string(), "kernel_rms_norm_3_4");
        let norms: [TensorRef; 4] =
            std::array::from_fn(|_| node(Op::Norm { eps: 0.0 }, DataType::F32, [64, 4, 1, 1], vec![x.clone()]));
        assert!(derive_kernels(&norms).is_err());

        let add = node(Op::Add, DataType::F32, [64, 4, 1, 1], vec![x, w]);
        let spec = one(&[add.clone(), add]);
        assert_eq!(spec.key.base.variant, Variant::Row);
        assert_eq!(spec.key.base.params, vec![2]);
    }

    #[test]
    fn test_misc_families() {
        let x = leaf("x", DataType::F32, [10, 3, 1, 1]);
        let spec = one(&[node(Op::Argsort { order: SortOrder::Desc }, DataType::I32, [10, 3, 1, 1], vec![x.clone()])]);
        assert_eq!(spec.key.base.family, KernelFamily::Argsort(SortOrder::Desc));
        assert_eq!(spec.key.base.types, vec![DataType::F32, DataType::I32]);

        let spec = one(&[node(Op::Argmax, DataType::I32, [3, 1, 1, 1], vec![x.clone()])]);
        assert_eq!(spec.meta.smem, 32 * 8);

        let spec = one(&[node(Op::SsmScan, DataType::F32, [10, 3, 1, 1], vec![x.clone()])]);
        assert_eq!(spec.meta.nsg, 1);
        assert_eq!(spec.meta.smem, 128);

        let odd = leaf("odd", DataType::F32, [10, 3, 1, 1]);
        assert!(derive_kernels(&[node(Op::L2Norm { eps: 1e-6 }, DataType::F32, [10, 3, 1, 1], vec![odd])]).is_err());
        assert!(derive_kernels(&[node(Op::Transpose, DataType::F32, [3, 10, 1, 1], vec![x])]).is_err());
    }

    #[derive(Debug, Default)]
    struct CountingCompiler {
        compiles: std::sync::atomic::AtomicUsize,
    }

    #[derive(Debug)]
    struct Noop;

    impl crate::pipeline::CompiledKernel for Noop {
        fn launch(&self, _group: &[TensorRef], _access: &dyn crate::backends::common::TensorAccess) -> Result<()> {
            Ok(())
        }
    }

    impl KernelCompiler for CountingCompiler {
        fn name(&self) -> &str {
            "counting"
        }

        fn compile(&self, base: &KernelBase, _constants: &SpecConstants) -> Result<Arc<dyn crate::pipeline::CompiledKernel>> {
            self.compiles.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if base.family == KernelFamily::Log {
                return Err(BackendError::compile(base, "no source"));
            }
            Ok(Arc::new(Noop))
        }
    }

    fn unary(ne0: i64) -> TensorRef {
        let a = leaf("a", DataType::F32, [ne0, 1, 1, 1]);
        node(Op::Unary(UnaryOp::Relu), DataType::F32, [ne0, 1, 1, 1], vec![a])
    }

    #[test]
    fn test_library_caches_by_variant() {
        let compiler = Arc::new(CountingCompiler::default());
        let library = PipelineLibrary::new("GPU0", compiler.clone());

        let aligned = library.pipelines_for(&[unary(4096)]).unwrap();
        let again = library.pipelines_for(&[unary(4096)]).unwrap();
        assert!(Arc::ptr_eq(&aligned[0], &again[0]));
        assert_eq!(aligned[0].key().base.variant, Variant::Vec4);

        let unaligned = library.pipelines_for(&[unary(4097)]).unwrap();
        assert_eq!(unaligned[0].key().base.variant, Variant::Plain);
        assert_eq!(library.cache().len(), 2);
        assert_eq!(compiler.compiles.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(library.compiler().name(), "counting");
    }

    #[test]
    fn test_library_compile_failure_is_retried() {
        let compiler = Arc::new(CountingCompiler::default());
        let library = PipelineLibrary::new("GPU0", compiler.clone());
        let a = leaf("a", DataType::F32, [8, 1, 1, 1]);
        let log = node(Op::Log, DataType::F32, [8, 1, 1, 1], vec![a]);

        let err = library.pipelines_for(&[log.clone()]).unwrap_err();
        assert!(matches!(err, BackendError::Compile { .. }));
        assert!(library.pipelines_for(&[log]).is_err());
        assert!(library.cache().is_empty());
        assert_eq!(compiler.compiles.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_group_has_no_kernels() {
        assert!(derive_kernels(&[]).unwrap().is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn derived_keys_are_deterministic(ne00 in 1i64..2048, ne11 in 1i64..64) {
                let build = || {
                    let x = leaf("x", DataType::F32, [ne00, ne11, 1, 1]);
                    let w = leaf("w", DataType::F16, [ne00, 16, 1, 1]);
                    node(Op::MulMat, DataType::F32, [16, ne11, 1, 1], vec![w, x])
                };
                let a = derive_kernels(&[build()]).unwrap();
                let b = derive_kernels(&[build()]).unwrap();
                prop_assert_eq!(a, b);
            }

            #[test]
            fn matmul_selection_follows_batch(ne00 in 64i64..1024, ne11 in 1i64..64) {
                let x = leaf("x", DataType::F32, [ne00, ne11, 1, 1]);
                let w = leaf("w", DataType::F32, [ne00, 16, 1, 1]);
                let spec = one(&[node(Op::MulMat, DataType::F32, [16, ne11, 1, 1], vec![w, x])]);
                let family = spec.key.base.family;
                if ne11 > 8 {
                    prop_assert_eq!(family, KernelFamily::MulMm);
                } else if ne11 >= 2 && ne00 % 128 == 0 {
                    prop_assert_eq!(family, KernelFamily::MulMvExt);
                } else {
                    prop_assert_eq!(family, KernelFamily::MulMv);
                }
            }
        }
    }
}
