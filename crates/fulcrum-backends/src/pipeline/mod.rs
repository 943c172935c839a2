//! Kernel specialization for GPU-class devices
//!
//! A kernel is identified by a structured [`PipelineKey`]: the base kernel
//! (family, operand types, variant and baked parameters) plus typed
//! specialization constants. The per-device [`PipelineLibrary`] derives the
//! key for each operation, looks it up in its [`PipelineCache`], and invokes
//! the [`KernelCompiler`] on a miss.
//!
//! ```text
//! Tensor op ──derive──► KernelSpec { key, meta } ──cache──► Arc<Pipeline>
//!                                                   │ miss
//!                                                   └──► KernelCompiler::compile
//! ```

pub mod cache;
pub mod library;
pub mod tuning;

pub use cache::{CacheStats, PipelineCache};
pub use library::{derive_kernels, node_kernels, KernelSpec, PipelineLibrary};

use crate::backends::common::TensorAccess;
use crate::error::Result;
use crate::tensor::{DataType, GluOp, PoolOp, RopeMode, SortOrder, TensorRef, UnaryOp};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Specialization constants
// ============================================================================

/// Typed value of one specialization constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstValue {
    Bool(bool),
    I16(i16),
    I32(i32),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(v) => write!(f, "{}", *v as u8),
            ConstValue::I16(v) => write!(f, "{v}"),
            ConstValue::I32(v) => write!(f, "{v}"),
        }
    }
}

/// Ordered `(slot, value)` list handed to the compiler.
///
/// Setting a slot twice keeps the last value, so two lists built the same
/// way always compare and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SpecConstants {
    values: Vec<(u16, ConstValue)>,
}

impl SpecConstants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: u16, value: ConstValue) -> &mut Self {
        match self.values.iter_mut().find(|(s, _)| *s == slot) {
            Some(entry) => entry.1 = value,
            None => self.values.push((slot, value)),
        }
        self
    }

    pub fn with_bool(mut self, slot: u16, value: bool) -> Self {
        self.set(slot, ConstValue::Bool(value));
        self
    }

    pub fn with_i16(mut self, slot: u16, value: i16) -> Self {
        self.set(slot, ConstValue::I16(value));
        self
    }

    pub fn with_i32(mut self, slot: u16, value: i32) -> Self {
        self.set(slot, ConstValue::I32(value));
        self
    }

    pub fn get(&self, slot: u16) -> Option<ConstValue> {
        self.values.iter().find(|(s, _)| *s == slot).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, ConstValue)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Base kernels
// ============================================================================

/// Element-wise binary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub const fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
        }
    }
}

/// Kernel family with the discriminants that select distinct source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelFamily {
    Binary(BinaryOp),
    AddId,
    Concat,
    Scale,
    Clamp,
    Sqr,
    Sqrt,
    Sin,
    Cos,
    Log,
    LeakyRelu,
    Unary(UnaryOp),
    Glu(GluOp),
    Sum,
    SumRows,
    Mean,
    Cumsum,
    SoftMax,
    Norm,
    RmsNorm,
    L2Norm,
    GroupNorm,
    MulMv,
    MulMvExt,
    MulMm,
    MulMvId,
    MulMmId,
    MulMmIdMap0,
    FlashAttnExt,
    FlashAttnExtVec,
    FlashAttnExtVecReduce,
    FlashAttnExtPad,
    FlashAttnExtBlk,
    Cpy,
    GetRows,
    SetRows,
    Repeat,
    Argmax,
    Argsort(SortOrder),
    TopK,
    SsmConv,
    SsmScan,
    RwkvWkv6,
    RwkvWkv7,
    Rope(RopeMode),
    Im2col,
    ConvTranspose1d,
    ConvTranspose2d,
    Upscale,
    Pad,
    PadReflect1d,
    Arange,
    TimestepEmbedding,
    OptStepAdamw,
    OptStepSgd,
    Pool2d(PoolOp),
}

impl KernelFamily {
    pub fn name(&self) -> String {
        match self {
            KernelFamily::Binary(op) => op.name().to_string(),
            KernelFamily::Unary(op) => op.name().to_string(),
            KernelFamily::Glu(op) => op.name().to_string(),
            KernelFamily::Argsort(order) => format!("argsort_{}", order.name()),
            KernelFamily::Rope(mode) => format!("rope_{}", mode.name()),
            KernelFamily::Pool2d(op) => format!("pool_2d_{}", op.name()),
            other => {
                let debug = format!("{other:?}");
                snake_case(&debug)
            }
        }
    }

    /// Helper kernels that only stage data for a main kernel.
    pub fn is_auxiliary(&self) -> bool {
        matches!(
            self,
            KernelFamily::MulMmIdMap0
                | KernelFamily::FlashAttnExtPad
                | KernelFamily::FlashAttnExtBlk
                | KernelFamily::FlashAttnExtVecReduce
        )
    }
}

fn snake_case(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for (i, c) in camel.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Code-shape variant within a family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Variant {
    #[default]
    Plain,
    /// Four elements per thread
    Vec4,
    /// Rows shorter than a simdgroup
    Short,
    /// Broadcast of a single row across the first operand
    Row,
}

/// Identity of the kernel source to compile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelBase {
    pub family: KernelFamily,
    /// Operand types that select the source, in family-defined order
    pub types: Vec<DataType>,
    pub variant: Variant,
    /// Integers baked into the source (head sizes, fuse counts, batch tiles)
    pub params: Vec<i32>,
}

impl KernelBase {
    pub fn new(family: KernelFamily) -> Self {
        Self {
            family,
            types: Vec::new(),
            variant: Variant::Plain,
            params: Vec::new(),
        }
    }

    pub fn with_types(mut self, types: &[DataType]) -> Self {
        self.types.extend_from_slice(types);
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_param(mut self, param: i32) -> Self {
        self.params.push(param);
        self
    }
}

impl fmt::Display for KernelBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel_{}", self.family.name())?;
        for ty in &self.types {
            write!(f, "_{}", ty.name())?;
        }
        for p in &self.params {
            write!(f, "_{p}")?;
        }
        match self.variant {
            Variant::Plain => Ok(()),
            Variant::Vec4 => f.write_str("_4"),
            Variant::Short => f.write_str("_short"),
            Variant::Row => f.write_str("_row"),
        }
    }
}

/// Cache key: base kernel plus specialization constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub base: KernelBase,
    pub constants: SpecConstants,
}

impl PipelineKey {
    pub fn new(base: KernelBase, constants: SpecConstants) -> Self {
        Self { base, constants }
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for (slot, value) in self.constants.iter() {
            write!(f, " fc{slot}={value}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Compiled pipelines
// ============================================================================

/// Execution metadata attached to a pipeline when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineMeta {
    /// Threadgroup memory per invocation, in bytes
    pub smem: usize,
    /// src0 rows per simdgroup
    pub nr0: i32,
    /// src1 rows per threadgroup
    pub nr1: i32,
    /// Simdgroups per threadgroup
    pub nsg: i32,
}

impl Default for PipelineMeta {
    fn default() -> Self {
        Self {
            smem: 0,
            nr0: 1,
            nr1: 1,
            nsg: 1,
        }
    }
}

impl PipelineMeta {
    pub fn with_smem(smem: usize) -> Self {
        Self { smem, ..Self::default() }
    }
}

/// Executable produced by a [`KernelCompiler`].
///
/// `group` is the fused node run the dispatch covers, last node being the
/// output; operands are reached through `access`.
pub trait CompiledKernel: Send + Sync + fmt::Debug {
    fn launch(&self, group: &[TensorRef], access: &dyn TensorAccess) -> Result<()>;
}

/// Compile oracle: kernel source plus constants in, executable out.
pub trait KernelCompiler: Send + Sync + fmt::Debug {
    /// Short identifier reported as a backend feature.
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// [`crate::BackendError::Compile`] when the kernel cannot be built.
    fn compile(&self, base: &KernelBase, constants: &SpecConstants) -> Result<Arc<dyn CompiledKernel>>;
}

/// Immutable compiled kernel shared by every dispatch with the same key.
#[derive(Debug)]
pub struct Pipeline {
    key: PipelineKey,
    meta: PipelineMeta,
    kernel: Arc<dyn CompiledKernel>,
}

impl Pipeline {
    pub fn new(key: PipelineKey, meta: PipelineMeta, kernel: Arc<dyn CompiledKernel>) -> Self {
        Self { key, meta, kernel }
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn meta(&self) -> PipelineMeta {
        self.meta
    }

    pub fn smem(&self) -> usize {
        self.meta.smem
    }

    pub fn kernel(&self) -> &dyn CompiledKernel {
        self.kernel.as_ref()
    }
}
