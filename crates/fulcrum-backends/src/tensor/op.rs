//! Tensor operations and their parameters

use std::fmt;

/// Element-wise activation applied by [`Op::Unary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Sgn,
    Neg,
    Step,
    Tanh,
    Elu,
    Relu,
    Sigmoid,
    Gelu,
    GeluErf,
    GeluQuick,
    Silu,
    Hardswish,
    Hardsigmoid,
    Exp,
}

impl UnaryOp {
    pub const fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "abs",
            UnaryOp::Sgn => "sgn",
            UnaryOp::Neg => "neg",
            UnaryOp::Step => "step",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Elu => "elu",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Gelu => "gelu",
            UnaryOp::GeluErf => "gelu_erf",
            UnaryOp::GeluQuick => "gelu_quick",
            UnaryOp::Silu => "silu",
            UnaryOp::Hardswish => "hardswish",
            UnaryOp::Hardsigmoid => "hardsigmoid",
            UnaryOp::Exp => "exp",
        }
    }
}

/// Gated linear unit variant applied by [`Op::Glu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GluOp {
    Reglu,
    Geglu,
    Swiglu,
    SwigluOai,
    GegluErf,
    GegluQuick,
}

impl GluOp {
    pub const fn name(self) -> &'static str {
        match self {
            GluOp::Reglu => "reglu",
            GluOp::Geglu => "geglu",
            GluOp::Swiglu => "swiglu",
            GluOp::SwigluOai => "swiglu_oai",
            GluOp::GegluErf => "geglu_erf",
            GluOp::GegluQuick => "geglu_quick",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub const fn name(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Rotary embedding layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RopeMode {
    Norm,
    Neox,
    Multi,
    Vision,
}

impl RopeMode {
    pub const fn name(self) -> &'static str {
        match self {
            RopeMode::Norm => "norm",
            RopeMode::Neox => "neox",
            RopeMode::Multi => "multi",
            RopeMode::Vision => "vision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolOp {
    Avg,
    Max,
}

impl PoolOp {
    pub const fn name(self) -> &'static str {
        match self {
            PoolOp::Avg => "avg",
            PoolOp::Max => "max",
        }
    }
}

/// The operation producing a tensor, with its parameters.
///
/// Source operands are positional and live on the tensor itself; the
/// position of each operand follows the conventional layout (for `MulMat`,
/// `src0` is the weight matrix and `src1` the activations; for
/// `FlashAttnExt`, q, k, v, optional mask, optional sinks).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Leaf tensor, no computation.
    None,
    Dup,
    Add,
    AddId,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Sin,
    Cos,
    Sum,
    SumRows,
    Mean,
    Cumsum,
    Argmax,
    Repeat,
    Concat { dim: usize },
    Norm { eps: f32 },
    RmsNorm { eps: f32 },
    L2Norm { eps: f32 },
    GroupNorm { groups: u32, eps: f32 },
    MulMat,
    MulMatId,
    Scale { scale: f32, bias: f32 },
    Clamp { min: f32, max: f32 },
    LeakyRelu { slope: f32 },
    Cpy,
    Reshape,
    View,
    Permute,
    Transpose,
    GetRows,
    SetRows,
    SoftMax { scale: f32, max_bias: f32 },
    Rope { mode: RopeMode, n_dims: u32 },
    Im2col,
    ConvTranspose1d,
    ConvTranspose2d,
    Pool2d { op: PoolOp },
    Upscale,
    Pad,
    PadReflect1d,
    Arange,
    TimestepEmbedding,
    Argsort { order: SortOrder },
    TopK { k: u32 },
    FlashAttnExt { scale: f32, max_bias: f32, softcap: f32 },
    SsmConv,
    SsmScan,
    RwkvWkv6,
    RwkvWkv7,
    OptStepAdamw,
    OptStepSgd,
    Unary(UnaryOp),
    Glu { op: GluOp, swapped: bool },
}

impl Op {
    /// Short lower-case name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Dup => "dup",
            Op::Add => "add",
            Op::AddId => "add_id",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Sqr => "sqr",
            Op::Sqrt => "sqrt",
            Op::Log => "log",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Sum => "sum",
            Op::SumRows => "sum_rows",
            Op::Mean => "mean",
            Op::Cumsum => "cumsum",
            Op::Argmax => "argmax",
            Op::Repeat => "repeat",
            Op::Concat { .. } => "concat",
            Op::Norm { .. } => "norm",
            Op::RmsNorm { .. } => "rms_norm",
            Op::L2Norm { .. } => "l2_norm",
            Op::GroupNorm { .. } => "group_norm",
            Op::MulMat => "mul_mat",
            Op::MulMatId => "mul_mat_id",
            Op::Scale { .. } => "scale",
            Op::Clamp { .. } => "clamp",
            Op::LeakyRelu { .. } => "leaky_relu",
            Op::Cpy => "cpy",
            Op::Reshape => "reshape",
            Op::View => "view",
            Op::Permute => "permute",
            Op::Transpose => "transpose",
            Op::GetRows => "get_rows",
            Op::SetRows => "set_rows",
            Op::SoftMax { .. } => "soft_max",
            Op::Rope { .. } => "rope",
            Op::Im2col => "im2col",
            Op::ConvTranspose1d => "conv_transpose_1d",
            Op::ConvTranspose2d => "conv_transpose_2d",
            Op::Pool2d { .. } => "pool_2d",
            Op::Upscale => "upscale",
            Op::Pad => "pad",
            Op::PadReflect1d => "pad_reflect_1d",
            Op::Arange => "arange",
            Op::TimestepEmbedding => "timestep_embedding",
            Op::Argsort { .. } => "argsort",
            Op::TopK { .. } => "top_k",
            Op::FlashAttnExt { .. } => "flash_attn_ext",
            Op::SsmConv => "ssm_conv",
            Op::SsmScan => "ssm_scan",
            Op::RwkvWkv6 => "rwkv_wkv6",
            Op::RwkvWkv7 => "rwkv_wkv7",
            Op::OptStepAdamw => "opt_step_adamw",
            Op::OptStepSgd => "opt_step_sgd",
            Op::Unary(u) => u.name(),
            Op::Glu { op, .. } => op.name(),
        }
    }

    /// Ops that only reinterpret storage and never dispatch work.
    pub fn is_empty(&self) -> bool {
        matches!(self, Op::None | Op::Reshape | Op::View | Op::Permute | Op::Transpose)
    }

    /// add/sub/mul/div
    pub fn is_binary(&self) -> bool {
        matches!(self, Op::Add | Op::Sub | Op::Mul | Op::Div)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ops() {
        assert!(Op::View.is_empty());
        assert!(Op::None.is_empty());
        assert!(!Op::Add.is_empty());
        assert!(!Op::Unary(UnaryOp::Relu).is_empty());
    }

    #[test]
    fn test_names() {
        assert_eq!(Op::Unary(UnaryOp::GeluQuick).name(), "gelu_quick");
        assert_eq!(
            Op::Glu {
                op: GluOp::Swiglu,
                swapped: false
            }
            .to_string(),
            "swiglu"
        );
        assert_eq!(Op::Argsort { order: SortOrder::Desc }.name(), "argsort");
    }
}
