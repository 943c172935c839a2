//! Reference compile oracle
//!
//! Stands in for a shader compiler: a kernel "compiles" when a reference
//! forward exists for its family and every operand type is `f32` or `i32`.
//! The resulting executable runs the forward for each node of the fused
//! group, in order, against device memory. Staging kernels (padding, mask
//! blocks, expert maps, partial reduces) have no observable output of their
//! own and compile to no-ops.

use crate::backends::common::TensorAccess;
use crate::backends::cpu::ops;
use crate::error::{BackendError, Result};
use crate::pipeline::{CompiledKernel, KernelBase, KernelCompiler, KernelFamily, SpecConstants};
use crate::tensor::{DataType, GluOp, TensorRef};
use std::sync::Arc;

pub const REFERENCE_COMPILER: &str = "reference";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceCompiler;

impl ReferenceCompiler {
    pub fn new() -> Self {
        Self
    }
}

/// Families with a reference forward.
fn has_reference(family: KernelFamily) -> bool {
    matches!(
        family,
        KernelFamily::Binary(_)
            | KernelFamily::Scale
            | KernelFamily::Clamp
            | KernelFamily::Sqr
            | KernelFamily::Sqrt
            | KernelFamily::Sin
            | KernelFamily::Cos
            | KernelFamily::Log
            | KernelFamily::LeakyRelu
            | KernelFamily::Unary(_)
            | KernelFamily::Sum
            | KernelFamily::SumRows
            | KernelFamily::Mean
            | KernelFamily::Cumsum
            | KernelFamily::SoftMax
            | KernelFamily::Norm
            | KernelFamily::RmsNorm
            | KernelFamily::L2Norm
            | KernelFamily::MulMv
            | KernelFamily::MulMvExt
            | KernelFamily::MulMm
            | KernelFamily::Cpy
            | KernelFamily::GetRows
            | KernelFamily::Repeat
            | KernelFamily::Concat
            | KernelFamily::Argmax
            | KernelFamily::Argsort(_)
            | KernelFamily::TopK
    ) || matches!(family, KernelFamily::Glu(op) if op != GluOp::SwigluOai)
}

impl KernelCompiler for ReferenceCompiler {
    fn name(&self) -> &str {
        REFERENCE_COMPILER
    }

    fn compile(&self, base: &KernelBase, _constants: &SpecConstants) -> Result<Arc<dyn CompiledKernel>> {
        if base.family.is_auxiliary() {
            return Ok(Arc::new(StagingKernel { name: base.to_string() }));
        }
        if !has_reference(base.family) {
            return Err(BackendError::compile(base, "no reference implementation for this family"));
        }
        if let Some(ty) = base.types.iter().find(|ty| !matches!(ty, DataType::F32 | DataType::I32)) {
            return Err(BackendError::compile(base, format!("no reference implementation for {ty}")));
        }
        Ok(Arc::new(ReferenceKernel { name: base.to_string() }))
    }
}

/// Runs the reference forward of every node in the group.
#[derive(Debug)]
struct ReferenceKernel {
    name: String,
}

impl CompiledKernel for ReferenceKernel {
    fn launch(&self, group: &[TensorRef], access: &dyn TensorAccess) -> Result<()> {
        for node in group {
            ops::forward(node, access).map_err(|err| {
                BackendError::execution_error(format!("{} on node {}: {err}", self.name, node.name()))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StagingKernel {
    name: String,
}

impl CompiledKernel for StagingKernel {
    fn launch(&self, _group: &[TensorRef], _access: &dyn TensorAccess) -> Result<()> {
        tracing::trace!(kernel = %self.name, "staging kernel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::common::HostAccess;
    use crate::pipeline::{BinaryOp, Variant};
    use crate::tensor::UnaryOp;

    #[test]
    fn test_compiles_reference_families() {
        let compiler = ReferenceCompiler::new();
        let base = KernelBase::new(KernelFamily::Unary(UnaryOp::Gelu))
            .with_types(&[DataType::F32])
            .with_variant(Variant::Vec4);
        assert!(compiler.compile(&base, &SpecConstants::new()).is_ok());

        let base = KernelBase::new(KernelFamily::Binary(BinaryOp::Add)).with_param(3);
        assert!(compiler.compile(&base, &SpecConstants::new()).is_ok());
    }

    #[test]
    fn test_rejects_quantized_and_unknown() {
        let compiler = ReferenceCompiler::new();
        let base = KernelBase::new(KernelFamily::MulMv).with_types(&[DataType::Q4_0, DataType::F32]);
        let err = compiler.compile(&base, &SpecConstants::new()).unwrap_err();
        assert!(matches!(err, BackendError::Compile { .. }));
        assert!(err.to_string().contains("q4_0"));

        let base = KernelBase::new(KernelFamily::Im2col).with_types(&[DataType::F32]);
        assert!(compiler.compile(&base, &SpecConstants::new()).is_err());

        let base = KernelBase::new(KernelFamily::Glu(GluOp::SwigluOai)).with_types(&[DataType::F32]);
        assert!(compiler.compile(&base, &SpecConstants::new()).is_err());
    }

    #[test]
    fn test_staging_kernels_are_noops() {
        let kernel = ReferenceCompiler::new()
            .compile(&KernelBase::new(KernelFamily::FlashAttnExtPad), &SpecConstants::new())
            .unwrap();
        assert!(kernel.launch(&[], &HostAccess).is_ok());
    }
}
