//! Dispatch planning
//!
//! Turns a graph's node list into dispatches: view and no-op nodes are
//! dropped, fusible runs are grouped, and each kernel of a group gets its
//! launch geometry.
//!
//! Two fusion patterns are recognised:
//! - `norm`/`rms_norm` followed by `mul` then `add`, each consuming the
//!   previous result (up to 3 nodes)
//! - successive nodes of the same binary op, each consuming the previous
//!   result and keeping its shape (up to 8 nodes)

use crate::backend::{BlockDim, GridDim, LaunchConfig};
use crate::pipeline::tuning::{slots, SIMD_WIDTH};
use crate::pipeline::{ConstValue, KernelFamily, Pipeline, Variant};
use crate::tensor::{DataType, Op, Tensor, TensorRef};
use std::sync::Arc;

pub const MAX_FUSED_NORM: usize = 3;
pub const MAX_FUSED_BINARY: usize = 8;

/// Threads per group for element-wise kernels.
const ELEMENTWISE_THREADS: u32 = 256;
const MAX_THREADS_PER_GROUP: i64 = 1024;

/// Group the non-empty nodes of `nodes` into dispatch units.
pub fn fuse(nodes: &[TensorRef], use_fusion: bool) -> Vec<Vec<TensorRef>> {
    let nodes: Vec<&TensorRef> = nodes.iter().filter(|n| !n.op().is_empty()).collect();
    let mut groups = Vec::with_capacity(nodes.len());
    let mut i = 0;
    while i < nodes.len() {
        let n = if use_fusion { chain_len(&nodes[i..]) } else { 1 };
        groups.push(nodes[i..i + n].iter().map(|&node| Arc::clone(node)).collect());
        i += n;
    }
    groups
}

/// `next` reads `prev` as its first operand.
fn consumes(next: &Tensor, prev: &TensorRef) -> bool {
    next.src(0).is_some_and(|s| Arc::ptr_eq(s, prev))
}

/// f32 binary node whose second operand broadcasts.
fn fusible_binary(node: &Tensor) -> bool {
    node.dtype() == DataType::F32
        && node.srcs().all(|s| s.dtype() == DataType::F32)
        && node.src(1).is_some_and(|b| node.can_repeat_from(b))
}

fn chain_len(nodes: &[&TensorRef]) -> usize {
    let head = nodes[0];
    match head.op() {
        Op::Norm { .. } | Op::RmsNorm { .. } => {
            let tail = [Op::Mul, Op::Add];
            let mut n = 1;
            for (next, want) in nodes[1..].iter().zip(tail) {
                if *next.op() != want || !consumes(next, nodes[n - 1]) || !fusible_binary(next) {
                    break;
                }
                n += 1;
            }
            n.min(MAX_FUSED_NORM)
        }
        op if op.is_binary() => {
            let mut n = 1;
            while n < nodes.len().min(MAX_FUSED_BINARY) {
                let next = nodes[n];
                if next.op() != op || !consumes(next, nodes[n - 1]) || !next.same_shape(head) || !fusible_binary(next) {
                    break;
                }
                n += 1;
            }
            n
        }
        _ => 1,
    }
}

// ============================================================================
// Launch geometry
// ============================================================================

fn dim(v: i64) -> u32 {
    v.clamp(1, u32::MAX as i64) as u32
}

fn div_ceil(a: i64, b: i64) -> i64 {
    (a + b - 1) / b.max(1)
}

/// Grid, threadgroup and threadgroup memory for `pipeline` writing `out`.
pub fn launch_config(pipeline: &Pipeline, out: &Tensor) -> LaunchConfig {
    let base = &pipeline.key().base;
    let meta = pipeline.meta();
    let ne = out.ne();
    let smem = meta.smem;
    let nsg = meta.nsg.max(1) as i64;
    let simd = SIMD_WIDTH as i64;

    let (grid, block) = match base.family {
        KernelFamily::MulMv | KernelFamily::MulMvId => (
            GridDim::new(
                dim(div_ceil(ne[0], meta.nr0 as i64 * nsg)),
                dim(div_ceil(ne[1], meta.nr1 as i64)),
                dim(ne[2] * ne[3]),
            ),
            BlockDim::new(SIMD_WIDTH as u32, dim(nsg), 1),
        ),
        KernelFamily::MulMvExt => {
            let nxpsg = match pipeline.key().constants.get(slots::MUL_MV + 1) {
                Some(ConstValue::I16(v)) => v as i64,
                _ => 8,
            };
            let r0ptg = (simd / nxpsg) * nsg;
            (
                GridDim::new(
                    dim(div_ceil(ne[0], r0ptg)),
                    dim(div_ceil(ne[1], meta.nr1 as i64)),
                    dim(ne[2] * ne[3]),
                ),
                BlockDim::new(SIMD_WIDTH as u32, dim(nsg), 1),
            )
        }
        KernelFamily::MulMm | KernelFamily::MulMmId => (
            GridDim::new(dim(div_ceil(ne[1], 32)), dim(div_ceil(ne[0], 64)), dim(ne[2] * ne[3])),
            BlockDim::linear(128),
        ),
        // output is [dv, heads, queries, batch]
        KernelFamily::FlashAttnExt => (
            GridDim::new(dim(div_ceil(ne[2], 8)), dim(ne[1]), dim(ne[3])),
            BlockDim::new(SIMD_WIDTH as u32, dim(nsg), 1),
        ),
        KernelFamily::FlashAttnExtVec => {
            let nwg = match pipeline.key().constants.get(slots::FLASH_ATTN_EXT_VEC + 23) {
                Some(ConstValue::I32(v)) => v as i64,
                _ => 1,
            };
            (
                GridDim::new(dim(ne[2]), dim(ne[1]), dim(ne[3] * nwg)),
                BlockDim::new(SIMD_WIDTH as u32, dim(nsg), 1),
            )
        }
        _ if smem > 0 => {
            // one threadgroup per row, lanes striding the row
            let width = if base.variant == Variant::Vec4 { ne[0] / 4 } else { ne[0] };
            let nth = (div_ceil(width, simd) * simd).clamp(simd, MAX_THREADS_PER_GROUP);
            (GridDim::new(dim(out.nrows()), 1, 1), BlockDim::linear(dim(nth)))
        }
        _ => {
            let n = if base.variant == Variant::Vec4 {
                out.nelements() / 4
            } else {
                out.nelements()
            };
            let linear = LaunchConfig::linear(dim(n), ELEMENTWISE_THREADS);
            (linear.grid, linear.block)
        }
    };
    LaunchConfig::new(grid, block, smem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{KernelBase, KernelCompiler, PipelineKey, PipelineMeta, SpecConstants};
    use crate::backends::gpu::compiler::ReferenceCompiler;

    fn leaf(name: &str, ne: [i64; 4]) -> TensorRef {
        Tensor::new(name, DataType::F32, ne).into_ref()
    }

    fn node(name: &str, op: Op, ne: [i64; 4], srcs: Vec<TensorRef>) -> TensorRef {
        Tensor::with_op(name, op, DataType::F32, ne, srcs.into_iter().map(Some).collect()).into_ref()
    }

    fn names(groups: &[Vec<TensorRef>]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| g.iter().map(|n| n.name().to_string()).collect())
            .collect()
    }

    #[test]
    fn test_norm_mul_add_chain() {
        let ne = [16, 4, 1, 1];
        let x = leaf("x", ne);
        let w = leaf("w", [16, 1, 1, 1]);
        let b = leaf("b", [16, 1, 1, 1]);
        let norm = node("norm", Op::RmsNorm { eps: 1e-6 }, ne, vec![x]);
        let mul = node("mul", Op::Mul, ne, vec![norm.clone(), w]);
        let add = node("add", Op::Add, ne, vec![mul.clone(), b]);
        let relu = node("relu", Op::Unary(crate::tensor::UnaryOp::Relu), ne, vec![add.clone()]);
        let nodes = vec![norm, mul, add, relu];

        assert_eq!(
            names(&fuse(&nodes, true)),
            vec![vec!["norm", "mul", "add"], vec!["relu"]]
        );
        assert_eq!(fuse(&nodes, false).len(), 4);
    }

    #[test]
    fn test_binary_runs_stop_at_eight() {
        let ne = [8, 2, 1, 1];
        let mut prev = leaf("x", ne);
        let mut nodes = Vec::new();
        for i in 0..10 {
            let next = node(&format!("add{i}"), Op::Add, ne, vec![prev, leaf("c", ne)]);
            nodes.push(next.clone());
            prev = next;
        }
        let groups = fuse(&nodes, true);
        assert_eq!(groups.iter().map(Vec::len).collect::<Vec<_>>(), [8, 2]);
    }

    #[test]
    fn test_no_fusion_across_unrelated_nodes() {
        let ne = [8, 2, 1, 1];
        let a = node("a", Op::Add, ne, vec![leaf("x", ne), leaf("y", ne)]);
        // second add does not read the first
        let b = node("b", Op::Add, ne, vec![leaf("z", ne), leaf("w", ne)]);
        let c = node("c", Op::Mul, ne, vec![b.clone(), leaf("v", ne)]);
        let view = node("view", Op::View, ne, vec![c.clone()]);
        assert_eq!(
            names(&fuse(&[a, b, c, view], true)),
            vec![vec!["a"], vec!["b"], vec!["c"]]
        );
    }

    fn pipeline(base: KernelBase, constants: SpecConstants, meta: PipelineMeta) -> Pipeline {
        let kernel = ReferenceCompiler::new().compile(&KernelBase::new(KernelFamily::MulMmIdMap0), &constants).unwrap();
        Pipeline::new(PipelineKey::new(base, constants), meta, kernel)
    }

    #[test]
    fn test_mul_mv_geometry() {
        let out = Tensor::new("out", DataType::F32, [4096, 1, 1, 1]);
        let p = pipeline(
            KernelBase::new(KernelFamily::MulMv),
            SpecConstants::new(),
            PipelineMeta {
                smem: 256,
                nr0: 2,
                nr1: 1,
                nsg: 4,
            },
        );
        let cfg = launch_config(&p, &out);
        assert_eq!(cfg.grid, GridDim::new(512, 1, 1));
        assert_eq!(cfg.block, BlockDim::new(32, 4, 1));
        assert_eq!(cfg.shared_memory, 256);
    }

    #[test]
    fn test_elementwise_and_reduction_geometry() {
        let out = Tensor::new("out", DataType::F32, [1000, 3, 1, 1]);
        let p = pipeline(KernelBase::new(KernelFamily::Sqr), SpecConstants::new(), PipelineMeta::default());
        let cfg = launch_config(&p, &out);
        assert_eq!(cfg.grid.x, 12);
        assert_eq!(cfg.block.x, 256);

        let p = pipeline(
            KernelBase::new(KernelFamily::SoftMax).with_variant(Variant::Vec4),
            SpecConstants::new(),
            PipelineMeta::with_smem(128),
        );
        let cfg = launch_config(&p, &out);
        assert_eq!(cfg.grid.x, 3);
        assert_eq!(cfg.block.x, 256);
    }
}
