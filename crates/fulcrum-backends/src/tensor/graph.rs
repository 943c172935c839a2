//! Ordered node lists handed to `graph_compute`

use super::TensorRef;
use std::collections::HashSet;
use std::sync::Arc;

/// Nodes in dependency order. Leaves are not listed.
#[derive(Debug, Clone, Default)]
pub struct ComputeGraph {
    nodes: Vec<TensorRef>,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph from nodes already in dependency order.
    pub fn from_nodes(nodes: Vec<TensorRef>) -> Self {
        Self { nodes }
    }

    /// Collect every non-leaf ancestor of `outputs` in post-order.
    pub fn build_forward(outputs: &[TensorRef]) -> Self {
        let mut graph = Self::new();
        let mut visited = HashSet::new();
        for out in outputs {
            graph.visit(out, &mut visited);
        }
        graph
    }

    fn visit(&mut self, tensor: &TensorRef, visited: &mut HashSet<*const super::Tensor>) {
        if !visited.insert(Arc::as_ptr(tensor)) {
            return;
        }
        for src in tensor.srcs() {
            self.visit(src, visited);
        }
        if !matches!(tensor.op(), super::Op::None) {
            self.nodes.push(Arc::clone(tensor));
        }
    }

    pub fn push(&mut self, node: TensorRef) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[TensorRef] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
