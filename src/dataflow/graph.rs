//! The flow-node DAG of one transaction replay.
//!
//! Nodes live in an arena owned by the tracer; upstream edges are ids and
//! always point to strictly earlier nodes. Analyzers extend nodes through
//! the `ext` slot instead of subclassing.

use revm::primitives::{Address, B256, U256};

use crate::tracing::location::TraceLocation;
use crate::tracing::msg_call::CallId;
use crate::tracing::position::CallPosition;

pub type NodeId = u32;
pub type OpId = u32;

/// One executed operation: its trace location, owning call and the real
/// stack operands it popped (bottom-first).
#[derive(Debug, Clone)]
pub struct Operation {
    pub loc: TraceLocation,
    pub call: CallId,
    pub state_addr: Address,
    pub args: Vec<U256>,
}

impl Operation {
    pub fn op(&self) -> u8 {
        self.loc.op
    }

    pub fn pc(&self) -> u64 {
        self.loc.pc
    }

    pub fn index(&self) -> usize {
        self.loc.index
    }

    pub fn code_addr(&self) -> Address {
        self.loc.code_addr
    }

    pub fn position(&self) -> &CallPosition {
        &self.loc.position
    }

    /// The i-th popped operand counting from the top of the stack.
    pub fn arg(&self, i: usize) -> U256 {
        self.args[self.args.len() - 1 - i]
    }

    pub fn arg_b256(&self, i: usize) -> B256 {
        B256::from(self.arg(i))
    }

    pub fn arg_addr(&self, i: usize) -> Address {
        Address::from_slice(&self.arg(i).to_be_bytes::<32>()[12..])
    }

    pub fn id(&self) -> String {
        self.loc.id()
    }
}

/// Analyzer-specific extension of a flow node.
#[derive(Debug, Clone, Default)]
pub enum NodeExt {
    #[default]
    None,
    /// Storage-addressing nodes carry the operand (and, for hashes and
    /// additions, the ingredient) of the slot derivation, plus the
    /// positional argument nodes (untainted positions included) so the
    /// path walk can branch per operand assignment.
    Addressing {
        operand: Option<U256>,
        ingredient: Option<U256>,
        arg_nodes: Vec<Option<NodeId>>,
    },
    /// Taint nodes may additionally depend on a diverging control point.
    Control { control_from: Vec<NodeId> },
}

#[derive(Debug)]
pub struct FlowNodeData {
    pub label: &'static str,
    pub op: OpId,
    pub from: Vec<NodeId>,
    pub ext: NodeExt,
}

#[derive(Debug, Default)]
pub struct FlowGraph {
    pub nodes: Vec<FlowNodeData>,
    pub ops: Vec<Operation>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_op(&mut self, op: Operation) -> OpId {
        self.ops.push(op);
        (self.ops.len() - 1) as OpId
    }

    pub fn new_node(&mut self, label: &'static str, op: OpId, ext: NodeExt) -> NodeId {
        self.nodes.push(FlowNodeData { label, op, from: Vec::new(), ext });
        (self.nodes.len() - 1) as NodeId
    }

    pub fn node(&self, id: NodeId) -> &FlowNodeData {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut FlowNodeData {
        &mut self.nodes[id as usize]
    }

    pub fn operation(&self, node: NodeId) -> &Operation {
        &self.ops[self.node(node).op as usize]
    }

    pub fn op_of(&self, id: OpId) -> &Operation {
        &self.ops[id as usize]
    }

    pub fn add_upstream(&mut self, node: NodeId, upstream: impl IntoIterator<Item = NodeId>) {
        let data = self.node_mut(node);
        for up in upstream {
            if !data.from.contains(&up) {
                data.from.push(up);
            }
        }
    }

    pub fn add_upstream_opt(
        &mut self,
        node: NodeId,
        upstream: impl IntoIterator<Item = Option<NodeId>>,
    ) {
        self.add_upstream(node, upstream.into_iter().flatten());
    }

    pub fn add_control_upstream(&mut self, node: NodeId, control: NodeId) {
        match &mut self.node_mut(node).ext {
            NodeExt::Control { control_from } => {
                if !control_from.contains(&control) {
                    control_from.push(control);
                }
            }
            ext @ NodeExt::None => {
                *ext = NodeExt::Control { control_from: vec![control] };
            }
            NodeExt::Addressing { .. } => {}
        }
    }

    /// All upstream edges of a node: data flow plus control dependency.
    pub fn upstream(&self, node: NodeId) -> Vec<NodeId> {
        let data = self.node(node);
        let mut from = data.from.clone();
        if let NodeExt::Control { control_from } = &data.ext {
            for c in control_from {
                if !from.contains(c) {
                    from.push(*c);
                }
            }
        }
        from
    }

    pub fn set_addressing_operand(&mut self, node: NodeId, operand: U256) {
        match &mut self.node_mut(node).ext {
            NodeExt::Addressing { operand: slot, .. } => *slot = Some(operand),
            ext => {
                *ext = NodeExt::Addressing {
                    operand: Some(operand),
                    ingredient: None,
                    arg_nodes: Vec::new(),
                }
            }
        }
    }

    pub fn set_addressing_ingredient(&mut self, node: NodeId, value: U256) {
        match &mut self.node_mut(node).ext {
            NodeExt::Addressing { ingredient, .. } => *ingredient = Some(value),
            ext => {
                *ext = NodeExt::Addressing {
                    operand: None,
                    ingredient: Some(value),
                    arg_nodes: Vec::new(),
                }
            }
        }
    }

    pub fn set_addressing_args(&mut self, node: NodeId, args: Vec<Option<NodeId>>) {
        match &mut self.node_mut(node).ext {
            NodeExt::Addressing { arg_nodes, .. } => *arg_nodes = args,
            ext => {
                *ext = NodeExt::Addressing { operand: None, ingredient: None, arg_nodes: args }
            }
        }
    }

    pub fn addressing_parts(&self, node: NodeId) -> (Option<U256>, Option<U256>) {
        match &self.node(node).ext {
            NodeExt::Addressing { operand, ingredient, .. } => (*operand, *ingredient),
            _ => (None, None),
        }
    }

    /// The positional argument node `i` from the top, for addressing nodes.
    pub fn addressing_arg_back(&self, node: NodeId, i: usize) -> Option<NodeId> {
        match &self.node(node).ext {
            NodeExt::Addressing { arg_nodes, .. } if i < arg_nodes.len() => {
                arg_nodes[arg_nodes.len() - 1 - i]
            }
            _ => None,
        }
    }
}

/// Whether any of the tracked values is tainted.
pub fn any_tainted(values: &[Option<NodeId>]) -> bool {
    values.iter().any(|v| v.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracing::position::CallPosition;

    fn op_at(index: usize) -> Operation {
        Operation {
            loc: TraceLocation {
                position: CallPosition::root(),
                code_addr: Address::ZERO,
                pc: index as u64,
                op: 0x01,
                gas_available: 0,
                gas_cost: 0,
                index,
            },
            call: 0,
            state_addr: Address::ZERO,
            args: vec![],
        }
    }

    #[test]
    fn upstream_ids_are_strictly_smaller() {
        let mut g = FlowGraph::new();
        let o0 = g.push_op(op_at(0));
        let o1 = g.push_op(op_at(1));
        let a = g.new_node("x", o0, NodeExt::None);
        let b = g.new_node("x", o1, NodeExt::None);
        g.add_upstream(b, [a]);
        for (id, node) in g.nodes.iter().enumerate() {
            for up in &node.from {
                assert!((*up as usize) < id);
            }
        }
        assert_eq!(g.upstream(b), vec![a]);
    }

    #[test]
    fn upstream_dedups() {
        let mut g = FlowGraph::new();
        let o = g.push_op(op_at(0));
        let a = g.new_node("x", o, NodeExt::None);
        let b = g.new_node("x", o, NodeExt::None);
        g.add_upstream(b, [a, a]);
        assert_eq!(g.node(b).from.len(), 1);
    }
}
