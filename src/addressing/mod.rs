//! Storage-addressing-path analysis: a flow-policy specialization that
//! seeds taint at push constants and sinks at SLOAD/SSTORE, recovering the
//! symbolic path from the variable's base slot to the accessed slot.

pub mod path;

use revm::primitives::{Address, B256, U256};

use crate::dataflow::policy;
use crate::dataflow::{AfterHook, Analyzer, FlowCx, FlowGraph, NodeExt, NodeId, OpId, Operation};
use crate::opcode;

pub use path::{extract_paths, AddressingPath, AddressingStep};

/// The storage variable to focus on; `None` watches every slot of every
/// contract.
#[derive(Debug, Clone, Copy)]
pub struct TargetSlot {
    pub address: Address,
    pub slot: B256,
}

pub type StorageAccessHandler<'cb> = Box<dyn FnMut(u8, Vec<AddressingPath>) + 'cb>;

/// Analyzer recovering addressing paths of storage accesses.
///
/// Addressing paths are assumed not to cross message-call boundaries: the
/// push source is only recognized inside the target contract.
pub struct StorageAddressingAnalyzer<'cb> {
    target: Option<TargetSlot>,
    on_storage_access: StorageAccessHandler<'cb>,
}

impl<'cb> StorageAddressingAnalyzer<'cb> {
    pub fn new(target: Option<TargetSlot>, on_storage_access: StorageAccessHandler<'cb>) -> Self {
        Self { target, on_storage_access }
    }
}

impl Analyzer for StorageAddressingAnalyzer<'_> {
    fn new_flow_node(&mut self, graph: &mut FlowGraph, op_id: OpId, _op: &Operation) -> NodeId {
        graph.new_node(
            "addressing",
            op_id,
            NodeExt::Addressing { operand: None, ingredient: None, arg_nodes: Vec::new() },
        )
    }

    fn check_operation(&mut self, op: &Operation) -> (bool, bool) {
        let mut source = false;
        let mut sink = false;
        if opcode::is_push(op.op()) {
            source = match &self.target {
                None => true,
                Some(t) => t.address == op.state_addr,
            };
        }
        if matches!(op.op(), opcode::SLOAD | opcode::SSTORE) {
            sink = match &self.target {
                None => true,
                Some(t) => t.address == op.state_addr && t.slot == op.arg_b256(0),
            };
        }
        (source, sink)
    }

    fn sink_tainted(&mut self, graph: &FlowGraph, node: NodeId) {
        let op = graph.operation(node).op();
        let paths = extract_paths(graph, node);
        (self.on_storage_access)(op, paths);
    }

    fn flow(&mut self, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
        match cx.op.op() {
            opcode::ADD => add_flow(self, cx),
            opcode::SLOAD | opcode::SSTORE => storage_flow(self, cx),
            opcode::KECCAK256 => hash_flow(self, cx),
            _ => policy::default_flow(self, cx),
        }
    }
}

/// ADD propagates taint positionally: the walk later explores both operand
/// assignments, so the node records its argument nodes untainted slots
/// included.
fn add_flow(a: &mut StorageAddressingAnalyzer<'_>, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    if cx.args.iter().any(|n| n.is_some()) {
        let args = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, args.clone());
        cx.graph.set_addressing_args(node, args);
        cx.results[0] = Some(node);
    }
    None
}

/// SLOAD/SSTORE terminate a path when their slot argument is tainted.
fn storage_flow(
    a: &mut StorageAddressingAnalyzer<'_>,
    cx: &mut FlowCx<'_, '_>,
) -> Option<AfterHook> {
    let sink = a.check_operation(cx.op).1;
    let address_node = policy::arg_back(cx.args, 0);
    if let Some(address_node) = address_node {
        let slot = cx.op.arg(0);
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream(node, [address_node]);
        cx.graph.set_addressing_operand(node, slot);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    }
    None
}

/// KECCAK256 is recognized only in the two Solidity addressing shapes:
/// hashing key ∥ slot (mappings, 64 bytes) or a single slot word (dynamic
/// arrays, 32 bytes).
fn hash_flow(a: &mut StorageAddressingAnalyzer<'_>, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let offset = cx.op.arg(0).saturating_to::<u64>();
    let size = cx.op.arg(1).saturating_to::<u64>();
    match size {
        64 => {
            let operand_nodes = cx.memory.load(offset + 32, 32);
            let ingredient_word = word_at(cx.step.memory, offset);
            let operand_word = word_at(cx.step.memory, offset + 32);
            let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
            cx.graph.add_upstream(node, operand_nodes.clone());
            cx.graph.set_addressing_operand(node, operand_word);
            cx.graph.set_addressing_ingredient(node, ingredient_word);
            if !operand_nodes.is_empty() {
                cx.results[0] = Some(node);
            }
        }
        32 => {
            let operand_nodes = cx.memory.load(offset, 32);
            let operand_word = word_at(cx.step.memory, offset);
            let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
            cx.graph.add_upstream(node, operand_nodes.clone());
            cx.graph.set_addressing_operand(node, operand_word);
            if !operand_nodes.is_empty() {
                cx.results[0] = Some(node);
            }
        }
        _ => {}
    }
    None
}

fn word_at(memory: &[u8], offset: u64) -> U256 {
    let bytes = crate::tracing::memory_slice_padded(memory, offset, 32);
    U256::from_be_slice(&bytes)
}
