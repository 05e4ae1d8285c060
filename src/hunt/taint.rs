//! Taint analysis for one shared variable, extended with control
//! dependency: while the victim's execution diverges from the attack-free
//! reference path, every value defined is control-tainted through a
//! pseudo-source anchored at the diverging branch.

use std::collections::{HashMap, HashSet};

use revm::primitives::{keccak256, Address, B256};

use crate::dataflow::policy;
use crate::dataflow::{AfterHook, Analyzer, FlowCx, FlowGraph, NodeExt, NodeId, OpId, Operation};
use crate::opcode;
use crate::summary::StateVariable;
use crate::tracing::location::TraceBlock;

pub struct TaintAnalyzer<'r> {
    /// The shared variable as read in the victim transaction.
    variable: StateVariable,
    /// The victim's attack-free execution path.
    ref_path: &'r [TraceBlock],

    /// Operation indices where the variable itself was loaded (true
    /// sources, as opposed to control-divergence pseudo sources).
    pub sources: HashSet<usize>,
    /// Tainted sinks by operation index, per consequence class.
    pub jumps: HashMap<usize, NodeId>,
    pub logs: HashMap<usize, NodeId>,
    pub calls: HashMap<usize, NodeId>,

    /// The same operation always maps to the same node.
    nodes: HashMap<usize, NodeId>,

    current_block_index: usize,
    diverging: bool,
    diverging_node: Option<NodeId>,
    /// (code address, head pc) -> reference-path index of candidate
    /// re-merge blocks, populated when a divergence opens.
    merge_blocks: HashMap<(Address, u64), usize>,
    last_tainted_sink: Option<NodeId>,
}

impl<'r> TaintAnalyzer<'r> {
    pub fn new(variable: StateVariable, ref_path: &'r [TraceBlock]) -> Self {
        Self {
            variable,
            ref_path,
            sources: HashSet::new(),
            jumps: HashMap::new(),
            logs: HashMap::new(),
            calls: HashMap::new(),
            nodes: HashMap::new(),
            current_block_index: 0,
            diverging: false,
            diverging_node: None,
            merge_blocks: HashMap::new(),
            last_tainted_sink: None,
        }
    }

    /// Whether this operation loads the shared variable.
    fn shared_variable_loaded(&self, op: &Operation) -> bool {
        match &self.variable {
            StateVariable::Storage { address, slot, .. } => {
                op.op() == opcode::SLOAD && op.state_addr == *address && op.arg_b256(0) == *slot
            }
            StateVariable::Balance { address, .. } => {
                (op.op() == opcode::BALANCE && op.arg_addr(0) == *address)
                    || (op.op() == opcode::SELFBALANCE && op.state_addr == *address)
                    || (op.op() == opcode::CALL
                        && op.arg(2) > revm::primitives::U256::ZERO
                        && op.state_addr == *address)
            }
            StateVariable::Code { address, .. } => match op.op() {
                opcode::CODESIZE | opcode::CODECOPY => op.code_addr() == *address,
                opcode::EXTCODESIZE | opcode::EXTCODECOPY | opcode::EXTCODEHASH => {
                    op.arg_addr(0) == *address
                }
                _ => false,
            },
        }
    }

    /// The basic block execution continues into after the current
    /// block-tail opcode.
    fn next_block(&self, cx: &mut FlowCx<'_, '_>) -> (Address, u64) {
        let op = cx.op;
        match op.op() {
            opcode::JUMP => (op.code_addr(), op.arg(0).saturating_to::<u64>()),
            opcode::JUMPI => {
                let dest = op.arg(0).saturating_to::<u64>();
                let cond = op.arg(1);
                let pc = if cond.is_zero() { op.pc() + 1 } else { dest };
                (op.code_addr(), pc)
            }
            opcode::RETURN
            | opcode::STOP
            | opcode::INVALID
            | opcode::REVERT
            | opcode::SELFDESTRUCT => cx.parent_site.unwrap_or((Address::ZERO, u64::MAX)),
            opcode::CREATE => {
                let caller = cx.step.state_addr;
                let nonce = cx.state.nonce_of(caller);
                (caller.create(nonce), 0)
            }
            opcode::CREATE2 => {
                let caller = cx.step.state_addr;
                let salt = B256::from(op.arg(3));
                let offset = op.arg(1).saturating_to::<u64>();
                let size = op.arg(2).saturating_to::<u64>();
                let code = cx.step.memory_slice(offset, size);
                (caller.create2(salt, keccak256(&code)), 0)
            }
            opcode::CALL | opcode::CALLCODE | opcode::DELEGATECALL | opcode::STATICCALL => {
                (op.arg_addr(1), 0)
            }
            _ => (op.code_addr(), op.pc() + 1),
        }
    }

    fn track_divergence(&mut self, next: (Address, u64)) {
        if self.diverging {
            if let Some(index) = self.merge_blocks.get(&next) {
                // The paths re-merge at this block.
                self.current_block_index = *index;
                self.diverging = false;
                self.diverging_node = None;
                self.merge_blocks.clear();
            }
            return;
        }
        if self.current_block_index + 1 >= self.ref_path.len() {
            // Past the end of the reference: treat whatever follows as
            // divergent.
            self.diverging = true;
            self.merge_blocks.clear();
            return;
        }
        let expected = &self.ref_path[self.current_block_index + 1];
        let expected_head = expected.head().map(|h| (expected.code_addr, h.pc));
        if expected_head == Some(next) {
            self.current_block_index += 1;
        } else {
            self.diverging = true;
            self.diverging_node = self.last_tainted_sink;
            self.merge_blocks.clear();
            for i in self.current_block_index + 1..self.ref_path.len() {
                let block = &self.ref_path[i];
                if let Some(head) = block.head() {
                    // A head revisited by the reference path (a loop body)
                    // keeps its latest index, so re-merging resumes at the
                    // furthest consistent point.
                    self.merge_blocks.insert((block.code_addr, head.pc), i);
                }
            }
        }
    }
}

impl Analyzer for TaintAnalyzer<'_> {
    fn new_flow_node(&mut self, graph: &mut FlowGraph, op_id: OpId, op: &Operation) -> NodeId {
        if let Some(node) = self.nodes.get(&op.index()) {
            return *node;
        }
        let node = graph.new_node("attack_taint", op_id, NodeExt::Control { control_from: vec![] });
        if self.diverging {
            if let Some(diverging) = self.diverging_node {
                graph.add_control_upstream(node, diverging);
            }
        }
        self.nodes.insert(op.index(), node);
        node
    }

    fn check_operation(&mut self, op: &Operation) -> (bool, bool) {
        let mut source = false;
        if self.shared_variable_loaded(op) {
            source = true;
            self.sources.insert(op.index());
        }
        // Inside a divergent region every defined value is tainted via a
        // pseudo source.
        if self.diverging && self.diverging_node.is_some() {
            source = true;
        }
        let sink = matches!(op.op(), opcode::CALL)
            || opcode::is_log(op.op())
            || opcode::is_block_tail(op.op());
        (source, sink)
    }

    fn sink_tainted(&mut self, graph: &FlowGraph, node: NodeId) {
        let op = graph.operation(node);
        match op.op() {
            opcode::JUMP | opcode::JUMPI => {
                self.jumps.insert(op.index(), node);
            }
            opcode::CALL => {
                self.calls.insert(op.index(), node);
            }
            c if opcode::is_log(c) => {
                self.logs.insert(op.index(), node);
            }
            _ => {}
        }
        self.last_tainted_sink = Some(node);
    }

    fn flow(&mut self, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
        if !opcode::is_block_tail(cx.op.op()) {
            return policy::default_flow(self, cx);
        }
        self.last_tainted_sink = None;
        let hook = policy::default_flow(self, cx);
        let next = self.next_block(cx);
        self.track_divergence(next);
        hook
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracing::location::TraceLocation;
    use crate::tracing::position::CallPosition;

    fn code_addr() -> Address {
        Address::with_last_byte(0xcc)
    }

    fn block(pc: u64, index: usize) -> TraceBlock {
        TraceBlock {
            content: vec![TraceLocation {
                position: CallPosition::root(),
                code_addr: code_addr(),
                pc,
                op: crate::opcode::JUMPDEST,
                gas_available: 0,
                gas_cost: 0,
                index,
            }],
            state_addr: code_addr(),
            code_addr: code_addr(),
        }
    }

    fn analyzer(ref_path: &[TraceBlock]) -> TaintAnalyzer<'_> {
        let variable = StateVariable::storage(Address::ZERO, B256::ZERO, B256::ZERO, None);
        TaintAnalyzer::new(variable, ref_path)
    }

    #[test]
    fn advances_in_lockstep_with_the_reference() {
        let path = vec![block(0, 0), block(10, 1), block(20, 2)];
        let mut a = analyzer(&path);

        a.track_divergence((code_addr(), 10));
        assert_eq!(a.current_block_index, 1);
        assert!(!a.diverging);
        a.track_divergence((code_addr(), 20));
        assert_eq!(a.current_block_index, 2);
        assert!(!a.diverging);

        // Past the end of the reference counts as divergence.
        a.track_divergence((code_addr(), 30));
        assert!(a.diverging);
    }

    #[test]
    fn re_merge_lands_on_the_latest_duplicate_of_a_loop_block() {
        // The reference revisits the block at pc 10 (a two-iteration loop
        // body) before reaching pc 30.
        let path =
            vec![block(0, 0), block(10, 1), block(20, 2), block(10, 3), block(30, 4)];
        let mut a = analyzer(&path);

        a.track_divergence((code_addr(), 99));
        assert!(a.diverging);
        // The duplicated head maps to its latest reference-path index.
        assert_eq!(a.merge_blocks.get(&(code_addr(), 10)), Some(&3));
        assert_eq!(a.merge_blocks.get(&(code_addr(), 20)), Some(&2));
        assert_eq!(a.merge_blocks.get(&(code_addr(), 30)), Some(&4));

        // Re-merging at pc 10 resumes at the loop's last visit, keeping
        // the remaining reference ahead of the cursor.
        a.track_divergence((code_addr(), 10));
        assert!(!a.diverging);
        assert!(a.merge_blocks.is_empty());
        assert_eq!(a.current_block_index, 3);

        a.track_divergence((code_addr(), 30));
        assert_eq!(a.current_block_index, 4);
        assert!(!a.diverging);
    }
}
