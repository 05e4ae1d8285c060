//! Symbolic storage-addressing paths: the derivation from a push constant
//! (the variable's base slot) through additions and hashes to the concrete
//! slot a SLOAD/SSTORE touches. This mirrors Solidity's slot-derivation
//! formulas for scalars, dynamic arrays and mappings.

use revm::primitives::{Address, B256, U256};

use crate::dataflow::graph::{FlowGraph, NodeId};
use crate::opcode;

/// One step of an addressing path.
#[derive(Debug, Clone)]
pub struct AddressingStep {
    pub op: u8,
    pub pc: u64,
    pub code_addr: Address,
    pub operand: Option<U256>,
    pub ingredient: Option<U256>,
}

/// A complete path: first step is the seed push, last is the terminal
/// SLOAD/SSTORE, with the ADDs and KECCAK256s that derived the slot in
/// between.
#[derive(Debug, Clone)]
pub struct AddressingPath(pub Vec<AddressingStep>);

impl AddressingPath {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn valid(&self) -> bool {
        self.0.len() >= 2
            && opcode::is_push(self.0[0].op)
            && matches!(self.0.last().map(|s| s.op), Some(opcode::SLOAD) | Some(opcode::SSTORE))
    }

    /// The base slot of the Solidity-level variable this path addresses.
    pub fn seed(&self) -> B256 {
        debug_assert!(self.valid());
        B256::from(self.0[1].operand.unwrap_or_default())
    }

    /// The concrete storage slot at the end of the derivation.
    pub fn slot(&self) -> B256 {
        debug_assert!(self.valid());
        B256::from(self.0.last().and_then(|s| s.operand).unwrap_or_default())
    }

    pub fn op(&self) -> u8 {
        self.0.last().map(|s| s.op).unwrap_or(opcode::INVALID)
    }

    /// Two paths address the same variable instance when the terminal
    /// opcode, the final slot and the seed agree.
    pub fn same_access(&self, other: &AddressingPath) -> bool {
        self.op() == other.op() && self.slot() == other.slot() && self.seed() == other.seed()
    }
}

impl std::fmt::Display for AddressingPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i == 0 {
                write!(f, "Seed")?;
            } else {
                write!(
                    f,
                    " --{}-> {}",
                    B256::from(step.operand.unwrap_or_default()),
                    opcode::name(step.op)
                )?;
                if let Some(ingredient) = step.ingredient {
                    write!(f, ":{}", B256::from(ingredient))?;
                }
            }
        }
        Ok(())
    }
}

fn step_of(graph: &FlowGraph, node: NodeId) -> AddressingStep {
    let op = graph.operation(node);
    let (operand, ingredient) = graph.addressing_parts(node);
    AddressingStep {
        op: op.op(),
        pc: op.pc(),
        code_addr: op.code_addr(),
        operand,
        ingredient,
    }
}

/// Walk back from a SLOAD/SSTORE node, branching at ADD (both operand
/// assignments are explored) and recursing into every upstream at hashes
/// and storage operations. Paths are returned root-to-sink and deduped by
/// (opcode, slot, seed).
pub fn extract_paths(graph: &FlowGraph, sink: NodeId) -> Vec<AddressingPath> {
    let mut out: Vec<AddressingPath> = Vec::new();
    walk(graph, sink, Vec::new(), &mut out);
    let mut deduped: Vec<AddressingPath> = Vec::new();
    for path in out {
        if !deduped.iter().any(|p| p.same_access(&path)) {
            deduped.push(path);
        }
    }
    deduped
}

fn walk(graph: &FlowGraph, node: NodeId, path: Vec<AddressingStep>, out: &mut Vec<AddressingPath>) {
    let operation = graph.operation(node);
    let code = operation.op();

    if opcode::is_push(code) {
        let mut complete = path.clone();
        complete.push(step_of(graph, node));
        complete.reverse();
        let candidate = AddressingPath(complete);
        if candidate.valid() {
            out.push(candidate);
        }
        return;
    }

    match code {
        opcode::ADD => {
            // Both operand assignments are explored; the sibling swaps
            // operand and ingredient.
            let (a0, a1) = (operation.arg(0), operation.arg(1));
            if let Some(up) = graph.addressing_arg_back(node, 0) {
                let mut step = step_of(graph, node);
                step.operand = Some(a0);
                step.ingredient = Some(a1);
                let mut branch = path.clone();
                branch.push(step);
                walk(graph, up, branch, out);
            }
            if let Some(up) = graph.addressing_arg_back(node, 1) {
                let mut step = step_of(graph, node);
                step.operand = Some(a1);
                step.ingredient = Some(a0);
                let mut branch = path.clone();
                branch.push(step);
                walk(graph, up, branch, out);
            }
        }
        opcode::KECCAK256 | opcode::SLOAD | opcode::SSTORE => {
            for up in graph.node(node).from.clone() {
                let mut branch = path.clone();
                branch.push(step_of(graph, node));
                walk(graph, up, branch, out);
            }
        }
        _ => {}
    }
}
