//! Program points and basic blocks of an execution trace.

use revm::primitives::Address;

use crate::opcode;
use crate::tracing::position::CallPosition;

/// One program point during execution. Indices are assigned in execution
/// order across the whole transaction and never repeat; location equality
/// is index equality.
#[derive(Debug, Clone)]
pub struct TraceLocation {
    pub position: CallPosition,
    pub code_addr: Address,
    pub pc: u64,
    pub op: u8,
    /// Remaining gas before this location executes.
    pub gas_available: u64,
    pub gas_cost: u64,
    pub index: usize,
}

impl TraceLocation {
    pub fn id(&self) -> String {
        format!("({}):{}-{}", self.position, self.pc, self.index)
    }

    pub fn same_point(&self, other: &TraceLocation) -> bool {
        self.index == other.index
    }
}

impl PartialEq for TraceLocation {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for TraceLocation {}

/// A maximal straight-line run of locations within one code address.
#[derive(Debug, Clone, Default)]
pub struct TraceBlock {
    pub content: Vec<TraceLocation>,
    pub state_addr: Address,
    pub code_addr: Address,
}

impl TraceBlock {
    pub fn head(&self) -> Option<&TraceLocation> {
        self.content.first()
    }

    pub fn tail(&self) -> Option<&TraceLocation> {
        self.content.last()
    }

    /// Blocks are the same when they start at the same program point.
    pub fn same_block(&self, other: &TraceBlock) -> bool {
        match (self.head(), other.head()) {
            (Some(a), Some(b)) => a.same_point(b),
            _ => false,
        }
    }

    /// Whether a location falls inside this block: same code address, pc
    /// within [head, tail] and remaining gas within the block's window.
    pub fn contains(&self, loc: &TraceLocation) -> bool {
        let (Some(head), Some(tail)) = (self.head(), self.tail()) else {
            return false;
        };
        self.code_addr == loc.code_addr
            && head.pc <= loc.pc
            && loc.pc <= tail.pc
            && head.gas_available >= loc.gas_available
            && loc.gas_available >= tail.gas_available
    }
}

/// An execution path as a sequence of basic blocks.
pub type Trace = Vec<TraceBlock>;

/// Search a trace for the location of (code address, pc).
pub fn search_for_location<'a>(trace: &'a [TraceBlock], code_addr: &Address, pc: u64) -> Option<&'a TraceLocation> {
    for block in trace {
        if block.code_addr != *code_addr {
            continue;
        }
        let (Some(head), Some(tail)) = (block.head(), block.tail()) else {
            continue;
        };
        if head.pc <= pc && pc <= tail.pc {
            if let Some(loc) = block.content.iter().find(|l| l.pc == pc) {
                return Some(loc);
            }
        }
    }
    None
}

/// A location starts a block when it is the first in its call, follows a
/// block tail, or is a JUMPDEST.
pub fn is_block_head(previous: Option<&TraceLocation>, current: &TraceLocation) -> bool {
    match previous {
        None => true,
        Some(prev) => opcode::is_block_tail(prev.op) || current.op == opcode::JUMPDEST,
    }
}

pub fn is_block_tail(current: &TraceLocation) -> bool {
    opcode::is_block_tail(current.op)
}
