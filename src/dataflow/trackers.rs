//! Mirror trackers: per-analyzer shadows of the EVM stack, memory, storage,
//! chain state and call data, holding flow nodes instead of bytes.
//!
//! Memory is tracked at 32-byte-word granularity. A write narrower than a
//! word that lands in an already-tainted word produces a merge node keeping
//! both provenances; the merge's operation comes from the tainted incoming
//! side.

use std::collections::HashMap;

use revm::primitives::{Address, B256};

use crate::dataflow::graph::{FlowGraph, NodeExt, NodeId};
use crate::tracing::position::CallPosition;

pub const WORD: u64 = 32;

fn word_floor(index: u64) -> u64 {
    index - (index % WORD)
}

/// Mirror of the EVM operand stack. Holds exactly as many entries as the
/// real stack at every observable moment.
#[derive(Debug, Default)]
pub struct MirrorStack {
    items: Vec<Option<NodeId>>,
}

impl MirrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn push_all(&mut self, values: impl IntoIterator<Item = Option<NodeId>>) {
        self.items.extend(values);
    }

    /// Pop n entries; the returned vector is bottom-first (top of stack at
    /// the end). Underflow pads with untainted entries so a faulting
    /// opcode cannot desynchronize the mirror.
    pub fn pop_n(&mut self, n: usize) -> Vec<Option<NodeId>> {
        if n == 0 {
            return Vec::new();
        }
        let have = self.items.len().min(n);
        let mut out = vec![None; n - have];
        out.extend(self.items.split_off(self.items.len() - have));
        out
    }

    /// Peek the i-th entry from the top.
    pub fn get(&self, i: usize) -> Option<NodeId> {
        if i >= self.items.len() {
            return None;
        }
        self.items[self.items.len() - 1 - i]
    }

    /// Swap the top with the entry `pos` below it.
    pub fn swap(&mut self, pos: usize) {
        let len = self.items.len();
        if pos == 0 || pos >= len {
            return;
        }
        self.items.swap(len - 1, len - 1 - pos);
    }
}

/// Word-granular mirror of the call frame's memory.
#[derive(Debug, Default)]
pub struct MirrorMemory {
    words: HashMap<u64, NodeId>,
}

impl MirrorMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, start: u64, length: u64) -> Vec<NodeId> {
        if length == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut i = word_floor(start);
        while i < start + length {
            if let Some(node) = self.words.get(&i) {
                out.push(*node);
            }
            i += WORD;
        }
        out
    }

    pub fn store(&mut self, graph: &mut FlowGraph, start: u64, length: u64, value: Option<NodeId>) {
        if length == 0 {
            return;
        }
        let mut i = word_floor(start);
        while i < start + length {
            self.store_word(graph, i, start, length, value);
            i += WORD;
        }
    }

    pub fn clear(&mut self, graph: &mut FlowGraph, start: u64, length: u64) {
        self.store(graph, start, length, None);
    }

    fn store_word(
        &mut self,
        graph: &mut FlowGraph,
        word: u64,
        start: u64,
        length: u64,
        value: Option<NodeId>,
    ) {
        let partial = word < start || word + WORD > start + length;
        let old = self.words.get(&word).copied();
        if partial && old.is_some() {
            match value {
                None => {} // keep the existing taint for the untouched bytes
                Some(new) => {
                    let op = graph.node(new).op;
                    let merge = graph.new_node("memory_merge", op, NodeExt::None);
                    graph.add_upstream(merge, [new, old.unwrap()]);
                    self.words.insert(word, merge);
                }
            }
        } else {
            match value {
                None => {
                    self.words.remove(&word);
                }
                Some(node) => {
                    self.words.insert(word, node);
                }
            }
        }
    }

    /// Copy call data words `[offset, offset+length)` to
    /// `[dest, dest+length)`, with the same partial-word merge rules.
    pub fn store_call_data(
        &mut self,
        graph: &mut FlowGraph,
        call: &CallTracker,
        dest: u64,
        offset: u64,
        length: u64,
    ) {
        if length == 0 {
            return;
        }
        let mut index = word_floor(dest);
        let mut i = word_floor(offset);
        while i < offset + length {
            let incoming = call.data.get(&i).copied();
            self.store_word(graph, index, dest, length, incoming);
            index += WORD;
            i += WORD;
        }
    }

    /// Copy a child call's return data into memory.
    pub fn store_call_return_data(
        &mut self,
        graph: &mut FlowGraph,
        call: &CallTracker,
        dest: u64,
        offset: u64,
        length: u64,
    ) {
        if length == 0 {
            return;
        }
        let mut index = word_floor(dest);
        let mut i = word_floor(offset);
        while i < offset + length {
            let incoming = call.return_data.get(&i).copied().or(call.source);
            self.store_word(graph, index, dest, length, incoming);
            index += WORD;
            i += WORD;
        }
    }
}

/// Storage tracker, shared across all calls of the transaction that run in
/// the same contract (per analyzer).
#[derive(Debug, Default)]
pub struct MirrorStorage {
    slots: HashMap<B256, NodeId>,
}

impl MirrorStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, key: B256) -> Option<NodeId> {
        self.slots.get(&key).copied()
    }

    pub fn store(&mut self, key: B256, value: NodeId) {
        self.slots.insert(key, value);
    }

    pub fn clear(&mut self, key: B256) {
        self.slots.remove(&key);
    }
}

/// Chain-level tracker (balances and code), shared across the whole
/// transaction per analyzer.
#[derive(Debug, Default)]
pub struct MirrorChain {
    balances: HashMap<Address, NodeId>,
    codes: HashMap<Address, NodeId>,
}

impl MirrorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, addr: Address) -> Option<NodeId> {
        self.balances.get(&addr).copied()
    }

    pub fn set_balance(&mut self, addr: Address, node: Option<NodeId>) {
        match node {
            Some(n) => {
                self.balances.insert(addr, n);
            }
            None => {
                self.balances.remove(&addr);
            }
        }
    }

    pub fn code(&self, addr: Address) -> Option<NodeId> {
        self.codes.get(&addr).copied()
    }

    pub fn set_code(&mut self, addr: Address, node: Option<NodeId>) {
        match node {
            Some(n) => {
                self.codes.insert(addr, n);
            }
            None => {
                self.codes.remove(&addr);
            }
        }
    }
}

/// Per-message-call data tracker. The parent's `child_call` slot and the
/// child's own `call` slot alias the same tracker, which is why trackers
/// live in a pool and are referenced by id.
#[derive(Debug)]
pub struct CallTracker {
    pub position: CallPosition,
    pub value: Option<NodeId>,
    /// Call data taint, keyed by word offset into the call data.
    pub data: HashMap<u64, NodeId>,
    pub return_data: HashMap<u64, NodeId>,
    pub success: Option<NodeId>,
    /// Pseudo source: when the whole call is a taint source, reads of its
    /// data/return data fall back to this node.
    pub source: Option<NodeId>,
}

impl CallTracker {
    pub fn new(position: CallPosition) -> Self {
        Self {
            position,
            value: None,
            data: HashMap::new(),
            return_data: HashMap::new(),
            success: None,
            source: None,
        }
    }

    /// Seed the call data from the caller's memory words.
    pub fn store_data(&mut self, memory: &MirrorMemory, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let start = word_floor(offset);
        let mut i = 0u64;
        while start + i < offset + length {
            if let Some(node) = memory.words.get(&(start + i)) {
                self.data.insert(i, *node);
            }
            i += WORD;
        }
    }

    pub fn store_return_data(&mut self, memory: &MirrorMemory, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let start = word_floor(offset);
        let mut i = 0u64;
        while start + i < offset + length {
            if let Some(node) = memory.words.get(&(start + i)) {
                self.return_data.insert(i, *node);
            }
            i += WORD;
        }
    }

    pub fn get_data(&self, start: u64, length: u64) -> Vec<NodeId> {
        if length == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut i = word_floor(start);
        while i < start + length {
            if let Some(node) = self.data.get(&i) {
                out.push(*node);
            }
            i += WORD;
        }
        if out.is_empty() {
            if let Some(source) = self.source {
                out.push(source);
            }
        }
        out
    }

    pub fn get_all_return_data(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self.return_data.values().copied().collect();
        if out.is_empty() {
            if let Some(source) = self.source {
                out.push(source);
            }
        }
        out
    }

    pub fn get_success(&self) -> Option<NodeId> {
        self.success.or(self.source)
    }

    /// A node's own presence counts as taint, so a fresh source node with
    /// no upstream still taints the return data.
    pub fn return_data_is_tainted(&self) -> bool {
        !self.return_data.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CallTrackerPool {
    items: Vec<CallTracker>,
}

impl CallTrackerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, position: CallPosition) -> usize {
        self.items.push(CallTracker::new(position));
        self.items.len() - 1
    }

    pub fn get(&self, id: usize) -> &CallTracker {
        &self.items[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut CallTracker {
        &mut self.items[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::graph::{NodeExt, Operation};
    use crate::tracing::location::TraceLocation;

    fn graph_with_node() -> (FlowGraph, NodeId) {
        let mut g = FlowGraph::new();
        let op = g.push_op(Operation {
            loc: TraceLocation {
                position: CallPosition::root(),
                code_addr: Address::ZERO,
                pc: 0,
                op: 0x52,
                gas_available: 0,
                gas_cost: 0,
                index: 0,
            },
            call: 0,
            state_addr: Address::ZERO,
            args: vec![],
        });
        let node = g.new_node("test", op, NodeExt::None);
        (g, node)
    }

    #[test]
    fn full_word_store_replaces() {
        let (mut g, node) = graph_with_node();
        let mut mem = MirrorMemory::new();
        mem.store(&mut g, 0, 32, Some(node));
        assert_eq!(mem.load(0, 32), vec![node]);
        mem.clear(&mut g, 0, 32);
        assert!(mem.load(0, 32).is_empty());
    }

    #[test]
    fn partial_store_into_tainted_word_merges() {
        let (mut g, node) = graph_with_node();
        let mut mem = MirrorMemory::new();
        mem.store(&mut g, 0, 32, Some(node));
        let incoming = g.new_node("test2", 0, NodeExt::None);
        // one byte into an already tainted word
        mem.store(&mut g, 5, 1, Some(incoming));
        let loaded = mem.load(0, 32);
        assert_eq!(loaded.len(), 1);
        let merged = loaded[0];
        assert_ne!(merged, node);
        assert_eq!(g.node(merged).label, "memory_merge");
        assert!(g.node(merged).from.contains(&node));
        assert!(g.node(merged).from.contains(&incoming));
    }

    #[test]
    fn partial_untainted_store_keeps_existing() {
        let (mut g, node) = graph_with_node();
        let mut mem = MirrorMemory::new();
        mem.store(&mut g, 0, 32, Some(node));
        mem.store(&mut g, 5, 1, None);
        assert_eq!(mem.load(0, 32), vec![node]);
    }

    #[test]
    fn underflow_pads_untainted() {
        let mut stack = MirrorStack::new();
        stack.push_all([Some(3)]);
        let popped = stack.pop_n(3);
        assert_eq!(popped, vec![None, None, Some(3)]);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn source_backs_empty_call_data() {
        let mut tracker = CallTracker::new(CallPosition::root());
        assert!(tracker.get_data(0, 32).is_empty());
        tracker.source = Some(7);
        assert_eq!(tracker.get_data(0, 32), vec![7]);
        assert_eq!(tracker.get_success(), Some(7));
    }
}
