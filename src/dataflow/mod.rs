//! The data-flow engine: per-analyzer mirrors of the EVM state and a
//! per-opcode flow policy, driven cooperatively from the opcode loop.
//!
//! Each opcode is processed in three phases:
//! 1. the previous operation's post-callback runs against the now-visible
//!    post-state and the finished mirror-stack push happens;
//! 2. the operation's stack arguments are snapshotted, the mirror stack is
//!    popped, and the analyzer's flow function runs; it may return a
//!    post-callback;
//! 3. the real opcode executes; the post-callback waits for the frame's
//!    next step (for the call family that is after the child completed).
//!
//! Pending callbacks of a frame that terminates are discarded.

pub mod graph;
pub mod policy;
pub mod trackers;

use std::collections::HashMap;

use revm::primitives::{Address, Bytes, U256};

use crate::engine::state::StateReader;
use crate::engine::tx::Tx;
use crate::engine::{ExecResult, Receipt, VmContext, VmError};
use crate::opcode;
use crate::tracing::msg_call::{CallArena, CallId};
use crate::tracing::nested::NestedCallTracer;
use crate::tracing::position::CallPosition;
use crate::tracing::{EnterFrame, OpStep, TxTracer};

pub use graph::{any_tainted, FlowGraph, FlowNodeData, NodeExt, NodeId, OpId, Operation};
pub use trackers::{CallTracker, CallTrackerPool, MirrorChain, MirrorMemory, MirrorStack, MirrorStorage};

/// A callback to run after the traced operation has executed, fed the
/// post-state of that operation.
pub type AfterHook = Box<dyn for<'x, 'y> FnOnce(&mut dyn Analyzer, &mut AfterCx<'x, 'y>)>;

/// Everything a flow function may touch while processing one operation.
pub struct FlowCx<'a, 'b> {
    pub graph: &'a mut FlowGraph,
    pub step: &'a OpStep<'b>,
    pub state: &'a mut dyn StateReader,
    pub op: &'a Operation,
    pub op_id: OpId,
    /// Mirror-stack arguments popped for this operation, bottom-first.
    pub args: &'a [Option<NodeId>],
    /// Mirror values this operation will push, to be filled in.
    pub results: &'a mut Vec<Option<NodeId>>,
    pub stack: &'a mut MirrorStack,
    pub memory: &'a mut MirrorMemory,
    pub storage: &'a mut MirrorStorage,
    pub chain: &'a mut MirrorChain,
    pub calls: &'a mut CallTrackerPool,
    /// This frame's call tracker id.
    pub call: usize,
    /// Slot for the tracker of the child call this operation spawns.
    pub child_call: &'a mut Option<usize>,
    pub child_pos_plain: CallPosition,
    pub child_pos_precompile: CallPosition,
    /// Caller's (code address, pc after the call site); None at the root.
    pub parent_site: Option<(Address, u64)>,
}

impl FlowCx<'_, '_> {
    /// The i-th mirror argument from the top.
    pub fn arg_back(&self, i: usize) -> Option<NodeId> {
        self.args[self.args.len() - 1 - i]
    }

    /// Mirror arguments below the top `skip` entries (Go's BackSlice(skip)).
    pub fn args_below(&self, skip: usize) -> &[Option<NodeId>] {
        &self.args[..self.args.len() - skip]
    }

    /// Mirror arguments `[len-to, len-from)` counting from the top.
    pub fn args_range_back(&self, from: usize, to: usize) -> &[Option<NodeId>] {
        &self.args[self.args.len() - to..self.args.len() - from]
    }
}

/// Post-state context for after-hooks.
pub struct AfterCx<'a, 'b> {
    pub graph: &'a mut FlowGraph,
    /// The real stack after the hooked operation executed.
    pub stack: &'b [U256],
    pub memory: &'a mut MirrorMemory,
    pub chain: &'a mut MirrorChain,
    pub calls: &'a mut CallTrackerPool,
    pub results: &'a mut Vec<Option<NodeId>>,
}

impl AfterCx<'_, '_> {
    pub fn stack_back(&self, i: usize) -> U256 {
        self.stack[self.stack.len() - 1 - i]
    }

    pub fn stack_back_addr(&self, i: usize) -> Address {
        Address::from_slice(&self.stack_back(i).to_be_bytes::<32>()[12..])
    }
}

/// One data-flow analyzer: decides sources and sinks, creates its flavor of
/// flow nodes, reacts to tainted sinks, and owns a per-opcode flow policy
/// (the default policy with per-opcode overrides).
pub trait Analyzer {
    fn new_flow_node(&mut self, graph: &mut FlowGraph, op_id: OpId, op: &Operation) -> NodeId;

    fn check_operation(&mut self, op: &Operation) -> (bool, bool);

    fn sink_tainted(&mut self, graph: &FlowGraph, node: NodeId);

    /// Process one operation. Implementations typically delegate to
    /// [`policy::default_flow`], overriding individual opcodes.
    fn flow(&mut self, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook>;
}

pub(crate) struct Pending {
    results: Vec<Option<NodeId>>,
    after: Option<AfterHook>,
}

/// Per-call, per-analyzer mirror state.
pub struct AnalyzerFrame {
    stack: MirrorStack,
    memory: MirrorMemory,
    /// Index into the tracer's storage pool; shared between all frames of
    /// the same contract within the transaction.
    storage: usize,
    call: usize,
    child_call: Option<usize>,
    pending: Option<Pending>,
}

#[derive(Default)]
pub struct FlowData {
    frames: Vec<AnalyzerFrame>,
}

/// Extracted output of one traced transaction.
pub struct FlowResult {
    pub graph: FlowGraph,
    pub arena: CallArena<FlowData>,
    pub root: Option<CallId>,
}

/// The composite data-flow tracer. Multiple analyzers share the traversal
/// and the real-state snapshots but have fully independent mirror state.
pub struct DataFlowTracer<'a> {
    nested: NestedCallTracer<FlowData>,
    analyzers: Vec<&'a mut dyn Analyzer>,
    graph: FlowGraph,
    storage_pool: Vec<MirrorStorage>,
    storage_index: HashMap<(usize, Address), usize>,
    chains: Vec<MirrorChain>,
    call_pool: CallTrackerPool,
}

impl<'a> DataFlowTracer<'a> {
    pub fn new(analyzers: Vec<&'a mut dyn Analyzer>) -> Self {
        Self {
            nested: NestedCallTracer::new(false),
            analyzers,
            graph: FlowGraph::new(),
            storage_pool: Vec::new(),
            storage_index: HashMap::new(),
            chains: Vec::new(),
            call_pool: CallTrackerPool::new(),
        }
    }

    /// Take the graph and call tree after the transaction finished.
    pub fn take_result(&mut self) -> FlowResult {
        let nested = std::mem::replace(&mut self.nested, NestedCallTracer::new(false));
        let root = nested.root();
        FlowResult {
            graph: std::mem::take(&mut self.graph),
            arena: nested.into_arena(),
            root,
        }
    }

    fn fresh_frames(&mut self, state_addr: Address, position: &CallPosition) -> Vec<AnalyzerFrame> {
        let n = self.analyzers.len();
        let mut frames = Vec::with_capacity(n);
        for ai in 0..n {
            let call = self.call_pool.alloc(position.clone());
            let storage = self.register_storage(ai, state_addr);
            frames.push(AnalyzerFrame {
                stack: MirrorStack::new(),
                memory: MirrorMemory::new(),
                storage,
                call,
                child_call: None,
                pending: None,
            });
        }
        frames
    }

    fn register_storage(&mut self, ai: usize, state_addr: Address) -> usize {
        let key = (ai, state_addr);
        if let Some(idx) = self.storage_index.get(&key) {
            return *idx;
        }
        self.storage_pool.push(MirrorStorage::new());
        let idx = self.storage_pool.len() - 1;
        self.storage_index.insert(key, idx);
        idx
    }
}

impl TxTracer for DataFlowTracer<'_> {
    fn transaction_start(&mut self, tx: &Tx, ctx: &VmContext, state: &mut dyn StateReader) {
        self.graph = FlowGraph::new();
        self.storage_pool.clear();
        self.storage_index.clear();
        self.chains = (0..self.analyzers.len()).map(|_| MirrorChain::new()).collect();
        self.call_pool = CallTrackerPool::new();

        self.nested.transaction_start(tx, ctx, state);
        let Some(root) = self.nested.root() else { return };

        // The root call gets a fresh, unshared storage tracker; nested
        // calls into the same contract register theirs in the index.
        let n = self.analyzers.len();
        let mut frames = Vec::with_capacity(n);
        for _ai in 0..n {
            let call = self.call_pool.alloc(CallPosition::root());
            self.storage_pool.push(MirrorStorage::new());
            let storage = self.storage_pool.len() - 1;
            frames.push(AnalyzerFrame {
                stack: MirrorStack::new(),
                memory: MirrorMemory::new(),
                storage,
                call,
                child_call: None,
                pending: None,
            });
        }
        self.nested.arena.get_mut(root).data.frames = frames;
    }

    fn transaction_end(
        &mut self,
        tx: &Tx,
        ctx: &VmContext,
        state: &mut dyn StateReader,
        result: &ExecResult,
        receipt: Option<&Receipt>,
    ) {
        self.nested.transaction_end(tx, ctx, state, result, receipt);
    }

    fn capture_enter(&mut self, frame: &EnterFrame, state: &mut dyn StateReader) {
        let parent = self.nested.current();
        self.nested.capture_enter(frame, state);
        let (Some(parent), Some(child)) = (parent, self.nested.current()) else {
            return;
        };
        let child_pos = self.nested.arena.get(child).position.clone();
        let child_state_addr = self.nested.arena.get(child).state_addr;

        let n = self.analyzers.len();
        let mut frames = Vec::with_capacity(n);
        for ai in 0..n {
            // Reuse the tracker the parent's call-site policy seeded, when
            // it matches this child; the tracker is then aliased between
            // the parent's child_call slot and the child's call slot.
            let seeded = self.nested.arena.get(parent).data.frames[ai].child_call;
            let call = match seeded {
                Some(idx) if self.call_pool.get(idx).position == child_pos => idx,
                _ => self.call_pool.alloc(child_pos.clone()),
            };
            let storage = self.register_storage(ai, child_state_addr);
            frames.push(AnalyzerFrame {
                stack: MirrorStack::new(),
                memory: MirrorMemory::new(),
                storage,
                call,
                child_call: None,
                pending: None,
            });
        }
        self.nested.arena.get_mut(child).data.frames = frames;
    }

    fn capture_exit(&mut self, output: &Bytes, gas_used: u64, error: Option<VmError>) {
        // The frame's pending callbacks die with it.
        self.nested.capture_exit(output, gas_used, error);
    }

    fn capture_state(&mut self, step: &OpStep<'_>, state: &mut dyn StateReader) {
        let Self {
            nested,
            analyzers,
            graph,
            storage_pool,
            storage_index: _,
            chains,
            call_pool,
        } = self;
        let Some(call_id) = nested.current() else { return };

        // Phase 1: the previous operation's post-callbacks see its
        // post-state (the current step's stack) and finalize the mirror
        // push.
        for (ai, analyzer) in analyzers.iter_mut().enumerate() {
            let taken = nested.arena.get_mut(call_id).data.frames[ai].pending.take();
            if let Some(mut pending) = taken {
                if let Some(after) = pending.after.take() {
                    let frame = &mut nested.arena.get_mut(call_id).data.frames[ai];
                    let mut cx = AfterCx {
                        graph: &mut *graph,
                        stack: step.stack,
                        memory: &mut frame.memory,
                        chain: &mut chains[ai],
                        calls: &mut *call_pool,
                        results: &mut pending.results,
                    };
                    after(&mut **analyzer, &mut cx);
                }
                nested.arena.get_mut(call_id).data.frames[ai]
                    .stack
                    .push_all(pending.results);
            }
        }

        nested.capture_state(step, state);

        let (pops, pushes) = opcode::stack_effects(step.op);
        if step.stack.len() < pops {
            // The real EVM faults on this opcode; nothing flows.
            return;
        }

        // Phase 2: snapshot operands, pop the mirror stack, dispatch.
        let loc = match nested.arena.get(call_id).current_location.clone() {
            Some(loc) => loc,
            None => return,
        };
        let mut args = vec![U256::ZERO; pops];
        for i in 0..pops {
            args[pops - 1 - i] = step.stack_back(i);
        }
        let operation = Operation { loc, call: call_id, state_addr: step.state_addr, args };
        let op_id = graph.push_op(operation.clone());

        let child_pos_plain = nested.arena.gen_child_position(call_id, false);
        let child_pos_precompile = nested.arena.gen_child_position(call_id, true);
        let parent_site = nested.arena.get(call_id).parent.map(|p| {
            let parent = nested.arena.get(p);
            let pc = parent.current_location.as_ref().map(|l| l.pc + 1).unwrap_or_default();
            (parent.code_addr, pc)
        });

        for (ai, analyzer) in analyzers.iter_mut().enumerate() {
            let frame = &mut nested.arena.get_mut(call_id).data.frames[ai];
            let stack_args = frame.stack.pop_n(pops);
            let mut results = vec![None; pushes];
            let AnalyzerFrame { stack, memory, storage, call, child_call, pending } = frame;
            let mut cx = FlowCx {
                graph: &mut *graph,
                step,
                state: &mut *state,
                op: &operation,
                op_id,
                args: &stack_args,
                results: &mut results,
                stack,
                memory,
                storage: &mut storage_pool[*storage],
                chain: &mut chains[ai],
                calls: &mut *call_pool,
                call: *call,
                child_call,
                child_pos_plain: child_pos_plain.clone(),
                child_pos_precompile: child_pos_precompile.clone(),
                parent_site,
            };
            let after = analyzer.flow(&mut cx);
            *pending = Some(Pending { results, after });
        }
    }
}
