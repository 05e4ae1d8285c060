//! The nested-call tracer: maintains the message-call tree, the current
//! program location, and (optionally) the per-call block-path
//! decomposition.

use revm::primitives::Bytes;

use crate::engine::state::StateReader;
use crate::engine::tx::Tx;
use crate::engine::{ExecResult, Receipt, VmContext, VmError};
use crate::opcode;
use crate::tracing::location::{is_block_head, is_block_tail, TraceBlock, TraceLocation};
use crate::tracing::msg_call::{CallArena, CallId, CallerInfo};
use crate::tracing::position::CallPosition;
use crate::tracing::{EnterFrame, OpStep, TxTracer};

/// Tracks the call tree of one transaction. `record_blocks` additionally
/// decomposes each call's execution into the alternating block-path
/// described by [`crate::tracing::msg_call::MsgCall::block_paths`].
#[derive(Debug)]
pub struct NestedCallTracer<D> {
    pub arena: CallArena<D>,
    stack: Vec<CallId>,
    total_ops: usize,
    record_blocks: bool,
    root: Option<CallId>,
}

impl<D: Default> NestedCallTracer<D> {
    pub fn new(record_blocks: bool) -> Self {
        Self {
            arena: CallArena::new(),
            stack: Vec::new(),
            total_ops: 0,
            record_blocks,
            root: None,
        }
    }

    pub fn current(&self) -> Option<CallId> {
        self.stack.last().copied()
    }

    pub fn root(&self) -> Option<CallId> {
        self.root
    }

    pub fn total_operations(&self) -> usize {
        self.total_ops
    }

    pub fn into_arena(self) -> CallArena<D> {
        self.arena
    }

    fn close_open_block(&mut self, id: CallId) {
        let call = self.arena.get_mut(id);
        if let Some(block) = call.open_block.take() {
            call.block_paths.last_mut().expect("segment").push(block);
        }
    }

    fn record_block_step(&mut self, id: CallId, loc: &TraceLocation, state_addr: revm::primitives::Address) {
        let call = self.arena.get_mut(id);
        let starts_block = is_block_head(call.last_location.as_ref(), loc);
        if starts_block {
            if let Some(done) = call.open_block.take() {
                call.block_paths.last_mut().expect("segment").push(done);
            }
            call.open_block = Some(TraceBlock {
                content: vec![loc.clone()],
                state_addr,
                code_addr: loc.code_addr,
            });
            if is_block_tail(loc) {
                // single-instruction block
                let done = call.open_block.take().expect("just opened");
                call.block_paths.last_mut().expect("segment").push(done);
            }
        } else if is_block_tail(loc) {
            debug_assert!(call.open_block.is_some(), "block tail outside of basic block");
            let mut block = call.open_block.take().unwrap_or_else(|| TraceBlock {
                content: Vec::new(),
                state_addr,
                code_addr: loc.code_addr,
            });
            block.content.push(loc.clone());
            call.block_paths.last_mut().expect("segment").push(block);
        } else {
            debug_assert!(call.open_block.is_some(), "opcode outside of basic block");
            let block = call.open_block.get_or_insert_with(|| TraceBlock {
                content: Vec::new(),
                state_addr,
                code_addr: loc.code_addr,
            });
            block.content.push(loc.clone());
        }
        self.arena.get_mut(id).last_location = Some(loc.clone());
    }
}

impl<D: Default> TxTracer for NestedCallTracer<D> {
    fn transaction_start(&mut self, tx: &Tx, _ctx: &VmContext, state: &mut dyn StateReader) {
        let (op, contract) = match tx.to {
            Some(to) => (opcode::CALL, to),
            // The created address is derived before any execution.
            None => (opcode::CREATE, tx.from.create(state.nonce_of(tx.from))),
        };
        let id = self.arena.push_call(
            None,
            CallPosition::root(),
            op,
            CallerInfo { code_addr: None, state_addr: tx.from, call_site: None },
            opcode::is_precompiled(&contract),
            contract,
            contract,
            tx.input.clone(),
            tx.value,
            D::default(),
        );
        self.stack.push(id);
        self.root = Some(id);
    }

    fn transaction_end(
        &mut self,
        _tx: &Tx,
        _ctx: &VmContext,
        _state: &mut dyn StateReader,
        result: &ExecResult,
        receipt: Option<&Receipt>,
    ) {
        let Some(&id) = self.stack.last() else { return };
        if self.record_blocks {
            self.close_open_block(id);
        }
        let call = self.arena.get_mut(id);
        call.result = Some(result.clone());
        call.receipt = receipt.cloned();
    }

    fn capture_enter(&mut self, frame: &EnterFrame, _state: &mut dyn StateReader) {
        let Some(&parent) = self.stack.last() else { return };
        if self.record_blocks {
            // The call-site opcode closed the parent's current block; the
            // instructions after the child resume in a fresh segment.
            self.arena.get_mut(parent).block_paths.push(Vec::new());
        }
        let state_addr = match frame.op {
            opcode::CALLCODE | opcode::DELEGATECALL => frame.from,
            _ => frame.to,
        };
        let precompiled = opcode::is_precompiled(&frame.to);
        let position = self.arena.gen_child_position(parent, precompiled);
        let parent_call = self.arena.get(parent);
        let caller = CallerInfo {
            code_addr: Some(parent_call.code_addr),
            state_addr: parent_call.state_addr,
            call_site: parent_call.current_location.clone(),
        };
        let id = self.arena.push_call(
            Some(parent),
            position,
            frame.op,
            caller,
            precompiled,
            frame.to,
            state_addr,
            frame.input.clone(),
            frame.value,
            D::default(),
        );
        self.stack.push(id);
    }

    fn capture_exit(&mut self, output: &Bytes, gas_used: u64, error: Option<VmError>) {
        let Some(id) = self.stack.pop() else { return };
        if self.record_blocks {
            // An exceptional exit can leave a block open.
            self.close_open_block(id);
        }
        self.arena.get_mut(id).result = Some(ExecResult {
            return_data: output.clone(),
            gas_used,
            error,
            logs: Vec::new(),
        });
    }

    fn capture_state(&mut self, step: &OpStep<'_>, _state: &mut dyn StateReader) {
        let Some(&id) = self.stack.last() else { return };
        let loc = TraceLocation {
            position: self.arena.get(id).position.clone(),
            code_addr: step.code_addr,
            pc: step.pc,
            op: step.op,
            gas_available: step.gas,
            gas_cost: step.cost,
            index: self.total_ops,
        };
        self.total_ops += 1;
        self.arena.get_mut(id).current_location = Some(loc.clone());
        if self.record_blocks {
            self.record_block_step(id, &loc, step.state_addr);
        }
    }
}
