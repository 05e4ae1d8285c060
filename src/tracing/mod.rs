//! Transaction tracing: the [`TxTracer`] callback interface, the adapter
//! that drives it from revm's inspector hooks, and the nested-call tracers
//! built on top of it.

pub mod location;
pub mod msg_call;
pub mod nested;
pub mod position;

use revm::interpreter::{
    CallInputs, CallOutcome, CallScheme, CallValue, CreateInputs, CreateOutcome, Interpreter,
};
use revm::primitives::{Address, Bytes, CreateScheme, B256, U256};
use revm::{Database, EvmContext, Inspector};

use crate::engine::state::StateReader;
use crate::engine::tx::Tx;
use crate::engine::{ExecResult, Receipt, VmContext, VmError};
use crate::opcode;

/// A view of one opcode about to execute: the pre-state of the operation.
/// The same view shape is handed to post-callbacks, then showing the
/// post-state of the previous operation on the frame.
#[derive(Debug, Clone, Copy)]
pub struct OpStep<'a> {
    pub pc: u64,
    pub op: u8,
    /// Remaining gas before this opcode executes.
    pub gas: u64,
    /// Static base cost; dynamic components are not modelled.
    pub cost: u64,
    /// The full EVM stack, top of stack at the end.
    pub stack: &'a [U256],
    /// The current call frame's memory.
    pub memory: &'a [u8],
    pub code_addr: Address,
    pub state_addr: Address,
}

impl<'a> OpStep<'a> {
    /// The i-th stack operand counting from the top.
    pub fn stack_back(&self, i: usize) -> U256 {
        self.stack[self.stack.len() - 1 - i]
    }

    pub fn stack_back_addr(&self, i: usize) -> Address {
        Address::from_slice(&self.stack_back(i).to_be_bytes::<32>()[12..])
    }

    pub fn stack_back_b256(&self, i: usize) -> B256 {
        B256::from(self.stack_back(i))
    }

    /// Copy a memory slice, zero-padded past the current memory size.
    pub fn memory_slice(&self, offset: u64, len: u64) -> Vec<u8> {
        memory_slice_padded(self.memory, offset, len)
    }
}

pub fn memory_slice_padded(memory: &[u8], offset: u64, len: u64) -> Vec<u8> {
    let len = len as usize;
    let mut out = vec![0u8; len];
    let offset = offset as usize;
    if offset < memory.len() {
        let end = memory.len().min(offset + len);
        out[..end - offset].copy_from_slice(&memory[offset..end]);
    }
    out
}

/// Parameters of a message call being entered.
#[derive(Debug, Clone)]
pub struct EnterFrame {
    pub op: u8,
    pub from: Address,
    pub to: Address,
    pub input: Bytes,
    pub gas: u64,
    /// The transferred value; zero for static and delegate calls.
    pub value: U256,
}

/// Callbacks driven by the transaction runner and the EVM.
///
/// `capture_state` fires before each opcode executes with that opcode's
/// pre-state; `capture_enter`/`capture_exit` bracket nested message calls
/// (including precompile calls, which see no `capture_state` in between);
/// `transaction_start`/`transaction_end` bracket the whole transaction.
pub trait TxTracer {
    fn transaction_start(&mut self, tx: &Tx, ctx: &VmContext, state: &mut dyn StateReader);

    fn transaction_end(
        &mut self,
        tx: &Tx,
        ctx: &VmContext,
        state: &mut dyn StateReader,
        result: &ExecResult,
        receipt: Option<&Receipt>,
    );

    fn capture_enter(&mut self, frame: &EnterFrame, state: &mut dyn StateReader);

    fn capture_exit(&mut self, output: &Bytes, gas_used: u64, error: Option<VmError>);

    fn capture_state(&mut self, step: &OpStep<'_>, state: &mut dyn StateReader);
}

/// A tracer that records nothing.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl TxTracer for NoopTracer {
    fn transaction_start(&mut self, _: &Tx, _: &VmContext, _: &mut dyn StateReader) {}
    fn transaction_end(
        &mut self,
        _: &Tx,
        _: &VmContext,
        _: &mut dyn StateReader,
        _: &ExecResult,
        _: Option<&Receipt>,
    ) {
    }
    fn capture_enter(&mut self, _: &EnterFrame, _: &mut dyn StateReader) {}
    fn capture_exit(&mut self, _: &Bytes, _: u64, _: Option<VmError>) {}
    fn capture_state(&mut self, _: &OpStep<'_>, _: &mut dyn StateReader) {}
}

/// Runs several tracers over the same execution, in order.
pub struct CombinedTracer<'a> {
    tracers: Vec<&'a mut dyn TxTracer>,
}

impl<'a> CombinedTracer<'a> {
    pub fn new(tracers: Vec<&'a mut dyn TxTracer>) -> Self {
        Self { tracers }
    }
}

impl TxTracer for CombinedTracer<'_> {
    fn transaction_start(&mut self, tx: &Tx, ctx: &VmContext, state: &mut dyn StateReader) {
        for t in &mut self.tracers {
            t.transaction_start(tx, ctx, state);
        }
    }

    fn transaction_end(
        &mut self,
        tx: &Tx,
        ctx: &VmContext,
        state: &mut dyn StateReader,
        result: &ExecResult,
        receipt: Option<&Receipt>,
    ) {
        for t in &mut self.tracers {
            t.transaction_end(tx, ctx, state, result, receipt);
        }
    }

    fn capture_enter(&mut self, frame: &EnterFrame, state: &mut dyn StateReader) {
        for t in &mut self.tracers {
            t.capture_enter(frame, state);
        }
    }

    fn capture_exit(&mut self, output: &Bytes, gas_used: u64, error: Option<VmError>) {
        for t in &mut self.tracers {
            t.capture_exit(output, gas_used, error.clone());
        }
    }

    fn capture_state(&mut self, step: &OpStep<'_>, state: &mut dyn StateReader) {
        for t in &mut self.tracers {
            t.capture_state(step, state);
        }
    }
}

/// Reads through the EVM's journaled state first, falling back to the
/// backing database. This is the view tracers get mid-transaction.
struct JournalReader<'a, DB: Database> {
    ctx: &'a mut EvmContext<DB>,
}

impl<DB: Database> JournalReader<'_, DB> {
    fn journal_info(&self, addr: &Address) -> Option<&revm::primitives::AccountInfo> {
        self.ctx.inner.journaled_state.state.get(addr).map(|a| &a.info)
    }
}

impl<DB: Database> StateReader for JournalReader<'_, DB> {
    fn balance_of(&mut self, addr: Address) -> U256 {
        if let Some(info) = self.journal_info(&addr) {
            return info.balance;
        }
        self.ctx
            .inner
            .db
            .basic(addr)
            .ok()
            .flatten()
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    fn nonce_of(&mut self, addr: Address) -> u64 {
        if let Some(info) = self.journal_info(&addr) {
            return info.nonce;
        }
        self.ctx
            .inner
            .db
            .basic(addr)
            .ok()
            .flatten()
            .map(|a| a.nonce)
            .unwrap_or_default()
    }

    fn code_of(&mut self, addr: Address) -> Bytes {
        if let Some(acc) = self.ctx.inner.journaled_state.state.get(&addr) {
            if let Some(code) = &acc.info.code {
                return code.original_bytes();
            }
            let hash = acc.info.code_hash;
            return self
                .ctx
                .inner
                .db
                .code_by_hash(hash)
                .map(|c| c.original_bytes())
                .unwrap_or_default();
        }
        self.ctx
            .inner
            .db
            .basic(addr)
            .ok()
            .flatten()
            .and_then(|a| a.code.map(|c| c.original_bytes()))
            .unwrap_or_default()
    }

    fn code_hash_of(&mut self, addr: Address) -> B256 {
        if let Some(info) = self.journal_info(&addr) {
            return info.code_hash;
        }
        self.ctx
            .inner
            .db
            .basic(addr)
            .ok()
            .flatten()
            .map(|a| a.code_hash)
            .unwrap_or(revm::primitives::KECCAK_EMPTY)
    }

    fn storage_value(&mut self, addr: Address, slot: B256) -> B256 {
        let key: U256 = slot.into();
        if let Some(acc) = self.ctx.inner.journaled_state.state.get(&addr) {
            if let Some(s) = acc.storage.get(&key) {
                return B256::from(s.present_value());
            }
        }
        self.ctx
            .inner
            .db
            .storage(addr, key)
            .map(B256::from)
            .unwrap_or_default()
    }
}

/// Adapts a [`TxTracer`] to revm's [`Inspector`] hooks. The root frame is
/// handled by the runner's transaction_start/transaction_end; only nested
/// frames produce enter/exit callbacks.
pub struct InspectorBridge<'a> {
    tracer: &'a mut dyn TxTracer,
    depth: usize,
}

impl<'a> InspectorBridge<'a> {
    pub fn new(tracer: &'a mut dyn TxTracer) -> Self {
        Self { tracer, depth: 0 }
    }
}

impl<DB: Database> Inspector<DB> for InspectorBridge<'_> {
    fn step(&mut self, interp: &mut Interpreter, context: &mut EvmContext<DB>) {
        let op = interp.current_opcode();
        let contract = &interp.contract;
        let step = OpStep {
            pc: interp.program_counter() as u64,
            op,
            gas: interp.gas.remaining(),
            cost: opcode::base_gas(op),
            stack: interp.stack().data(),
            memory: interp.shared_memory.context_memory(),
            code_addr: contract.bytecode_address.unwrap_or(contract.target_address),
            state_addr: contract.target_address,
        };
        let mut reader = JournalReader { ctx: context };
        self.tracer.capture_state(&step, &mut reader);
    }

    fn call(&mut self, context: &mut EvmContext<DB>, inputs: &mut CallInputs) -> Option<CallOutcome> {
        self.depth += 1;
        if self.depth == 1 {
            // Root frame: already announced by transaction_start.
            return None;
        }
        let (op, from, to) = match inputs.scheme {
            CallScheme::Call => (opcode::CALL, inputs.caller, inputs.target_address),
            CallScheme::StaticCall => (opcode::STATICCALL, inputs.caller, inputs.target_address),
            CallScheme::CallCode => (opcode::CALLCODE, inputs.target_address, inputs.bytecode_address),
            CallScheme::DelegateCall => {
                (opcode::DELEGATECALL, inputs.target_address, inputs.bytecode_address)
            }
            _ => (opcode::CALL, inputs.caller, inputs.target_address),
        };
        let value = match inputs.value {
            CallValue::Transfer(v) => v,
            CallValue::Apparent(_) => U256::ZERO,
        };
        let frame = EnterFrame {
            op,
            from,
            to,
            input: inputs.input.clone(),
            gas: inputs.gas_limit,
            value,
        };
        let mut reader = JournalReader { ctx: context };
        self.tracer.capture_enter(&frame, &mut reader);
        None
    }

    fn call_end(
        &mut self,
        _context: &mut EvmContext<DB>,
        _inputs: &CallInputs,
        outcome: CallOutcome,
    ) -> CallOutcome {
        if self.depth > 1 {
            let error = VmError::from_instruction_result(outcome.result.result);
            self.tracer
                .capture_exit(&outcome.result.output, outcome.result.gas.spent(), error);
        }
        self.depth -= 1;
        outcome
    }

    fn create(
        &mut self,
        context: &mut EvmContext<DB>,
        inputs: &mut CreateInputs,
    ) -> Option<CreateOutcome> {
        self.depth += 1;
        if self.depth == 1 {
            return None;
        }
        let mut reader = JournalReader { ctx: context };
        let nonce = reader.nonce_of(inputs.caller);
        let created = inputs.created_address(nonce);
        let op = match inputs.scheme {
            CreateScheme::Create => opcode::CREATE,
            CreateScheme::Create2 { .. } => opcode::CREATE2,
        };
        let frame = EnterFrame {
            op,
            from: inputs.caller,
            to: created,
            input: inputs.init_code.clone(),
            gas: inputs.gas_limit,
            value: inputs.value,
        };
        self.tracer.capture_enter(&frame, &mut reader);
        None
    }

    fn create_end(
        &mut self,
        _context: &mut EvmContext<DB>,
        _inputs: &CreateInputs,
        outcome: CreateOutcome,
    ) -> CreateOutcome {
        if self.depth > 1 {
            let error = VmError::from_instruction_result(outcome.result.result);
            self.tracer
                .capture_exit(&outcome.result.output, outcome.result.gas.spent(), error);
        }
        self.depth -= 1;
        outcome
    }
}
