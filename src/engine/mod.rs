//! The transaction runner: applies (real or pseudo) transactions to a
//! state through revm, consulting the active tracer, and optionally
//! producing receipts.

pub mod forked;
pub mod memory;
pub mod state;
pub mod tx;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use alloy::primitives::Bloom;
use revm::interpreter::InstructionResult;
use revm::primitives::{
    Address, BlockEnv, Bytes, EVMError, ExecutionResult, HaltReason, InvalidTransaction, Log,
    SpecId, TransactTo, B256, U256,
};
use revm::Evm;
use tracing::info;

use crate::chain::{BlockchainReader, HeaderData};
use crate::error::{AdmissionError, EngineError, StateError};
use crate::tracing::{InspectorBridge, TxTracer};

pub use forked::ForkedState;
pub use memory::MemoryState;
pub use state::{StateOps, StateReader, VmState};
pub use tx::{AccessListEntry, Tx};

/// Gas pool of the debugging context; large enough for anything a test
/// deploys, small enough to keep fee arithmetic far from overflow.
const DEBUG_GAS_POOL: u64 = 500_000_000;

/// How an execution ended, collapsed from revm's result taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    Revert,
    OutOfGas,
    InvalidOpcode,
    StackUnderflow,
    StackOverflow,
    CallTooDeep,
    OutOfFunds,
    Other(String),
}

impl VmError {
    pub fn from_instruction_result(result: InstructionResult) -> Option<VmError> {
        use InstructionResult as I;
        match result {
            I::Continue | I::Stop | I::Return | I::SelfDestruct => None,
            I::Revert => Some(VmError::Revert),
            I::OutOfGas | I::MemoryOOG | I::MemoryLimitOOG | I::PrecompileOOG
            | I::InvalidOperandOOG => Some(VmError::OutOfGas),
            I::OpcodeNotFound | I::InvalidFEOpcode => Some(VmError::InvalidOpcode),
            I::StackUnderflow => Some(VmError::StackUnderflow),
            I::StackOverflow => Some(VmError::StackOverflow),
            I::CallTooDeep => Some(VmError::CallTooDeep),
            I::OutOfFunds => Some(VmError::OutOfFunds),
            other => Some(VmError::Other(format!("{other:?}"))),
        }
    }

    pub fn from_halt(reason: &HaltReason) -> VmError {
        match reason {
            HaltReason::OutOfGas(_) => VmError::OutOfGas,
            HaltReason::OpcodeNotFound | HaltReason::InvalidFEOpcode => VmError::InvalidOpcode,
            HaltReason::StackUnderflow => VmError::StackUnderflow,
            HaltReason::StackOverflow => VmError::StackOverflow,
            HaltReason::CallTooDeep => VmError::CallTooDeep,
            HaltReason::OutOfFunds => VmError::OutOfFunds,
            other => VmError::Other(format!("{other:?}")),
        }
    }
}

/// Result of executing one message (or one pseudo transaction).
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub return_data: Bytes,
    pub gas_used: u64,
    pub error: Option<VmError>,
    pub logs: Vec<Log>,
}

impl ExecResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn out_of_gas(&self) -> bool {
        matches!(self.error, Some(VmError::OutOfGas))
    }
}

#[derive(Debug, Clone)]
pub struct Receipt {
    pub tx_type: u8,
    pub post_state: Bytes,
    pub status: bool,
    pub cumulative_gas_used: u64,
    pub tx_hash: B256,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    pub logs: Vec<Log>,
    pub bloom: Bloom,
    pub transaction_index: usize,
    pub block_hash: B256,
    pub block_number: u64,
}

/// Block-level context a transaction executes in, plus the remaining gas
/// pool and the running transaction index. Cloning yields an independent
/// gas pool.
#[derive(Debug, Clone)]
pub struct VmContext {
    pub coinbase: Address,
    pub block_number: u64,
    pub difficulty: U256,
    pub prevrandao: Option<B256>,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub base_fee: Option<U256>,
    pub block_hash: B256,

    pub gas_pool: u64,
    pub gas_used: u64,
    pub tx_index: usize,
}

impl VmContext {
    pub fn from_header(header: &HeaderData) -> Self {
        Self {
            coinbase: header.coinbase,
            block_number: header.number,
            difficulty: header.difficulty,
            prevrandao: header.mix_hash,
            timestamp: header.timestamp,
            gas_limit: header.gas_limit,
            base_fee: header.base_fee,
            block_hash: header.hash,
            gas_pool: header.gas_limit,
            gas_used: 0,
            tx_index: 0,
        }
    }

    /// An all-zero context with a large gas pool, for the debugging harness.
    pub fn debugging() -> Self {
        Self {
            coinbase: Address::ZERO,
            block_number: 0,
            difficulty: U256::ZERO,
            prevrandao: Some(B256::ZERO),
            timestamp: 0,
            gas_limit: DEBUG_GAS_POOL,
            base_fee: None,
            block_hash: B256::ZERO,
            gas_pool: DEBUG_GAS_POOL,
            gas_used: 0,
            tx_index: 0,
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub chain_id: u64,
    /// Fixed EVM revision; when `None`, the mainnet fork schedule is
    /// applied per block.
    pub spec: Option<SpecId>,

    pub no_base_fee: bool,
    pub bypass_nonce_and_sender_check: bool,
    pub cap_gas_to_block_limit: bool,
    pub force_zero_gas_price: bool,
    /// Raise the fee cap to the block base fee when it is below.
    pub regulate_base_fee: bool,
}

impl VmConfig {
    pub fn mainnet() -> Self {
        Self {
            chain_id: 1,
            spec: None,
            no_base_fee: false,
            bypass_nonce_and_sender_check: false,
            cap_gas_to_block_limit: false,
            force_zero_gas_price: false,
            regulate_base_fee: false,
        }
    }

    /// All forks active, for harness states with no block history.
    pub fn debugging() -> Self {
        Self { spec: Some(SpecId::SHANGHAI), ..Self::mainnet() }
    }
}

/// Mainnet fork schedule.
pub fn mainnet_spec(block: u64, timestamp: u64) -> SpecId {
    if timestamp >= 1_710_338_135 {
        SpecId::CANCUN
    } else if timestamp >= 1_681_338_455 {
        SpecId::SHANGHAI
    } else if block >= 15_537_394 {
        SpecId::MERGE
    } else if block >= 12_965_000 {
        SpecId::LONDON
    } else if block >= 12_244_000 {
        SpecId::BERLIN
    } else if block >= 9_069_000 {
        SpecId::ISTANBUL
    } else if block >= 7_280_000 {
        SpecId::PETERSBURG
    } else if block >= 4_370_000 {
        SpecId::BYZANTIUM
    } else if block >= 2_675_000 {
        SpecId::SPURIOUS_DRAGON
    } else if block >= 2_463_000 {
        SpecId::TANGERINE
    } else if block >= 1_150_000 {
        SpecId::HOMESTEAD
    } else {
        SpecId::FRONTIER
    }
}

fn precompile_addresses(spec: SpecId) -> Vec<Address> {
    let count: u8 = if spec >= SpecId::ISTANBUL { 9 } else { 8 };
    (1..=count).map(Address::with_last_byte).collect()
}

#[derive(Debug, Clone)]
pub struct RejectedTx {
    pub index: usize,
    pub error: String,
}

/// The instrumented transaction runner.
pub struct ExeVM {
    pub config: VmConfig,
}

impl ExeVM {
    pub fn new(config: VmConfig) -> Self {
        Self { config }
    }

    pub fn new_debugging() -> Self {
        Self::new(VmConfig::debugging())
    }

    fn spec_for(&self, ctx: &VmContext) -> SpecId {
        self.config.spec.unwrap_or_else(|| mainnet_spec(ctx.block_number, ctx.timestamp))
    }

    /// Apply one transaction. The state is always left consistent: on any
    /// error the pre-transaction snapshot is restored.
    pub fn apply_tx<S: VmState>(
        &self,
        state: &mut S,
        tx: &Tx,
        ctx: &mut VmContext,
        commit: bool,
        gen_receipt: bool,
        tracer: Option<&mut dyn TxTracer>,
    ) -> Result<(ExecResult, Option<Receipt>), EngineError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.apply_tx_inner(state, tx, ctx, commit, gen_receipt, tracer)
        }));
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".into());
                let stack = std::backtrace::Backtrace::force_capture().to_string();
                Err(EngineError::TxExecution { msg, stack })
            }
        }
    }

    fn apply_tx_inner<S: VmState>(
        &self,
        state: &mut S,
        tx: &Tx,
        ctx: &mut VmContext,
        commit: bool,
        gen_receipt: bool,
        mut tracer: Option<&mut dyn TxTracer>,
    ) -> Result<(ExecResult, Option<Receipt>), EngineError> {
        // Pseudo transactions mutate state directly and produce no receipt.
        if tx.is_pseudo() {
            let snapshot = state.snapshot();
            let exec = tx.pseudo_exec().cloned();
            let result = match exec {
                Some(exec) => exec(state),
                None => Ok(Bytes::new()),
            };
            return match result {
                Ok(return_data) => {
                    state.discard_snapshots_from(snapshot);
                    Ok((
                        ExecResult { return_data, gas_used: 0, error: None, logs: Vec::new() },
                        None,
                    ))
                }
                Err(msg) => {
                    state.revert_to(snapshot);
                    Err(EngineError::Pseudo(msg))
                }
            };
        }

        let spec = self.spec_for(ctx);

        // Build the effective message, applying the runner flags.
        let mut gas = tx.gas_limit;
        if self.config.cap_gas_to_block_limit && gas > ctx.gas_pool {
            gas = ctx.gas_pool;
        }
        let mut gas_price = tx.gas_price;
        let mut priority_fee = tx.priority_fee;
        if self.config.force_zero_gas_price {
            gas_price = U256::ZERO;
        }
        if self.config.no_base_fee {
            gas_price = U256::ZERO;
            priority_fee = priority_fee.map(|_| U256::ZERO);
        }
        if self.config.regulate_base_fee {
            if let Some(base_fee) = ctx.base_fee {
                if gas_price < base_fee {
                    gas_price = base_fee;
                }
            }
        }

        state.prepare(tx.hash(), ctx.tx_index);
        state.prepare_access_list(tx.from, tx.to, &precompile_addresses(spec), &tx.access_list);

        let snapshot = state.snapshot();
        if let Some(t) = tracer.as_deref_mut() {
            t.transaction_start(tx, ctx, state);
        }

        let transact_result = {
            let chain_id = self.config.chain_id;
            let bypass_nonce = self.config.bypass_nonce_and_sender_check;
            let no_base_fee = self.config.no_base_fee;
            let env_ctx = &*ctx;
            let cfg_f = move |cfg: &mut revm::primitives::CfgEnv| {
                cfg.chain_id = chain_id;
                cfg.disable_eip3607 = true;
                cfg.limit_contract_code_size = None;
                cfg.disable_block_gas_limit = true;
                cfg.disable_base_fee = no_base_fee;
            };
            let block_f = move |block: &mut BlockEnv| {
                block.number = U256::from(env_ctx.block_number);
                block.coinbase = env_ctx.coinbase;
                block.timestamp = U256::from(env_ctx.timestamp);
                block.gas_limit = U256::from(env_ctx.gas_limit);
                block.basefee = env_ctx.base_fee.unwrap_or_default();
                block.difficulty = env_ctx.difficulty;
                block.prevrandao = Some(env_ctx.prevrandao.unwrap_or_default());
            };
            let tx_f = move |tx_env: &mut revm::primitives::TxEnv| {
                tx_env.caller = tx.from;
                tx_env.transact_to = match tx.to {
                    Some(addr) => TransactTo::Call(addr),
                    None => TransactTo::Create,
                };
                tx_env.data = tx.input.clone();
                tx_env.value = tx.value;
                tx_env.gas_limit = gas;
                tx_env.gas_price = gas_price;
                tx_env.gas_priority_fee = priority_fee;
                tx_env.nonce = if bypass_nonce { None } else { Some(tx.nonce) };
                tx_env.chain_id = None;
                tx_env.access_list = tx
                    .access_list
                    .iter()
                    .map(|e| revm::primitives::AccessListItem {
                        address: e.address,
                        storage_keys: e.storage_keys.clone(),
                    })
                    .collect();
            };

            match tracer.as_deref_mut() {
                Some(t) => {
                    let mut bridge = InspectorBridge::new(t);
                    let mut evm = Evm::builder()
                        .with_db(&mut *state)
                        .with_external_context(&mut bridge)
                        .append_handler_register(revm::inspector_handle_register)
                        .with_spec_id(spec)
                        .modify_cfg_env(cfg_f)
                        .modify_block_env(block_f)
                        .modify_tx_env(tx_f)
                        .build();
                    evm.transact()
                }
                None => {
                    let mut evm = Evm::builder()
                        .with_db(&mut *state)
                        .with_spec_id(spec)
                        .modify_cfg_env(cfg_f)
                        .modify_block_env(block_f)
                        .modify_tx_env(tx_f)
                        .build();
                    evm.transact()
                }
            }
        };

        let res = match transact_result {
            Ok(res) => res,
            Err(err) => {
                state.revert_to(snapshot);
                return Err(map_evm_error(err));
            }
        };
        if let Some(err) = state.take_last_error() {
            state.revert_to(snapshot);
            return Err(EngineError::State(err));
        }
        state.discard_snapshots_from(snapshot);

        let result = exec_result_from(&res.result);
        state.commit(res.state);

        ctx.gas_used += result.gas_used;
        ctx.gas_pool = ctx.gas_pool.saturating_sub(result.gas_used);

        let receipt = if gen_receipt {
            let mut bloom = Bloom::ZERO;
            for log in &result.logs {
                bloom.accrue_log(log);
            }
            Some(Receipt {
                tx_type: tx.tx_type,
                post_state: Bytes::new(),
                status: !result.failed(),
                cumulative_gas_used: ctx.gas_used,
                tx_hash: tx.hash(),
                gas_used: result.gas_used,
                contract_address: tx.is_creation().then(|| tx.from.create(tx.nonce)),
                logs: result.logs.clone(),
                bloom,
                transaction_index: ctx.tx_index,
                block_hash: ctx.block_hash,
                block_number: ctx.block_number,
            })
        } else {
            None
        };

        ctx.tx_index += 1;

        if commit {
            state.finalise(true);
        }

        if let Some(t) = tracer.as_deref_mut() {
            t.transaction_end(tx, ctx, state, &result, receipt.as_ref());
        }

        Ok((result, receipt))
    }

    /// Apply a batch, collecting rejected entries instead of aborting.
    pub fn apply_transactions<S: VmState>(
        &self,
        state: &mut S,
        txs: &[Tx],
        ctx: &mut VmContext,
        commit: bool,
        gen_receipt: bool,
    ) -> (Vec<Tx>, Vec<Receipt>, Vec<RejectedTx>) {
        let mut included = Vec::new();
        let mut receipts = Vec::new();
        let mut rejected = Vec::new();
        for (i, tx) in txs.iter().enumerate() {
            match self.apply_tx(state, tx, ctx, false, gen_receipt, None) {
                Ok((_, receipt)) => {
                    included.push(tx.clone());
                    if let Some(r) = receipt {
                        receipts.push(r);
                    }
                }
                Err(err) => {
                    info!(index = i, tx = %tx.hash(), error = %err, "rejected tx");
                    rejected.push(RejectedTx { index: i, error: err.to_string() });
                }
            }
        }
        if commit {
            state.finalise(true);
        }
        (included, receipts, rejected)
    }

    /// Execute a call with minimal information. Used to prepare harness
    /// states by deploying and invoking contracts; commits and produces a
    /// receipt.
    pub fn debugging_call<S: VmState>(
        &self,
        state: &mut S,
        ctx: &mut VmContext,
        from: Address,
        to: Option<Address>,
        value: U256,
        data: Bytes,
        tracer: Option<&mut dyn TxTracer>,
    ) -> Result<(ExecResult, Option<Receipt>), EngineError> {
        let nonce = state.nonce_of(from);
        let tx = Tx::unsigned(from, to, nonce, value, ctx.gas_pool, data);
        self.apply_tx(state, &tx, ctx, true, true, tracer)
    }
}

fn exec_result_from(result: &ExecutionResult) -> ExecResult {
    match result {
        ExecutionResult::Success { gas_used, logs, output, .. } => ExecResult {
            return_data: output.data().clone(),
            gas_used: *gas_used,
            error: None,
            logs: logs.clone(),
        },
        ExecutionResult::Revert { gas_used, output } => ExecResult {
            return_data: output.clone(),
            gas_used: *gas_used,
            error: Some(VmError::Revert),
            logs: Vec::new(),
        },
        ExecutionResult::Halt { reason, gas_used } => ExecResult {
            return_data: Bytes::new(),
            gas_used: *gas_used,
            error: Some(VmError::from_halt(reason)),
            logs: Vec::new(),
        },
    }
}

fn map_evm_error(err: EVMError<StateError>) -> EngineError {
    match err {
        EVMError::Transaction(tx_err) => EngineError::Admission(map_invalid_tx(tx_err)),
        EVMError::Database(db_err) => EngineError::State(db_err),
        EVMError::Header(h) => EngineError::Header(format!("{h:?}")),
        other => EngineError::Admission(AdmissionError::Other(format!("{other:?}"))),
    }
}

fn map_invalid_tx(err: InvalidTransaction) -> AdmissionError {
    match err {
        InvalidTransaction::LackOfFundForMaxFee { .. } => AdmissionError::InsufficientFunds,
        InvalidTransaction::CallGasCostMoreThanGasLimit => AdmissionError::IntrinsicGas,
        InvalidTransaction::NonceTooHigh { tx, state } => AdmissionError::Nonce { tx, state },
        InvalidTransaction::NonceTooLow { tx, state } => AdmissionError::Nonce { tx, state },
        other => AdmissionError::Other(format!("{other:?}")),
    }
}

/// Build the state/context pivot for the transaction at (block, index):
/// fork at block − 1 and replay the in-block prefix.
pub fn prepare_state_and_context(
    reader: Arc<dyn BlockchainReader>,
    block_number: u64,
    tx_index: usize,
    config: &VmConfig,
) -> Result<(ForkedState, VmContext), EngineError> {
    let mut state = ForkedState::new(Arc::clone(&reader), Some(block_number.saturating_sub(1)))?;
    let block = reader
        .block_by_number(Some(block_number))
        .map_err(StateError::Provider)?;
    let mut ctx = VmContext::from_header(&block.header);
    if tx_index == 0 {
        return Ok((state, ctx));
    }
    let exe = ExeVM::new(config.clone());
    let prefix = &block.transactions[..tx_index.min(block.transactions.len())];
    let (_, _, rejected) = exe.apply_transactions(&mut state, prefix, &mut ctx, false, false);
    for r in &rejected {
        info!(block = block_number, index = r.index, error = %r.error, "prefix tx rejected");
    }
    Ok((state, ctx))
}
