//! Per-call execution summaries: defs, uses, transfers, profits and
//! execution paths, with interleaved aggregation over the call tree.

pub mod profit;
pub mod state_var;
pub mod tracer;
pub mod transfer;

use std::collections::HashMap;

use revm::primitives::{Address, B256, U256};

use crate::tracing::location::{Trace, TraceBlock};
use crate::tracing::msg_call::{CallArena, CallId, MsgCall};

pub use profit::{NotComparable, Profit, Profits};
pub use state_var::{StateVarKind, StateVariable, StateVariables};
pub use tracer::TxSummaryTracer;
pub use transfer::{log_to_transfers, AssetKind, MergeNotPossible, NotTransfer, Transfer};

/// What the summary tracer collects. All switches are monotonic additions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    pub include_def: bool,
    pub include_use: bool,
    pub include_transfer: bool,
    pub include_profit: bool,
    pub include_trace: bool,
}

impl Config {
    pub fn all() -> Self {
        Self {
            include_def: true,
            include_use: true,
            include_transfer: true,
            include_profit: true,
            include_trace: true,
        }
    }

    /// The configuration the attack search replays victims with.
    pub fn replay() -> Self {
        Self {
            include_transfer: true,
            include_profit: true,
            include_trace: true,
            ..Self::default()
        }
    }
}

/// Collected effects of one contiguous run of a call (between two of its
/// child calls).
#[derive(Debug, Clone, Default)]
pub struct Data {
    pub defs: StateVariables,
    pub uses: StateVariables,
    pub transfers: Vec<Transfer>,
    pub profits: Profits,
    pub execution_path: Vec<TraceBlock>,
}

impl Data {
    fn clear_changes(&mut self) {
        self.defs = StateVariables::new();
        self.transfers.clear();
        self.profits = Profits::new();
    }
}

/// Per-call summary payload stored in the message-call arena. `data[i]` is
/// the effects of the i-th run of this call; `data.len()` stays one ahead
/// of the number of children.
#[derive(Debug)]
pub struct SummaryData {
    pub data: Vec<Data>,
}

impl Default for SummaryData {
    fn default() -> Self {
        Self { data: vec![Data::default()] }
    }
}

impl SummaryData {
    pub fn current_mut(&mut self) -> &mut Data {
        self.data.last_mut().expect("summary data segment")
    }

    pub fn add_segment(&mut self) {
        self.data.push(Data::default());
    }
}

/// Pre-transaction value of a variable, captured at its first write.
#[derive(Debug, Clone)]
pub enum PreValue {
    Storage(B256),
    Balance(U256),
}

#[derive(Debug, Default)]
struct Overall {
    defs: StateVariables,
    uses: StateVariables,
    transfers: Vec<Transfer>,
    profits: Profits,
    path: Trace,
}

/// The finished summary of one transaction: the call tree with per-call
/// data and the precomputed per-call aggregations.
#[derive(Debug)]
pub struct TxSummary {
    pub arena: CallArena<SummaryData>,
    pub root: CallId,
    overall: Vec<Overall>,
}

impl TxSummary {
    pub(crate) fn build(
        arena: CallArena<SummaryData>,
        root: CallId,
        pre_values: HashMap<String, PreValue>,
    ) -> Self {
        let mut overall: Vec<Overall> = Vec::with_capacity(arena.len());
        overall.resize_with(arena.len(), Overall::default);
        let mut summary = Self { arena, root, overall };
        summary.fold(root);
        summary.subtract_unchanged_defs(root, &pre_values);
        summary
    }

    /// Interleaved post-order fold: at step i, even steps take the call's
    /// own data segment i/2, odd steps take child (i-1)/2's aggregate.
    fn fold(&mut self, id: CallId) {
        for child in self.arena.get(id).children.clone() {
            self.fold(child);
        }
        let call = self.arena.get(id);
        let failed = call.failed();
        let children = call.children.clone();
        let segments = call.data.data.len();
        let mut agg = Overall::default();
        for i in 0..(segments + children.len()) {
            if i % 2 == 0 {
                let Some(data) = self.arena.get(id).data.data.get(i / 2) else { continue };
                if !failed {
                    agg.defs.add_with_override(data.defs.0.clone());
                    agg.transfers.extend(data.transfers.iter().cloned());
                    agg.profits.add(data.profits.0.clone());
                }
                agg.uses.add_if_absent(data.uses.0.clone());
                agg.path.extend(data.execution_path.iter().cloned());
            } else {
                let child = children[(i - 1) / 2];
                let child_overall = &self.overall[child];
                if !failed {
                    agg.defs.add_with_override(child_overall.defs.0.clone());
                    agg.transfers.extend(child_overall.transfers.iter().cloned());
                    agg.profits.add(child_overall.profits.0.clone());
                }
                agg.uses.add_if_absent(child_overall.uses.0.clone());
                agg.path.extend(child_overall.path.iter().cloned());
            }
        }
        agg.profits = agg.profits.compact();
        self.overall[id] = agg;
    }

    /// At the root only, drop defined variables whose final value equals
    /// the pre-transaction value.
    fn subtract_unchanged_defs(&mut self, root: CallId, pre_values: &HashMap<String, PreValue>) {
        let kept: Vec<StateVariable> = self.overall[root]
            .defs
            .iter()
            .filter(|def| match (def, pre_values.get(&def.id())) {
                (StateVariable::Storage { value, .. }, Some(PreValue::Storage(pre))) => value != pre,
                (StateVariable::Balance { value, .. }, Some(PreValue::Balance(pre))) => value != pre,
                // Code defs and defs with no recorded pre value are kept.
                _ => true,
            })
            .cloned()
            .collect();
        self.overall[root].defs = StateVariables(kept);
    }

    pub fn root_call(&self) -> &MsgCall<SummaryData> {
        self.arena.get(self.root)
    }

    pub fn overall_defs(&self) -> &StateVariables {
        &self.overall[self.root].defs
    }

    pub fn overall_uses(&self) -> &StateVariables {
        &self.overall[self.root].uses
    }

    pub fn overall_profits(&self) -> &Profits {
        &self.overall[self.root].profits
    }

    pub fn overall_transfers(&self) -> &[Transfer] {
        &self.overall[self.root].transfers
    }

    pub fn overall_profits_of(&self, id: CallId) -> &Profits {
        &self.overall[id].profits
    }

    /// The whole transaction's execution path, caller blocks interleaved
    /// with child-call paths.
    pub fn flattened_execution_path(&self) -> &Trace {
        &self.overall[self.root].path
    }

    pub fn out_of_gas(&self) -> bool {
        self.arena.out_of_gas(self.root)
    }

    /// Every code address invoked by this transaction.
    pub fn all_invoked_addresses(&self) -> Vec<Address> {
        let mut seen = Vec::new();
        self.arena.walk(self.root, &mut |call| {
            if !seen.contains(&call.code_addr) {
                seen.push(call.code_addr);
            }
            false
        });
        seen
    }

    /// Sender and entry-contract state addresses of the root call.
    pub fn root_parties(&self) -> (Address, Address) {
        let root = self.root_call();
        (root.caller.state_addr, root.state_addr)
    }
}

/// Summarize one transaction on the given state and context with
/// everything collected. For custom configurations drive [`ExeVM`] with a
/// [`TxSummaryTracer`] directly.
pub fn summarize_tx<S: crate::engine::VmState>(
    state: &mut S,
    ctx: &mut crate::engine::VmContext,
    tx: &crate::engine::Tx,
) -> Result<TxSummary, crate::error::EngineError> {
    let mut config = crate::engine::VmConfig::mainnet();
    config.cap_gas_to_block_limit = true;
    config.regulate_base_fee = true;
    let exe = crate::engine::ExeVM::new(config);
    let mut tracer = TxSummaryTracer::new(Config::all());
    exe.apply_tx(state, tx, ctx, false, true, Some(&mut tracer))?;
    tracer.take_summary().ok_or(crate::error::EngineError::TxExecution {
        msg: "summary tracer produced no summary".into(),
        stack: String::new(),
    })
}

/// Summarize an on-chain transaction at its original position: fork at
/// its block, replay the in-block prefix and summarize the transaction.
pub fn summarize_tx_by_hash(
    reader: std::sync::Arc<dyn crate::chain::BlockchainReader>,
    tx_hash: revm::primitives::B256,
) -> Result<TxSummary, crate::error::EngineError> {
    use crate::error::StateError;
    let receipt = reader.transaction_receipt(tx_hash).map_err(StateError::Provider)?;
    let tx = reader.transaction_by_hash(tx_hash).map_err(StateError::Provider)?;
    let config = crate::engine::VmConfig::mainnet();
    let (mut state, mut ctx) = crate::engine::prepare_state_and_context(
        reader,
        receipt.block_number,
        receipt.transaction_index as usize,
        &config,
    )?;
    summarize_tx(&mut state, &mut ctx, &tx)
}
