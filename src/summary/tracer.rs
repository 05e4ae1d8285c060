//! The summarizing tracer: collects defs, uses, transfers and profits per
//! message call, driven by opcode events.

use std::collections::HashMap;

use revm::primitives::{Bytes, B256, U256};

use crate::engine::state::StateReader;
use crate::engine::tx::Tx;
use crate::engine::{ExecResult, Receipt, VmContext, VmError};
use crate::opcode;
use crate::summary::state_var::StateVariable;
use crate::summary::transfer::{log_to_transfers, Transfer};
use crate::summary::{Config, PreValue, SummaryData, TxSummary};
use crate::tracing::nested::NestedCallTracer;
use crate::tracing::{EnterFrame, OpStep, TxTracer};

pub struct TxSummaryTracer {
    nested: NestedCallTracer<SummaryData>,
    config: Config,
    /// Variables written so far; a read is a use only when no earlier
    /// write covers the same variable (def-clear).
    defs: HashMap<String, StateVariable>,
    /// First-write pre-transaction values, for the root-level comparison
    /// that drops unchanged defs.
    pre_values: HashMap<String, PreValue>,
    summary: Option<TxSummary>,
}

impl TxSummaryTracer {
    pub fn new(config: Config) -> Self {
        Self {
            nested: NestedCallTracer::new(config.include_trace),
            config,
            defs: HashMap::new(),
            pre_values: HashMap::new(),
            summary: None,
        }
    }

    /// The finished summary; available after `transaction_end`.
    pub fn take_summary(&mut self) -> Option<TxSummary> {
        self.summary.take()
    }

    fn record_def(&mut self, call: usize, def: StateVariable, pre: PreValue) {
        let id = def.id();
        self.pre_values.entry(id.clone()).or_insert(pre);
        self.defs.insert(id, def.clone());
        self.nested.arena.get_mut(call).data.current_mut().defs.add_with_override([def]);
    }

    fn record_use(&mut self, call: usize, var: StateVariable) {
        if self.defs.contains_key(&var.id()) {
            return;
        }
        self.nested.arena.get_mut(call).data.current_mut().uses.add_if_absent([var]);
    }

    fn record_transfers(&mut self, call: usize, transfers: Vec<Transfer>) {
        let data = self.nested.arena.get_mut(call).data.current_mut();
        if self.config.include_profit {
            for t in &transfers {
                data.profits.add(t.profits());
            }
        }
        if self.config.include_transfer {
            data.transfers.extend(transfers);
        }
    }
}

impl TxTracer for TxSummaryTracer {
    fn transaction_start(&mut self, tx: &Tx, ctx: &VmContext, state: &mut dyn StateReader) {
        self.nested.transaction_start(tx, ctx, state);
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
        let Some(root) = self.nested.root() else { return };

        if self.config.include_trace {
            let paths = self.nested.arena.get(root).block_paths.clone();
            let call = self.nested.arena.get_mut(root);
            for (i, path) in paths.into_iter().enumerate() {
                while call.data.data.len() <= i {
                    call.data.add_segment();
                }
                call.data.data[i].execution_path = path;
            }
        }

        let succeeded = receipt.map_or(!result.failed(), |r| r.status);
        if !succeeded {
            // A reverted transaction only keeps its uses.
            self.nested.arena.get_mut(root).data.current_mut().clear_changes();
        } else if tx.value > U256::ZERO {
            let to = match tx.to {
                Some(to) => to,
                None => receipt.and_then(|r| r.contract_address).unwrap_or_default(),
            };
            if self.config.include_use {
                let balance = state.balance_of(tx.from).saturating_sub(tx.value);
                let var = StateVariable::balance(tx.from, balance, None);
                self.record_use(root, var);
            }
            if self.config.include_def {
                let from_balance = state.balance_of(tx.from);
                let to_balance = state.balance_of(to);
                self.record_def(
                    root,
                    StateVariable::balance(tx.from, from_balance, None),
                    PreValue::Balance(from_balance.saturating_add(tx.value)),
                );
                self.record_def(
                    root,
                    StateVariable::balance(to, to_balance, None),
                    PreValue::Balance(to_balance.saturating_sub(tx.value)),
                );
            }
            if self.config.include_transfer || self.config.include_profit {
                let transfer =
                    Transfer::Ether { from: tx.from, to, amount: tx.value, location: None };
                self.record_transfers(root, vec![transfer]);
            }
        }

        let nested = std::mem::replace(
            &mut self.nested,
            NestedCallTracer::new(self.config.include_trace),
        );
        let pre_values = std::mem::take(&mut self.pre_values);
        self.summary = Some(TxSummary::build(nested.into_arena(), root, pre_values));
    }

    fn capture_enter(&mut self, frame: &EnterFrame, state: &mut dyn StateReader) {
        let parent = self.nested.current();
        self.nested.capture_enter(frame, state);
        let Some(parent) = parent else { return };
        let Some(child) = self.nested.current() else { return };
        self.nested.arena.get_mut(parent).data.add_segment();

        if frame.value > U256::ZERO {
            let call_site = self.nested.arena.get(parent).current_location.clone();
            if self.config.include_def {
                let to_balance = state.balance_of(frame.to);
                let from_balance = state.balance_of(frame.from);
                self.record_def(
                    child,
                    StateVariable::balance(
                        frame.to,
                        to_balance.saturating_add(frame.value),
                        call_site.clone(),
                    ),
                    PreValue::Balance(to_balance),
                );
                self.record_def(
                    child,
                    StateVariable::balance(
                        frame.from,
                        from_balance.saturating_sub(frame.value),
                        call_site.clone(),
                    ),
                    PreValue::Balance(from_balance),
                );
            }
            if self.config.include_transfer || self.config.include_profit {
                let transfer = Transfer::Ether {
                    from: frame.from,
                    to: frame.to,
                    amount: frame.value,
                    location: call_site,
                };
                self.record_transfers(child, vec![transfer]);
            }
        }
    }

    fn capture_exit(&mut self, output: &Bytes, gas_used: u64, error: Option<VmError>) {
        let exited = self.nested.current();
        let failed = error.is_some();
        self.nested.capture_exit(output, gas_used, error);
        let Some(id) = exited else { return };

        if self.config.include_trace {
            let paths = self.nested.arena.get(id).block_paths.clone();
            let call = self.nested.arena.get_mut(id);
            for (i, path) in paths.into_iter().enumerate() {
                while call.data.data.len() <= i {
                    call.data.add_segment();
                }
                call.data.data[i].execution_path = path;
            }
        }
        if failed {
            // A reverted call exposes no defs, transfers or profits.
            self.nested.arena.get_mut(id).data.current_mut().clear_changes();
        }
    }

    fn capture_state(&mut self, step: &OpStep<'_>, state: &mut dyn StateReader) {
        self.nested.capture_state(step, state);
        let Some(call) = self.nested.current() else { return };
        let location = self.nested.arena.get(call).current_location.clone();

        if self.config.include_def && step.op == opcode::SSTORE {
            let contract = step.state_addr;
            let slot = step.stack_back_b256(0);
            let value = step.stack_back_b256(1);
            let pre = state.storage_value(contract, slot);
            self.record_def(
                call,
                StateVariable::storage(contract, slot, value, location.clone()),
                PreValue::Storage(pre),
            );
        }

        if self.config.include_use {
            match step.op {
                opcode::SLOAD => {
                    let contract = step.state_addr;
                    let slot = step.stack_back_b256(0);
                    let value = state.storage_value(contract, slot);
                    self.record_use(
                        call,
                        StateVariable::storage(contract, slot, value, location.clone()),
                    );
                }
                opcode::BALANCE => {
                    let account = step.stack_back_addr(0);
                    let value = state.balance_of(account);
                    self.record_use(call, StateVariable::balance(account, value, location.clone()));
                }
                opcode::SELFBALANCE => {
                    let account = step.state_addr;
                    let value = state.balance_of(account);
                    self.record_use(call, StateVariable::balance(account, value, location.clone()));
                }
                opcode::CODESIZE => {
                    let contract = step.code_addr;
                    let size = state.code_size_of(contract);
                    self.record_use(
                        call,
                        StateVariable::code_size(contract, step.op, size, location.clone()),
                    );
                }
                opcode::CODECOPY => {
                    let contract = step.code_addr;
                    let code = state.code_of(contract);
                    self.record_use(
                        call,
                        StateVariable::code_bytes(contract, step.op, code, location.clone()),
                    );
                }
                opcode::EXTCODESIZE => {
                    let contract = step.stack_back_addr(0);
                    let size = state.code_size_of(contract);
                    self.record_use(
                        call,
                        StateVariable::code_size(contract, step.op, size, location.clone()),
                    );
                }
                opcode::EXTCODECOPY => {
                    let contract = step.stack_back_addr(0);
                    let code = state.code_of(contract);
                    self.record_use(
                        call,
                        StateVariable::code_bytes(contract, step.op, code, location.clone()),
                    );
                }
                opcode::EXTCODEHASH => {
                    let contract = step.stack_back_addr(0);
                    let hash = state.code_hash_of(contract);
                    self.record_use(
                        call,
                        StateVariable::code_hash(contract, hash, location.clone()),
                    );
                }
                opcode::CALL => {
                    // An ether transfer reads the sender's balance.
                    if step.stack_back(2) > U256::ZERO {
                        let account = step.state_addr;
                        let value = state.balance_of(account);
                        self.record_use(
                            call,
                            StateVariable::balance(account, value, location.clone()),
                        );
                    }
                }
                _ => {}
            }
        }

        if (self.config.include_transfer || self.config.include_profit) && opcode::is_log(step.op) {
            let topic_count = (step.op - opcode::LOG0) as usize;
            let topics: Vec<B256> =
                (0..topic_count).map(|i| step.stack_back_b256(2 + i)).collect();
            let offset = step.stack_back(0).saturating_to::<u64>();
            let length = step.stack_back(1).saturating_to::<u64>();
            let data = step.memory_slice(offset, length);
            if let Ok(transfers) = log_to_transfers(step.state_addr, &topics, &data, location) {
                self.record_transfers(call, transfers);
            }
        }
    }
}
