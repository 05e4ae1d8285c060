//! Transaction history: per-block replay records with their state/context
//! pivots, the happen-before graph, and windowed sessions over it.
//!
//! Each block's records end with a pseudo transaction crediting the block
//! reward, which keeps the transaction index space faithful without
//! running the EVM.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use revm::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::chain::BlockchainReader;
use crate::engine::tx::Tx;
use crate::engine::{ExeVM, ForkedState, VmContext, VmState};
use crate::error::SearchError;
use crate::hunt::verify::VerifierCache;
use crate::hunt::{attack_search_vm_config, SearchContext};
use crate::summary::{Config, TxSummary, TxSummaryTracer};

/// Global position of a transaction, ordered by (block, index).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxPosition {
    pub block: u64,
    pub index: u64,
}

impl std::fmt::Display for TxPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block, self.index)
    }
}

pub const ZERO_TX_POSITION: TxPosition = TxPosition { block: 0, index: 0 };

/// One transaction of the history: the pivot (state and context in which
/// it executed), the transaction itself, its summary and any replay error.
pub struct TxRecord {
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_index: u64,
    /// State just before this transaction.
    pub state: ForkedState,
    /// Context just before this transaction.
    pub ctx: VmContext,
    pub tx: Tx,
    pub summary: Option<TxSummary>,
    pub error: Option<String>,
    /// Set when some contract invoked by this transaction is known to be
    /// unverified; such transactions are skipped as victims.
    pub some_contracts_non_verified: bool,

    involved: OnceLock<Vec<Address>>,
}

impl TxRecord {
    pub fn position(&self) -> TxPosition {
        if self.tx.is_pseudo() {
            if let Some(payload) = self.tx.pseudo_payload() {
                if let Ok(pos) = serde_json::from_slice::<TxPosition>(payload) {
                    return pos;
                }
            }
        }
        TxPosition { block: self.block_number, index: self.tx_index }
    }

    pub fn is_pseudo(&self) -> bool {
        self.tx.is_pseudo()
    }

    /// Every state address touched as a caller or callee.
    pub fn involved_addresses(&self) -> &[Address] {
        self.involved.get_or_init(|| {
            let Some(summary) = &self.summary else { return Vec::new() };
            let mut seen = Vec::new();
            summary.arena.walk(summary.root, &mut |call| {
                for addr in [call.caller.state_addr, call.state_addr] {
                    if !seen.contains(&addr) {
                        seen.push(addr);
                    }
                }
                false
            });
            seen
        })
    }

    /// Whether the two transactions touch at least one common account.
    pub fn naive_overlap_with(&self, other: &TxRecord) -> bool {
        if self.is_pseudo() {
            return false;
        }
        let mine = self.involved_addresses();
        other.involved_addresses().iter().any(|a| mine.contains(a))
    }
}

pub type BlockRecords = Vec<Arc<TxRecord>>;

#[derive(Default)]
struct BlockCell {
    records: OnceLock<Arc<BlockRecords>>,
}

/// Block-level reward of the pre-merge eras; zero after the merge.
fn block_reward(block: u64) -> U256 {
    let eth = U256::from(10).pow(U256::from(18));
    if block >= 15_537_394 {
        U256::ZERO
    } else if block >= 7_280_000 {
        U256::from(2) * eth
    } else if block >= 4_370_000 {
        U256::from(3) * eth
    } else {
        U256::from(5) * eth
    }
}

/// Process-wide history cache. Blocks are computed once (single-flight via
/// the per-block cell) and shared read-only afterwards.
pub struct TxHistory {
    reader: Arc<dyn BlockchainReader>,
    verifier: Option<Arc<VerifierCache>>,
    blocks: DashMap<u64, Arc<BlockCell>>,
}

impl TxHistory {
    pub fn new(reader: Arc<dyn BlockchainReader>, verifier: Option<Arc<VerifierCache>>) -> Self {
        Self { reader, verifier, blocks: DashMap::new() }
    }

    /// The records of one block, computing them on first access.
    pub fn block(&self, number: u64) -> Arc<BlockRecords> {
        let cell = self.blocks.entry(number).or_default().clone();
        cell.records
            .get_or_init(|| {
                info!(block = number, "computing tx records for block");
                Arc::new(self.compute_tx_records(number))
            })
            .clone()
    }

    pub fn forget_blocks(&self, numbers: impl IntoIterator<Item = u64>) {
        for n in numbers {
            self.blocks.remove(&n);
        }
    }

    pub fn forget_block_range(&self, from: u64, to: u64) {
        self.forget_blocks(from..=to);
    }

    /// Warm up a set of blocks with bounded parallelism.
    pub async fn acquire_blocks(
        self: &Arc<Self>,
        numbers: Vec<u64>,
        concurrency: usize,
        cancel: &SearchContext,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = Vec::new();
        for number in numbers {
            if cancel.is_done() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let history = Arc::clone(self);
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                history.block(number);
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Replay one block against its parent state, producing a record per
    /// transaction plus the block-reward pseudo record. Errors never abort
    /// the block; they are recorded per transaction.
    fn compute_tx_records(&self, block_number: u64) -> BlockRecords {
        let mut records = Vec::new();
        let mut state =
            match ForkedState::new(Arc::clone(&self.reader), Some(block_number.saturating_sub(1))) {
            Ok(s) => s,
            Err(err) => {
                error!(block = block_number, error = %err, "failed to construct forked state");
                return records;
            }
        };
        let block = match self.reader.block_by_number(Some(block_number)) {
            Ok(b) => b,
            Err(err) => {
                error!(block = block_number, error = %err, "failed to get block");
                return records;
            }
        };
        let mut ctx = VmContext::from_header(&block.header);
        let exe = ExeVM::new(attack_search_vm_config());

        for (index, tx) in block.transactions.iter().enumerate() {
            let mut record = TxRecord {
                block_number,
                block_hash: block.header.hash,
                tx_index: index as u64,
                state: state.clone_state(),
                ctx: ctx.clone(),
                tx: tx.clone(),
                summary: None,
                error: None,
                some_contracts_non_verified: false,
                involved: OnceLock::new(),
            };
            let mut tracer = TxSummaryTracer::new(Config {
                include_def: true,
                include_use: true,
                include_transfer: true,
                include_profit: true,
                include_trace: false,
            });
            match exe.apply_tx(&mut state, tx, &mut ctx, false, true, Some(&mut tracer)) {
                Ok(_) => record.summary = tracer.take_summary(),
                Err(err) => {
                    error!(block = block_number, tx = %tx.hash(), error = %err, "failed to summarize tx");
                    record.error = Some(err.to_string());
                }
            }
            if let (Some(verifier), Some(summary)) = (&self.verifier, &record.summary) {
                for addr in summary.all_invoked_addresses() {
                    let is_contract = self
                        .reader
                        .code_at(addr, Some(block_number))
                        .map(|c| !c.is_empty())
                        .unwrap_or(false);
                    if is_contract && !verifier.is_verified(addr) {
                        record.some_contracts_non_verified = true;
                        break;
                    }
                }
            }
            records.push(Arc::new(record));
        }

        // Block-reward pseudo transaction: keeps the index space faithful.
        let position = TxPosition { block: block_number, index: block.transactions.len() as u64 };
        let payload = Bytes::from(serde_json::to_vec(&position).expect("position encodes"));
        let coinbase = block.header.coinbase;
        let reward = block_reward(block_number);
        let reward_tx = Tx::pseudo(
            payload,
            Arc::new(move |s| {
                s.add_balance(coinbase, reward);
                Ok(Bytes::from(format!("{reward} block reward to {coinbase}").into_bytes()))
            }),
        );
        let mut reward_record = TxRecord {
            block_number,
            block_hash: block.header.hash,
            tx_index: position.index,
            state: state.clone_state(),
            ctx: ctx.clone(),
            tx: reward_tx.clone(),
            summary: None,
            error: None,
            some_contracts_non_verified: false,
            involved: OnceLock::new(),
        };
        if let Err(err) = exe.apply_tx(&mut state, &reward_tx, &mut ctx, false, false, None) {
            error!(block = block_number, error = %err, "failed to apply block reward");
            reward_record.error = Some(err.to_string());
        }
        records.push(Arc::new(reward_record));

        records
    }

    /// Open a session over `[from, from + window)`.
    pub fn start_session(self: &Arc<Self>, from: u64, window: usize) -> TxHistorySession {
        debug!(from, window, "tx history session acquiring blocks");
        let blocks: Vec<Arc<BlockRecords>> =
            (0..window).map(|i| self.block(from + i as u64)).collect();

        // Happen-before edges: each transaction depends on its sender's
        // previous transaction in the window.
        let mut deps: HashMap<TxPosition, TxPosition> = HashMap::new();
        let mut sender_last: HashMap<Address, TxPosition> = HashMap::new();
        for block in &blocks {
            for record in block.iter() {
                if record.error.is_some() || record.is_pseudo() {
                    continue;
                }
                let pos = record.position();
                if let Some(last) = sender_last.get(&record.tx.from) {
                    deps.insert(pos, *last);
                }
                sender_last.insert(record.tx.from, pos);
            }
        }

        TxHistorySession { history: Arc::clone(self), from, blocks, deps }
    }
}

/// A window of history. Sessions are cheap views; parallelism happens
/// between sessions, never within one.
pub struct TxHistorySession {
    history: Arc<TxHistory>,
    from: u64,
    blocks: Vec<Arc<BlockRecords>>,
    /// dependant position -> its nearest same-sender predecessor.
    deps: HashMap<TxPosition, TxPosition>,
}

impl TxHistorySession {
    pub fn from_block(&self) -> u64 {
        self.from
    }

    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn get_record(&self, pos: TxPosition) -> Result<Arc<TxRecord>, SearchError> {
        if pos.block < self.from || pos.block >= self.from + self.blocks.len() as u64 {
            return Err(SearchError::BlockOutOfRange(pos.block));
        }
        let block = &self.blocks[(pos.block - self.from) as usize];
        block
            .get(pos.index as usize)
            .cloned()
            .ok_or(SearchError::BlockOutOfRange(pos.block))
    }

    pub fn record_by_hash(&self, hash: B256) -> Result<Arc<TxRecord>, SearchError> {
        for block in &self.blocks {
            for record in block.iter() {
                if record.tx.hash() == hash {
                    return Ok(record.clone());
                }
            }
        }
        Err(SearchError::TxNotInSession(hash))
    }

    /// All records of the window in position order.
    pub fn slice_tx_records(&self) -> Vec<Arc<TxRecord>> {
        self.blocks.iter().flat_map(|b| b.iter().cloned()).collect()
    }

    /// The prerequisites of `dependant` (transitive same-sender
    /// predecessors), bounded below by `back_bound` (exclusive), sorted by
    /// position. A back bound at or after the dependant acts as no bound.
    pub fn slice_prerequisites(
        &self,
        dependant: &TxRecord,
        back_bound: &TxRecord,
    ) -> Vec<Arc<TxRecord>> {
        if dependant.is_pseudo() {
            return Vec::new();
        }
        let bound = if dependant.position() > back_bound.position() {
            back_bound.position()
        } else {
            ZERO_TX_POSITION
        };

        let mut positions: Vec<TxPosition> = Vec::new();
        let mut queue = vec![dependant.position()];
        while let Some(pos) = queue.pop() {
            if let Some(dep) = self.deps.get(&pos) {
                if *dep > bound && !positions.contains(dep) {
                    positions.push(*dep);
                    queue.push(*dep);
                }
            }
        }
        positions.sort();
        positions
            .into_iter()
            .filter_map(|pos| self.get_record(pos).ok())
            .collect()
    }

    /// Release the window's blocks from the history cache.
    pub fn close(&self) {
        self.history
            .forget_block_range(self.from, self.from + self.blocks.len() as u64 - 1);
        info!(from = self.from, window = self.blocks.len(), "closed tx history session");
    }
}
