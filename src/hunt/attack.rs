//! A detected attack and the focused construction path: verify that a
//! given (attack, victim[, profit]) tuple really is an attack and analyze
//! it.

use std::sync::Arc;

use revm::primitives::{keccak256, Address, B256};

use crate::chain::BlockchainReader;
use crate::error::SearchError;
use crate::hunt::analysis::AttackAnalysis;
use crate::hunt::history::{TxHistory, TxRecord};
use crate::hunt::searcher::AttackSearcher;
use crate::hunt::SearchContext;
use crate::summary::{Profits, TxSummary};

pub struct Attack {
    pub attacker: Address,
    pub victim: Address,
    pub attack_record: Arc<TxRecord>,
    pub victim_record: Arc<TxRecord>,
    pub profit_record: Option<Arc<TxRecord>>,
    pub attack_as_if_summary: Arc<TxSummary>,
    pub victim_as_if_summary: Arc<TxSummary>,
    pub profit_as_if_summary: Option<Arc<TxSummary>>,

    pub attacker_profits: Profits,
    pub attacker_as_if_profits: Profits,
    pub victim_profits: Profits,
    pub victim_as_if_profits: Profits,

    pub analyses: Vec<AttackAnalysis>,
}

/// attack-hash = keccak256(attackTx ∥ victimTx [∥ profitTx]).
pub fn compute_attack_hash(attack_tx: B256, victim_tx: B256, profit_tx: Option<B256>) -> B256 {
    let mut preimage = Vec::with_capacity(96);
    preimage.extend_from_slice(attack_tx.as_slice());
    preimage.extend_from_slice(victim_tx.as_slice());
    if let Some(profit_tx) = profit_tx {
        preimage.extend_from_slice(profit_tx.as_slice());
    }
    keccak256(&preimage)
}

impl Attack {
    pub fn hash(&self) -> B256 {
        compute_attack_hash(
            self.attack_record.tx.hash(),
            self.victim_record.tx.hash(),
            self.profit_record.as_ref().map(|p| p.tx.hash()),
        )
    }
}

/// Reconstruct and verify an attack from its transaction hashes: open a
/// window spanning the involved blocks, focus the search on the tuple and
/// run it. `None` when the tuple does not satisfy the oracle.
pub async fn construct_attack(
    reader: Arc<dyn BlockchainReader>,
    history: Arc<TxHistory>,
    attack_tx: B256,
    victim_tx: B256,
    profit_tx: Option<B256>,
    ctx: &SearchContext,
) -> Result<Option<Attack>, SearchError> {
    let attack_receipt = reader.transaction_receipt(attack_tx)?;
    let victim_receipt = reader.transaction_receipt(victim_tx)?;
    let mut to = victim_receipt.block_number;
    if let Some(profit_tx) = profit_tx {
        to = reader.transaction_receipt(profit_tx)?.block_number;
    }
    let from = attack_receipt.block_number;
    let window = (to - from + 1) as usize;

    let searcher = Arc::new(AttackSearcher::new(reader, history));
    let mut search_window = searcher.open_search_window(from, window);
    search_window.set_focus(attack_tx, victim_tx, profit_tx);
    search_window.set_search_pivot(from, attack_receipt.transaction_index);

    let mut attacks = search_window.search(ctx).await;
    search_window.close();
    Ok(attacks.pop())
}
