//! The attack search and analysis orchestrator: differential replay of
//! candidate (attack, victim[, profit]) transaction tuples, the profit
//! oracle, and the taint-based explanation of detected attacks.

pub mod analysis;
pub mod attack;
pub mod docs;
pub mod history;
pub mod searcher;
pub mod taint;
pub mod verify;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::VmConfig;

pub use analysis::{AttackAnalysis, AttackPattern};
pub use attack::{compute_attack_hash, construct_attack, Attack};
pub use history::{TxHistory, TxHistorySession, TxPosition, TxRecord};
pub use searcher::{AttackSearcher, SearchWindow};
pub use taint::TaintAnalyzer;
pub use verify::{ContractVerifier, VerifierCache};

/// Cooperative cancellation plus an optional deadline, threaded through
/// the search pipeline. Replays check it between transactions.
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl SearchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), deadline: Some(deadline) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// The runner configuration used for every replay in the search: gas
/// capped to the block pool, fee cap regulated up to the block base fee,
/// and base-fee charging disabled so sliced histories stay replayable.
pub fn attack_search_vm_config() -> VmConfig {
    let mut config = VmConfig::mainnet();
    config.cap_gas_to_block_limit = true;
    config.regulate_base_fee = true;
    config.no_base_fee = true;
    config
}
