//! Single-flight contract-verification lookups. The verification service
//! itself (an Etherscan-backed helper) is external; the core only needs
//! the interface and the cache.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use revm::primitives::Address;
use tracing::warn;

/// Source of "is this contract's source code verified" facts.
pub trait ContractVerifier: Send + Sync {
    fn is_verified(&self, contract: Address) -> Result<bool, String>;
}

/// Caches verification lookups with single-flight semantics: the first
/// caller for an address performs the lookup, concurrent callers block on
/// the same cell. Lookup failures are treated as verified, which keeps
/// the search conservative about skipping candidates.
pub struct VerifierCache {
    inner: Arc<dyn ContractVerifier>,
    cells: DashMap<Address, Arc<OnceLock<bool>>>,
}

impl VerifierCache {
    pub fn new(inner: Arc<dyn ContractVerifier>) -> Self {
        Self { inner, cells: DashMap::new() }
    }

    pub fn is_verified(&self, contract: Address) -> bool {
        let cell = self.cells.entry(contract).or_default().clone();
        *cell.get_or_init(|| match self.inner.is_verified(contract) {
            Ok(verified) => verified,
            Err(err) => {
                warn!(address = %contract, error = %err, "contract verification failed");
                true
            }
        })
    }
}
