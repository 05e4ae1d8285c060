//! The state interface the engine and the tracers consume.
//!
//! [`VmState`] is the full contract: a revm database the EVM executes
//! against, plus snapshot/revert/copy and the per-transaction bookkeeping
//! the runner drives. [`StateReader`]/[`StateOps`] are the object-safe
//! slices handed to tracers and pseudo-transaction closures.

use revm::primitives::{Address, Bytes, B256, U256};
use revm::{Database, DatabaseCommit};

use crate::engine::tx::AccessListEntry;
use crate::error::StateError;

/// Object-safe read access, served with inheritance (forked states pull the
/// remote value on first touch) and with any committed local writes visible.
pub trait StateReader {
    fn balance_of(&mut self, addr: Address) -> U256;
    fn nonce_of(&mut self, addr: Address) -> u64;
    fn code_of(&mut self, addr: Address) -> Bytes;
    fn code_hash_of(&mut self, addr: Address) -> B256;
    fn code_size_of(&mut self, addr: Address) -> usize {
        self.code_of(addr).len()
    }
    fn storage_value(&mut self, addr: Address, slot: B256) -> B256;
}

/// Object-safe mutation on top of [`StateReader`]. This is what pseudo
/// transactions (block rewards, test harness mutators) run against.
pub trait StateOps: StateReader {
    fn set_balance(&mut self, addr: Address, value: U256);
    fn add_balance(&mut self, addr: Address, value: U256);
    fn sub_balance(&mut self, addr: Address, value: U256);
    fn set_nonce(&mut self, addr: Address, nonce: u64);
    fn set_code(&mut self, addr: Address, code: Bytes);
    fn set_storage_value(&mut self, addr: Address, slot: B256, value: B256);
}

/// The full state contract the transaction runner drives.
///
/// Invariants:
/// - after `revert_to(id)`, all reads are equivalent to the state at the
///   time `snapshot()` returned `id`;
/// - a storage slot that has never been written reads as the remote value
///   (forked state) or zero (in-memory state), and subsequent reads observe
///   intervening writes;
/// - `clone_state` yields a fully independent state: mutations on either
///   side are invisible to the other.
pub trait VmState: Database<Error = StateError> + DatabaseCommit + StateOps + Send {
    /// Capture the current state; the returned id stays valid until a
    /// revert to an earlier snapshot discards it.
    fn snapshot(&mut self) -> usize;

    fn revert_to(&mut self, id: usize);

    /// Drop snapshots with ids >= `id` without restoring state. Snapshots
    /// hold full state copies, so a caller that no longer needs its
    /// rollback point releases it here.
    fn discard_snapshots_from(&mut self, id: usize);

    fn clone_state(&self) -> Self
    where
        Self: Sized;

    /// End-of-transaction clearing: promote per-tx cleared-slot bookkeeping
    /// and optionally drop empty accounts.
    fn finalise(&mut self, delete_empty: bool);

    /// Set the transient per-transaction fields.
    fn prepare(&mut self, tx_hash: B256, tx_index: usize);

    /// Reset the access list to sender + destination + precompiles + the
    /// transaction's declared entries.
    fn prepare_access_list(
        &mut self,
        sender: Address,
        dest: Option<Address>,
        precompiles: &[Address],
        list: &[AccessListEntry],
    );

    /// Take the error recorded by the last provider failure, if any. The
    /// EVM-facing interface is infallible; the runner checks this after
    /// every transaction and rolls back when set.
    fn take_last_error(&mut self) -> Option<StateError>;

    /// The fork point this state inherits remote data from, if any.
    fn fork_block(&self) -> Option<u64> {
        None
    }
}
