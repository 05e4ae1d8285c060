//! State forked from a remote chain at a pivot block.
//!
//! Account state (balance, code, nonce) and storage slots are inherited
//! lazily on first touch and cached in an in-memory state. Two mark sets
//! remember what has been inherited; a cleared-slot set distinguishes "slot
//! committed to zero by a previous transaction" from "slot inherited as
//! zero", which is the only way to keep committed-value reads correct after
//! an inherited non-zero slot has been cleared.
//!
//! Snapshots copy the whole structure (the snapshot stack itself is shadow
//! copied) and revert restores by replacement: unlike a journal, this also
//! undoes the inheritance bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use revm::primitives::{
    keccak256, Account, AccountInfo, Address, Bytecode, Bytes, B256, KECCAK_EMPTY, U256,
};
use revm::{Database, DatabaseCommit};
use tracing::warn;

use crate::chain::BlockchainReader;
use crate::engine::state::{StateOps, StateReader, VmState};
use crate::engine::tx::AccessListEntry;
use crate::error::StateError;

#[derive(Clone)]
pub struct ForkedState {
    reader: Arc<dyn BlockchainReader>,
    fork_block: u64,

    accounts: HashMap<Address, AccountInfo>,
    storage: HashMap<Address, HashMap<U256, U256>>,

    state_inherited: HashSet<Address>,
    storage_inherited: HashMap<Address, HashSet<U256>>,
    committed_cleared: HashMap<Address, HashSet<U256>>,

    access_list: HashMap<Address, HashSet<B256>>,
    tx_hash: B256,
    tx_index: usize,

    snapshots: Vec<Arc<ForkedState>>,
    last_error: Option<StateError>,
}

impl std::fmt::Debug for ForkedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkedState")
            .field("fork_block", &self.fork_block)
            .field("accounts", &self.accounts.len())
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

impl ForkedState {
    /// Fork at the given block, or at the reader's latest block when `None`.
    pub fn new(
        reader: Arc<dyn BlockchainReader>,
        fork_block: Option<u64>,
    ) -> Result<Self, StateError> {
        let fork_block = match fork_block {
            Some(n) => n,
            None => reader.block_number().map_err(StateError::Provider)?,
        };
        Ok(Self {
            reader,
            fork_block,
            accounts: HashMap::new(),
            storage: HashMap::new(),
            state_inherited: HashSet::new(),
            storage_inherited: HashMap::new(),
            committed_cleared: HashMap::new(),
            access_list: HashMap::new(),
            tx_hash: B256::ZERO,
            tx_index: 0,
            snapshots: Vec::new(),
            last_error: None,
        })
    }

    fn record_error(&mut self, err: StateError) {
        warn!(error = %err, "forked state provider error");
        self.last_error = Some(err);
    }

    fn inherit_account(&mut self, addr: Address) {
        if self.state_inherited.contains(&addr) {
            return;
        }
        if !self.accounts.contains_key(&addr) {
            let balance = match self.reader.balance_at(addr, Some(self.fork_block)) {
                Ok(v) => v,
                Err(e) => {
                    self.record_error(StateError::Provider(e));
                    U256::ZERO
                }
            };
            let code = match self.reader.code_at(addr, Some(self.fork_block)) {
                Ok(c) => c,
                Err(e) => {
                    self.record_error(StateError::Provider(e));
                    Bytes::new()
                }
            };
            let nonce = match self.reader.nonce_at(addr, Some(self.fork_block)) {
                Ok(n) => n,
                Err(e) => {
                    self.record_error(StateError::Provider(e));
                    0
                }
            };
            // Fully empty remote accounts stay absent locally.
            if !balance.is_zero() || !code.is_empty() || nonce > 0 {
                let (code_hash, bytecode) = if code.is_empty() {
                    (KECCAK_EMPTY, None)
                } else {
                    (keccak256(&code), Some(Bytecode::new_raw(code)))
                };
                self.accounts.insert(
                    addr,
                    AccountInfo { balance, nonce, code_hash, code: bytecode },
                );
            }
        }
        self.storage_inherited.entry(addr).or_default();
        self.state_inherited.insert(addr);
    }

    fn inherit_slot(&mut self, addr: Address, slot: U256) {
        let inherited = self
            .storage_inherited
            .get(&addr)
            .map_or(false, |slots| slots.contains(&slot));
        if inherited {
            return;
        }
        let value = match self.reader.storage_at(addr, B256::from(slot), Some(self.fork_block)) {
            Ok(v) => v,
            Err(e) => {
                self.record_error(StateError::Provider(e));
                B256::ZERO
            }
        };
        if value != B256::ZERO {
            self.storage.entry(addr).or_default().insert(slot, value.into());
        }
        self.storage_inherited.entry(addr).or_default().insert(slot);
    }

    fn slot_cleared(&self, addr: &Address, slot: &U256) -> bool {
        self.committed_cleared.get(addr).map_or(false, |s| s.contains(slot))
    }

    fn slot_inherited(&self, addr: &Address, slot: &U256) -> bool {
        self.storage_inherited.get(addr).map_or(false, |s| s.contains(slot))
    }

    fn account_info_mut(&mut self, addr: Address) -> &mut AccountInfo {
        self.inherit_account(addr);
        self.accounts.entry(addr).or_default()
    }

    fn apply_account(&mut self, addr: Address, account: Account) {
        self.state_inherited.insert(addr);
        self.storage_inherited.entry(addr).or_default();
        if account.is_selfdestructed() {
            self.accounts.remove(&addr);
            if let Some(slots) = self.storage.remove(&addr) {
                let cleared = self.committed_cleared.entry(addr).or_default();
                for slot in slots.into_keys() {
                    cleared.insert(slot);
                }
            }
            return;
        }
        self.accounts.insert(addr, account.info.clone());
        let slots = self.storage.entry(addr).or_default();
        let inherited = self.storage_inherited.entry(addr).or_default();
        let cleared = self.committed_cleared.entry(addr).or_default();
        for (slot, value) in account.storage {
            if !value.is_changed() {
                continue;
            }
            let present = value.present_value();
            slots.insert(slot, present);
            inherited.insert(slot);
            if present.is_zero() {
                cleared.insert(slot);
            } else {
                cleared.remove(&slot);
            }
        }
    }
}

impl Database for ForkedState {
    type Error = StateError;

    fn basic(&mut self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        self.inherit_account(address);
        Ok(self.accounts.get(&address).cloned())
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        for info in self.accounts.values() {
            if info.code_hash == code_hash {
                if let Some(code) = &info.code {
                    return Ok(code.clone());
                }
            }
        }
        Err(StateError::UnknownCodeHash(code_hash))
    }

    /// Committed-value read. When the in-memory value is zero there are
    /// three cases: the slot was inherited as zero, the slot was cleared by
    /// a previous transaction, or neither; in the last case the remote
    /// value is authoritative and is re-read.
    fn storage(&mut self, address: Address, index: U256) -> Result<U256, Self::Error> {
        self.inherit_account(address);
        self.inherit_slot(address, index);
        let value = self
            .storage
            .get(&address)
            .and_then(|s| s.get(&index))
            .copied()
            .unwrap_or_default();
        if !value.is_zero() {
            return Ok(value);
        }
        if self.slot_cleared(&address, &index) || self.slot_inherited(&address, &index) {
            return Ok(U256::ZERO);
        }
        match self.reader.storage_at(address, B256::from(index), Some(self.fork_block)) {
            Ok(v) => Ok(v.into()),
            Err(e) => {
                self.record_error(StateError::Provider(e));
                Ok(U256::ZERO)
            }
        }
    }

    fn block_hash(&mut self, number: u64) -> Result<B256, Self::Error> {
        match self.reader.block_hash_by_number(number) {
            Ok(h) => Ok(h),
            Err(e) => {
                self.record_error(StateError::Provider(e));
                Ok(B256::ZERO)
            }
        }
    }
}

impl DatabaseCommit for ForkedState {
    fn commit(&mut self, changes: revm::primitives::HashMap<Address, Account>) {
        for (addr, account) in changes {
            if !account.is_touched() {
                continue;
            }
            self.apply_account(addr, account);
        }
    }
}

impl StateReader for ForkedState {
    fn balance_of(&mut self, addr: Address) -> U256 {
        self.inherit_account(addr);
        self.accounts.get(&addr).map(|a| a.balance).unwrap_or_default()
    }

    fn nonce_of(&mut self, addr: Address) -> u64 {
        self.inherit_account(addr);
        self.accounts.get(&addr).map(|a| a.nonce).unwrap_or_default()
    }

    fn code_of(&mut self, addr: Address) -> Bytes {
        self.inherit_account(addr);
        self.accounts
            .get(&addr)
            .and_then(|a| a.code.as_ref())
            .map(|c| c.original_bytes())
            .unwrap_or_default()
    }

    fn code_hash_of(&mut self, addr: Address) -> B256 {
        self.inherit_account(addr);
        self.accounts.get(&addr).map(|a| a.code_hash).unwrap_or(KECCAK_EMPTY)
    }

    fn storage_value(&mut self, addr: Address, slot: B256) -> B256 {
        self.inherit_account(addr);
        let slot: U256 = slot.into();
        self.inherit_slot(addr, slot);
        let value = self
            .storage
            .get(&addr)
            .and_then(|s| s.get(&slot))
            .copied()
            .unwrap_or_default();
        B256::from(value)
    }
}

impl StateOps for ForkedState {
    fn set_balance(&mut self, addr: Address, value: U256) {
        self.account_info_mut(addr).balance = value;
    }

    fn add_balance(&mut self, addr: Address, value: U256) {
        let acc = self.account_info_mut(addr);
        acc.balance = acc.balance.saturating_add(value);
    }

    fn sub_balance(&mut self, addr: Address, value: U256) {
        let acc = self.account_info_mut(addr);
        acc.balance = acc.balance.saturating_sub(value);
    }

    fn set_nonce(&mut self, addr: Address, nonce: u64) {
        self.account_info_mut(addr).nonce = nonce;
    }

    fn set_code(&mut self, addr: Address, code: Bytes) {
        let acc = self.account_info_mut(addr);
        if code.is_empty() {
            acc.code_hash = KECCAK_EMPTY;
            acc.code = None;
        } else {
            acc.code_hash = keccak256(&code);
            acc.code = Some(Bytecode::new_raw(code));
        }
    }

    fn set_storage_value(&mut self, addr: Address, slot: B256, value: B256) {
        self.inherit_account(addr);
        let slot: U256 = slot.into();
        self.inherit_slot(addr, slot);
        let value: U256 = value.into();
        self.storage.entry(addr).or_default().insert(slot, value);
        let cleared = self.committed_cleared.entry(addr).or_default();
        if value.is_zero() {
            cleared.insert(slot);
        } else {
            cleared.remove(&slot);
        }
    }
}

impl VmState for ForkedState {
    fn snapshot(&mut self) -> usize {
        // The saved copy shares the snapshot stack by reference; revert
        // replaces the visible struct wholesale, undoing inheritance
        // bookkeeping along with the data.
        let copy = self.clone();
        let id = self.snapshots.len();
        self.snapshots.push(Arc::new(copy));
        id
    }

    fn revert_to(&mut self, id: usize) {
        let snap = Arc::clone(&self.snapshots[id]);
        *self = (*snap).clone();
    }

    fn discard_snapshots_from(&mut self, id: usize) {
        self.snapshots.truncate(id);
    }

    fn clone_state(&self) -> Self {
        self.clone()
    }

    fn finalise(&mut self, delete_empty: bool) {
        if delete_empty {
            let empty: Vec<Address> = self
                .accounts
                .iter()
                .filter(|(addr, info)| {
                    info.balance.is_zero()
                        && info.nonce == 0
                        && info.code_hash == KECCAK_EMPTY
                        && self.storage.get(*addr).map_or(true, |s| s.is_empty())
                })
                .map(|(addr, _)| *addr)
                .collect();
            for addr in empty {
                self.accounts.remove(&addr);
            }
        }
    }

    fn prepare(&mut self, tx_hash: B256, tx_index: usize) {
        self.tx_hash = tx_hash;
        self.tx_index = tx_index;
    }

    fn prepare_access_list(
        &mut self,
        sender: Address,
        dest: Option<Address>,
        precompiles: &[Address],
        list: &[AccessListEntry],
    ) {
        self.access_list.clear();
        self.access_list.entry(sender).or_default();
        if let Some(dest) = dest {
            self.access_list.entry(dest).or_default();
        }
        for addr in precompiles {
            self.access_list.entry(*addr).or_default();
        }
        for entry in list {
            let slots = self.access_list.entry(entry.address).or_default();
            for key in &entry.storage_keys {
                slots.insert(*key);
            }
        }
    }

    fn take_last_error(&mut self) -> Option<StateError> {
        self.last_error.take()
    }

    fn fork_block(&self) -> Option<u64> {
        Some(self.fork_block)
    }
}
