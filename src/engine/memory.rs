//! Pure in-memory state. No blockchain behind it: unknown accounts are
//! empty, unknown slots read zero, historic block hashes are zero. Used by
//! the debugging harness and tests.

use std::collections::HashMap;

use revm::primitives::{
    keccak256, Account, AccountInfo, Address, Bytecode, Bytes, B256, KECCAK_EMPTY, U256,
};
use revm::{Database, DatabaseCommit};

use crate::engine::state::{StateOps, StateReader, VmState};
use crate::engine::tx::AccessListEntry;
use crate::error::StateError;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    accounts: HashMap<Address, AccountInfo>,
    storage: HashMap<Address, HashMap<U256, U256>>,
    contracts: HashMap<B256, Bytecode>,

    tx_hash: B256,
    tx_index: usize,
    snapshots: Vec<MemorySnapshot>,
}

#[derive(Debug, Clone)]
struct MemorySnapshot {
    accounts: HashMap<Address, AccountInfo>,
    storage: HashMap<Address, HashMap<U256, U256>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn account_mut(&mut self, addr: Address) -> &mut AccountInfo {
        self.accounts.entry(addr).or_default()
    }

    fn apply_account(&mut self, addr: Address, account: Account) {
        if account.is_selfdestructed() {
            self.accounts.remove(&addr);
            self.storage.remove(&addr);
            return;
        }
        let mut info = account.info.clone();
        if let Some(code) = info.code.take() {
            if !code.original_bytes().is_empty() {
                self.contracts.insert(info.code_hash, code);
            }
        }
        self.accounts.insert(addr, info);
        let slots = self.storage.entry(addr).or_default();
        for (slot, value) in account.storage {
            if value.is_changed() {
                slots.insert(slot, value.present_value());
            }
        }
    }
}

impl Database for MemoryState {
    type Error = StateError;

    fn basic(&mut self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        Ok(self.accounts.get(&address).cloned())
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        self.contracts
            .get(&code_hash)
            .cloned()
            .ok_or(StateError::UnknownCodeHash(code_hash))
    }

    fn storage(&mut self, address: Address, index: U256) -> Result<U256, Self::Error> {
        Ok(self
            .storage
            .get(&address)
            .and_then(|s| s.get(&index))
            .copied()
            .unwrap_or_default())
    }

    fn block_hash(&mut self, _number: u64) -> Result<B256, Self::Error> {
        Ok(B256::ZERO)
    }
}

impl DatabaseCommit for MemoryState {
    fn commit(&mut self, changes: revm::primitives::HashMap<Address, Account>) {
        for (addr, account) in changes {
            if !account.is_touched() {
                continue;
            }
            self.apply_account(addr, account);
        }
    }
}

impl StateReader for MemoryState {
    fn balance_of(&mut self, addr: Address) -> U256 {
        self.accounts.get(&addr).map(|a| a.balance).unwrap_or_default()
    }

    fn nonce_of(&mut self, addr: Address) -> u64 {
        self.accounts.get(&addr).map(|a| a.nonce).unwrap_or_default()
    }

    fn code_of(&mut self, addr: Address) -> Bytes {
        let Some(info) = self.accounts.get(&addr) else {
            return Bytes::new();
        };
        self.contracts
            .get(&info.code_hash)
            .map(|c| c.original_bytes())
            .unwrap_or_default()
    }

    fn code_hash_of(&mut self, addr: Address) -> B256 {
        self.accounts.get(&addr).map(|a| a.code_hash).unwrap_or(KECCAK_EMPTY)
    }

    fn storage_value(&mut self, addr: Address, slot: B256) -> B256 {
        let value = self
            .storage
            .get(&addr)
            .and_then(|s| s.get(&slot.into()))
            .copied()
            .unwrap_or_default();
        B256::from(value)
    }
}

impl StateOps for MemoryState {
    fn set_balance(&mut self, addr: Address, value: U256) {
        self.account_mut(addr).balance = value;
    }

    fn add_balance(&mut self, addr: Address, value: U256) {
        let acc = self.account_mut(addr);
        acc.balance = acc.balance.saturating_add(value);
    }

    fn sub_balance(&mut self, addr: Address, value: U256) {
        let acc = self.account_mut(addr);
        acc.balance = acc.balance.saturating_sub(value);
    }

    fn set_nonce(&mut self, addr: Address, nonce: u64) {
        self.account_mut(addr).nonce = nonce;
    }

    fn set_code(&mut self, addr: Address, code: Bytes) {
        let hash = keccak256(&code);
        self.contracts.insert(hash, Bytecode::new_raw(code));
        let acc = self.account_mut(addr);
        acc.code_hash = hash;
    }

    fn set_storage_value(&mut self, addr: Address, slot: B256, value: B256) {
        self.storage.entry(addr).or_default().insert(slot.into(), value.into());
    }
}

impl VmState for MemoryState {
    fn snapshot(&mut self) -> usize {
        let id = self.snapshots.len();
        self.snapshots.push(MemorySnapshot {
            accounts: self.accounts.clone(),
            storage: self.storage.clone(),
        });
        id
    }

    fn revert_to(&mut self, id: usize) {
        let snap = self.snapshots[id].clone();
        self.accounts = snap.accounts;
        self.storage = snap.storage;
        self.snapshots.truncate(id);
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
        _sender: Address,
        _dest: Option<Address>,
        _precompiles: &[Address],
        _list: &[AccessListEntry],
    ) {
    }

    fn take_last_error(&mut self) -> Option<StateError> {
        None
    }
}
