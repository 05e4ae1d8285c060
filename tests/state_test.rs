//! State invariants: snapshot/revert round trips, lazy inheritance and
//! the committed-zero distinctions of the forked state.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use revm::primitives::{Address, Bytes, B256, U256};
use revm::Database;

use common::StubReader;
use sandscan::engine::{ForkedState, MemoryState, StateOps, StateReader, VmState};

fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

fn slot(n: u8) -> B256 {
    B256::with_last_byte(n)
}

#[test]
fn memory_state_snapshot_revert_round_trips() {
    let mut state = MemoryState::new();
    state.set_balance(addr(1), U256::from(100));
    state.set_storage_value(addr(1), slot(1), B256::with_last_byte(7));

    let snap = state.snapshot();
    state.set_balance(addr(1), U256::from(5));
    state.set_storage_value(addr(1), slot(1), B256::with_last_byte(9));
    state.set_storage_value(addr(1), slot(2), B256::with_last_byte(1));
    assert_eq!(state.balance_of(addr(1)), U256::from(5));

    state.revert_to(snap);
    assert_eq!(state.balance_of(addr(1)), U256::from(100));
    assert_eq!(state.storage_value(addr(1), slot(1)), B256::with_last_byte(7));
    assert_eq!(state.storage_value(addr(1), slot(2)), B256::ZERO);
}

#[test]
fn memory_state_clone_is_independent() {
    let mut state = MemoryState::new();
    state.set_balance(addr(1), U256::from(1));
    let mut copy = state.clone_state();
    copy.set_balance(addr(1), U256::from(2));
    assert_eq!(state.balance_of(addr(1)), U256::from(1));
    assert_eq!(copy.balance_of(addr(1)), U256::from(2));
}

fn stub_reader() -> Arc<StubReader> {
    let mut reader = StubReader { latest: 100, ..Default::default() };
    reader.balances.insert(addr(1), U256::from(1000));
    reader.nonces.insert(addr(1), 7);
    reader.codes.insert(addr(2), Bytes::from_static(&[0x60, 0x00]));
    reader.storage.insert((addr(2), slot(1)), B256::with_last_byte(0xaa));
    Arc::new(reader)
}

#[test]
fn forked_state_inherits_lazily() {
    let mut state = ForkedState::new(stub_reader(), Some(100)).expect("state");
    assert_eq!(state.balance_of(addr(1)), U256::from(1000));
    assert_eq!(state.nonce_of(addr(1)), 7);
    assert_eq!(state.code_of(addr(2)), Bytes::from_static(&[0x60, 0x00]));
    assert_eq!(state.storage_value(addr(2), slot(1)), B256::with_last_byte(0xaa));
    // untouched remote data reads as empty
    assert_eq!(state.balance_of(addr(9)), U256::ZERO);
    assert_eq!(state.storage_value(addr(2), slot(9)), B256::ZERO);
}

#[test]
fn forked_state_write_shadows_remote() {
    let mut state = ForkedState::new(stub_reader(), Some(100)).expect("state");
    state.set_storage_value(addr(2), slot(1), B256::with_last_byte(0xbb));
    assert_eq!(state.storage_value(addr(2), slot(1)), B256::with_last_byte(0xbb));
    // a second, fresh fork still sees the remote value
    let mut fresh = ForkedState::new(stub_reader(), Some(100)).expect("state");
    assert_eq!(fresh.storage_value(addr(2), slot(1)), B256::with_last_byte(0xaa));
}

#[test]
fn cleared_slot_reads_zero_not_remote() {
    // An inherited non-zero slot cleared locally must read zero afterward
    // even through the committed-state path.
    let mut state = ForkedState::new(stub_reader(), Some(100)).expect("state");
    assert_eq!(state.storage_value(addr(2), slot(1)), B256::with_last_byte(0xaa));
    state.set_storage_value(addr(2), slot(1), B256::ZERO);
    assert_eq!(state.storage_value(addr(2), slot(1)), B256::ZERO);
    let committed = Database::storage(&mut state, addr(2), U256::from(1)).expect("storage");
    assert_eq!(committed, U256::ZERO);
}

#[test]
fn inherited_zero_slot_stays_zero() {
    let mut state = ForkedState::new(stub_reader(), Some(100)).expect("state");
    assert_eq!(state.storage_value(addr(2), slot(3)), B256::ZERO);
    let committed = Database::storage(&mut state, addr(2), U256::from(3)).expect("storage");
    assert_eq!(committed, U256::ZERO);
}

#[test]
fn forked_state_snapshot_revert_undoes_inheritance_and_writes() {
    let mut state = ForkedState::new(stub_reader(), Some(100)).expect("state");
    assert_eq!(state.balance_of(addr(1)), U256::from(1000));

    let snap = state.snapshot();
    state.set_balance(addr(1), U256::from(1));
    state.set_storage_value(addr(2), slot(1), B256::with_last_byte(0x11));
    state.set_storage_value(addr(2), slot(5), B256::with_last_byte(0x55));

    state.revert_to(snap);
    assert_eq!(state.balance_of(addr(1)), U256::from(1000));
    assert_eq!(state.storage_value(addr(2), slot(1)), B256::with_last_byte(0xaa));
    assert_eq!(state.storage_value(addr(2), slot(5)), B256::ZERO);
}

#[test]
fn forked_state_copy_mutates_independently() {
    let mut state = ForkedState::new(stub_reader(), Some(100)).expect("state");
    state.set_balance(addr(1), U256::from(500));
    let mut copy = state.clone_state();
    copy.set_balance(addr(1), U256::from(9));
    copy.set_storage_value(addr(2), slot(1), B256::with_last_byte(0x99));
    assert_eq!(state.balance_of(addr(1)), U256::from(500));
    assert_eq!(state.storage_value(addr(2), slot(1)), B256::with_last_byte(0xaa));
    assert_eq!(copy.balance_of(addr(1)), U256::from(9));
}

#[test]
fn nested_snapshots_revert_in_order() {
    let mut state = MemoryState::new();
    state.set_balance(addr(1), U256::from(1));
    let s1 = state.snapshot();
    state.set_balance(addr(1), U256::from(2));
    let s2 = state.snapshot();
    state.set_balance(addr(1), U256::from(3));

    state.revert_to(s2);
    assert_eq!(state.balance_of(addr(1)), U256::from(2));
    state.revert_to(s1);
    assert_eq!(state.balance_of(addr(1)), U256::from(1));
}

#[test]
fn stub_reader_defaults() {
    let reader = StubReader { latest: 5, balances: HashMap::new(), ..Default::default() };
    let state = ForkedState::new(Arc::new(reader), None).expect("state");
    assert_eq!(state.fork_block(), Some(5));
}
