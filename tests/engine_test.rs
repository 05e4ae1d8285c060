//! Transaction-runner behavior: pseudo transactions, nonce handling,
//! batch application with rejected entries, receipts.

mod common;

use std::sync::Arc;

use revm::primitives::{Address, Bytes, U256};

use sandscan::engine::{ExeVM, MemoryState, StateOps, StateReader, Tx, VmContext};
use sandscan::error::{AdmissionError, EngineError};

fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

#[test]
fn pseudo_tx_mutates_state_without_receipt() {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();

    let coinbase = addr(9);
    let tx = Tx::pseudo(
        Bytes::from_static(b"reward"),
        Arc::new(move |s| {
            s.add_balance(coinbase, U256::from(42));
            Ok(Bytes::from_static(b"ok"))
        }),
    );
    let (result, receipt) =
        exe.apply_tx(&mut state, &tx, &mut ctx, false, true, None).expect("pseudo");
    assert!(receipt.is_none(), "pseudo transactions have no receipt");
    assert_eq!(result.return_data, Bytes::from_static(b"ok"));
    assert_eq!(state.balance_of(coinbase), U256::from(42));
}

#[test]
fn failing_pseudo_tx_rolls_back() {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    state.set_balance(addr(1), U256::from(7));

    let tx = Tx::pseudo(
        Bytes::from_static(b"bad"),
        Arc::new(|s| {
            s.set_balance(Address::with_last_byte(1), U256::ZERO);
            Err("boom".into())
        }),
    );
    let err = exe.apply_tx(&mut state, &tx, &mut ctx, false, false, None).unwrap_err();
    assert!(matches!(err, EngineError::Pseudo(_)));
    assert_eq!(state.balance_of(addr(1)), U256::from(7), "failed pseudo tx must roll back");
}

#[test]
fn nonce_mismatch_is_an_admission_error() {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();

    let tx = Tx::unsigned(addr(1), Some(addr(2)), 5, U256::ZERO, 100_000, Bytes::new());
    let err = exe.apply_tx(&mut state, &tx, &mut ctx, false, false, None).unwrap_err();
    match err {
        EngineError::Admission(AdmissionError::Nonce { tx: 5, state: 0 }) => {}
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn nonce_bypass_accepts_any_nonce() {
    let mut exe = ExeVM::new_debugging();
    exe.config.bypass_nonce_and_sender_check = true;
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();

    let tx = Tx::unsigned(addr(1), Some(addr(2)), 5, U256::ZERO, 100_000, Bytes::new());
    let (result, _) = exe.apply_tx(&mut state, &tx, &mut ctx, false, false, None).expect("apply");
    assert!(!result.failed());
}

#[test]
fn plain_value_transfer_moves_balance() {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    state.set_balance(addr(1), U256::from(1_000_000));

    let tx = Tx::unsigned(addr(1), Some(addr(2)), 0, U256::from(1234), 100_000, Bytes::new());
    let (result, receipt) =
        exe.apply_tx(&mut state, &tx, &mut ctx, false, true, None).expect("apply");
    assert!(!result.failed());
    assert!(receipt.expect("receipt").status);
    assert_eq!(state.balance_of(addr(2)), U256::from(1234));
    assert_eq!(state.nonce_of(addr(1)), 1);
}

#[test]
fn apply_transactions_collects_rejections_without_aborting() {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    state.set_balance(addr(1), U256::from(1_000_000));

    let good = Tx::unsigned(addr(1), Some(addr(2)), 0, U256::from(1), 100_000, Bytes::new());
    let bad_nonce = Tx::unsigned(addr(1), Some(addr(2)), 99, U256::from(1), 100_000, Bytes::new());
    let also_good = Tx::unsigned(addr(1), Some(addr(2)), 1, U256::from(1), 100_000, Bytes::new());

    let (included, receipts, rejected) =
        exe.apply_transactions(&mut state, &[good, bad_nonce, also_good], &mut ctx, false, true);
    assert_eq!(included.len(), 2);
    assert_eq!(receipts.len(), 2);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].index, 1);
    assert_eq!(state.balance_of(addr(2)), U256::from(2));
}

#[test]
fn gas_pool_and_tx_index_advance() {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    state.set_balance(addr(1), U256::from(1_000_000));
    let pool_before = ctx.gas_pool;

    let tx = Tx::unsigned(addr(1), Some(addr(2)), 0, U256::ZERO, 100_000, Bytes::new());
    let (result, receipt) =
        exe.apply_tx(&mut state, &tx, &mut ctx, false, true, None).expect("apply");
    assert_eq!(ctx.tx_index, 1);
    assert_eq!(ctx.gas_used, result.gas_used);
    assert_eq!(ctx.gas_pool, pool_before - result.gas_used);
    let receipt = receipt.expect("receipt");
    assert_eq!(receipt.transaction_index, 0);
    assert_eq!(receipt.cumulative_gas_used, result.gas_used);
}
