//! Summarizer behavior on the fixture token: defs, def-clear uses,
//! transfer decoding, profits, and the root-level unchanged-def
//! subtraction.

mod common;

use revm::primitives::{Address, U256};

use common::{addr_word, call_data, deploy, token_initcode, u64_word};
use sandscan::engine::{ExeVM, MemoryState, VmContext};
use sandscan::summary::{Config, StateVariable, Transfer, TxSummary, TxSummaryTracer};

fn account() -> Address {
    Address::with_last_byte(1)
}

fn another_account() -> Address {
    Address::with_last_byte(2)
}

struct Harness {
    exe: ExeVM,
    state: MemoryState,
    ctx: VmContext,
    token: Address,
}

fn setup() -> Harness {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    let mut code = token_initcode();
    code.extend_from_slice(U256::from(100).to_be_bytes::<32>().as_slice());
    let token = deploy(&exe, &mut state, &mut ctx, account(), code);
    Harness { exe, state, ctx, token }
}

fn summarize_call(h: &mut Harness, data: revm::primitives::Bytes) -> TxSummary {
    let mut tracer = TxSummaryTracer::new(Config::all());
    let (result, _) = h
        .exe
        .debugging_call(
            &mut h.state,
            &mut h.ctx,
            account(),
            Some(h.token),
            U256::ZERO,
            data,
            Some(&mut tracer),
        )
        .expect("call");
    assert!(!result.failed(), "{:?}", result.error);
    tracer.take_summary().expect("summary")
}

#[test]
fn transfer_collects_defs_uses_transfers_and_profits() {
    let mut h = setup();
    let data =
        call_data("transfer(address,uint256)", &[addr_word(another_account()), u64_word(40)]);
    let summary = summarize_call(&mut h, data);

    // Two storage slots written with changed values.
    let defs = summary.overall_defs();
    assert_eq!(defs.len(), 2);
    assert!(defs.iter().all(|d| matches!(d, StateVariable::Storage { .. })));

    // Both balance slots were read before being written (def-clear).
    let storage_uses = summary
        .overall_uses()
        .iter()
        .filter(|u| matches!(u, StateVariable::Storage { .. }))
        .count();
    assert_eq!(storage_uses, 2);

    // The emitted Transfer event decodes as one ERC-20 transfer.
    let transfers = summary.overall_transfers();
    assert_eq!(transfers.len(), 1);
    match &transfers[0] {
        Transfer::Erc20 { contract, from, to, amount, location } => {
            assert_eq!(*contract, h.token);
            assert_eq!(*from, account());
            assert_eq!(*to, another_account());
            assert_eq!(*amount, U256::from(40));
            assert!(location.is_some());
        }
        other => panic!("unexpected transfer {other:?}"),
    }

    // Sender lost 40, recipient gained 40.
    let profits = summary.overall_profits();
    let sender = profits.profits_of(account());
    let recipient = profits.profits_of(another_account());
    assert_eq!(sender.len(), 1);
    assert!(!sender.0[0].positive() && !sender.0[0].is_zero());
    assert_eq!(recipient.len(), 1);
    assert!(recipient.0[0].positive());
}

#[test]
fn self_transfer_round_trips_to_empty_defs() {
    let mut h = setup();
    // Sending to yourself writes the slot twice and ends at the pre-tx
    // value: the root-level comparison drops the def.
    let data = call_data("transfer(address,uint256)", &[addr_word(account()), u64_word(30)]);
    let summary = summarize_call(&mut h, data);

    assert!(summary.overall_defs().is_empty(), "round-tripped slot must not be a def");
    // A self transfer nets no profit either.
    assert!(summary.overall_profits().profits_of(account()).compact().is_empty());
}

#[test]
fn def_clear_resets_between_transactions() {
    let mut h = setup();
    let data =
        call_data("transfer(address,uint256)", &[addr_word(another_account()), u64_word(10)]);
    let first = summarize_call(&mut h, data.clone());
    let second = summarize_call(&mut h, data);

    // Both transactions observe both balance slots as def-clear uses; the
    // second one sees the values the first one wrote (90 and 10).
    assert_eq!(first.overall_uses().len(), second.overall_uses().len());
    let mut second_values: Vec<U256> = second
        .overall_uses()
        .iter()
        .filter_map(|u| match u {
            StateVariable::Storage { value, .. } => Some(U256::from_be_bytes(value.0)),
            _ => None,
        })
        .collect();
    second_values.sort();
    assert_eq!(second_values, vec![U256::from(10), U256::from(90)]);
}

#[test]
fn failed_calls_expose_no_changes() {
    let mut h = setup();
    let mut tracer = TxSummaryTracer::new(Config::all());
    let (result, _) = h
        .exe
        .debugging_call(
            &mut h.state,
            &mut h.ctx,
            account(),
            Some(h.token),
            U256::ZERO,
            revm::primitives::Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            Some(&mut tracer),
        )
        .expect("call");
    assert!(result.failed());
    let summary = tracer.take_summary().expect("summary");
    assert!(summary.overall_defs().is_empty());
    assert!(summary.overall_transfers().is_empty());
    assert!(summary.overall_profits().is_empty());
}

#[test]
fn overall_profits_compact_mutual_transfers() {
    let mut h = setup();
    // account -> other, then other -> account of the same amount inside
    // two transactions: each tx summary alone carries the directional
    // profits.
    let out =
        call_data("transfer(address,uint256)", &[addr_word(another_account()), u64_word(25)]);
    let summary = summarize_call(&mut h, out);
    let gains = summary.overall_profits().profits_of(another_account());
    assert_eq!(gains.len(), 1);
    assert!(gains.0[0].positive());

    let back = call_data("transfer(address,uint256)", &[addr_word(account()), u64_word(25)]);
    let mut tracer = TxSummaryTracer::new(Config::all());
    let (result, _) = h
        .exe
        .debugging_call(
            &mut h.state,
            &mut h.ctx,
            another_account(),
            Some(h.token),
            U256::ZERO,
            back,
            Some(&mut tracer),
        )
        .expect("call");
    assert!(!result.failed());
    let summary_back = tracer.take_summary().expect("summary");
    let mut all = sandscan::summary::Profits::new();
    all.add(summary.overall_profits().0.clone());
    all.add(summary_back.overall_profits().0.clone());
    // Across both transactions the book is square again.
    assert!(all.profits_of(account()).compact().is_empty());
    assert!(all.profits_of(another_account()).compact().is_empty());
}
