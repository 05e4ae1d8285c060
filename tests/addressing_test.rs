//! Storage-addressing-path scenarios: scalar stores and Solidity-style
//! dynamic-array pushes.

mod common;

use revm::primitives::{b256, Address, B256, U256};

use common::{add_address_runtime, addr_word, call_data, deploy, plain_initcode, set_value_runtime, u64_word};
use sandscan::addressing::{AddressingPath, StorageAddressingAnalyzer};
use sandscan::dataflow::DataFlowTracer;
use sandscan::engine::{ExeVM, MemoryState, VmContext};
use sandscan::opcode as op;

/// keccak256(uint256(0)): the element area of a dynamic array at slot 0.
const ARRAY_BASE: B256 =
    b256!("290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563");

fn account() -> Address {
    Address::with_last_byte(1)
}

fn run_with_analyzer(runtime: Vec<u8>, data: revm::primitives::Bytes) -> Vec<(u8, AddressingPath)> {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    let contract = deploy(&exe, &mut state, &mut ctx, account(), plain_initcode(&runtime));

    let mut recorded: Vec<(u8, AddressingPath)> = Vec::new();
    {
        let mut analyzer = StorageAddressingAnalyzer::new(
            None,
            Box::new(|opcode, paths| {
                for path in paths {
                    recorded.push((opcode, path));
                }
            }),
        );
        let mut tracer = DataFlowTracer::new(vec![&mut analyzer]);
        let (result, _) = exe
            .debugging_call(
                &mut state,
                &mut ctx,
                account(),
                Some(contract),
                U256::ZERO,
                data,
                Some(&mut tracer),
            )
            .expect("call");
        assert!(!result.failed(), "{:?}", result.error);
    }
    recorded
}

#[test]
fn scalar_store_has_a_two_step_path() {
    let recorded = run_with_analyzer(set_value_runtime(), call_data("setValue(uint256)", &[u64_word(100)]));

    assert_eq!(recorded.len(), 1);
    let (opcode, path) = &recorded[0];
    assert_eq!(*opcode, op::SSTORE);
    assert_eq!(path.len(), 2);
    assert_eq!(path.op(), op::SSTORE);
    assert_eq!(path.seed(), B256::ZERO);
    assert_eq!(path.slot(), B256::ZERO);
}

#[test]
fn dynamic_array_push_yields_length_and_element_paths() {
    let recorded =
        run_with_analyzer(add_address_runtime(), call_data("addAddress(address)", &[addr_word(account())]));

    assert_eq!(recorded.len(), 4, "expected length read/write and element read/write");

    // array length read
    assert_eq!(recorded[0].0, op::SLOAD);
    assert_eq!(recorded[0].1.len(), 2);
    assert_eq!(recorded[0].1.seed(), B256::ZERO);
    assert_eq!(recorded[0].1.slot(), B256::ZERO);

    // array length write
    assert_eq!(recorded[1].0, op::SSTORE);
    assert_eq!(recorded[1].1.len(), 2);
    assert_eq!(recorded[1].1.seed(), B256::ZERO);
    assert_eq!(recorded[1].1.slot(), B256::ZERO);

    // element read (read-modify-write), via PUSH -> KECCAK256 -> ADD -> SLOAD
    assert_eq!(recorded[2].0, op::SLOAD);
    assert_eq!(recorded[2].1.len(), 4);
    assert_eq!(recorded[2].1.seed(), B256::ZERO);
    assert_eq!(recorded[2].1.slot(), ARRAY_BASE);

    // element write
    assert_eq!(recorded[3].0, op::SSTORE);
    assert_eq!(recorded[3].1.len(), 4);
    assert_eq!(recorded[3].1.seed(), B256::ZERO);
    assert_eq!(recorded[3].1.slot(), ARRAY_BASE);
}

#[test]
fn mapping_access_paths_cross_the_hash() {
    // the token's balanceOf does mem[0]=key, mem[32]=0, keccak(0,64), sload
    let recorded = run_with_analyzer(
        common::token_runtime(),
        call_data("balanceOf(address)", &[addr_word(account())]),
    );

    let mapping_reads: Vec<_> = recorded
        .iter()
        .filter(|(opcode, path)| *opcode == op::SLOAD && path.len() == 3)
        .collect();
    assert_eq!(mapping_reads.len(), 1, "one mapping SLOAD path expected");
    let (_, path) = mapping_reads[0];
    // seed is the mapping's base slot (the second hashed word)
    assert_eq!(path.seed(), B256::ZERO);
    assert_eq!(path.op(), op::SLOAD);
}
