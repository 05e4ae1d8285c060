//! Shared test fixtures: a minimal EVM assembler, handwritten fixture
//! contracts (a token with a balances mapping, storage-shape contracts)
//! and a configurable data-flow analyzer.

#![allow(dead_code)]

use std::collections::HashMap;

use revm::primitives::{Address, Bytes, B256, U256};

use sandscan::dataflow::{
    policy, AfterHook, Analyzer, FlowCx, FlowGraph, NodeExt, NodeId, OpId, Operation,
};
use sandscan::engine::{ExeVM, MemoryState, VmContext};
use sandscan::opcode as op;

/// Tiny assembler with labels; push widths are chosen automatically and
/// label references are fixed up as PUSH2.
#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    fixups: Vec<(usize, &'static str)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    pub fn push(&mut self, value: U256) -> &mut Self {
        let bytes = value.to_be_bytes::<32>();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(31);
        let operand = &bytes[skip..];
        self.code.push(op::PUSH1 + (operand.len() - 1) as u8);
        self.code.extend_from_slice(operand);
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.push(U256::from(value))
    }

    pub fn push_b256(&mut self, value: B256) -> &mut Self {
        self.code.push(op::PUSH32);
        self.code.extend_from_slice(value.as_slice());
        self
    }

    pub fn push_label(&mut self, name: &'static str) -> &mut Self {
        self.code.push(op::PUSH1 + 1); // PUSH2
        self.fixups.push((self.code.len(), name));
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.code.len());
        self.op(op::JUMPDEST)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn build(mut self) -> Vec<u8> {
        for (at, name) in &self.fixups {
            let target = *self.labels.get(name).unwrap_or_else(|| panic!("label {name}"));
            let bytes = (target as u16).to_be_bytes();
            self.code[*at] = bytes[0];
            self.code[*at + 1] = bytes[1];
        }
        self.code
    }
}

pub fn selector(signature: &str) -> u32 {
    let s = sandscan::contract::selector(signature);
    u32::from_be_bytes(s)
}

/// Emits `mem[offset] = <top of stack>`; consumes the value.
fn mstore_at(asm: &mut Asm, offset: u64) {
    asm.push_u64(offset).op(op::MSTORE);
}

/// Emits the mapping-slot derivation `keccak256(key ∥ 0)` for the key on
/// top of the stack; leaves the slot on the stack.
fn mapping_slot(asm: &mut Asm) {
    mstore_at(asm, 0x00); // mem[0x00] = key
    asm.push_u64(0);
    mstore_at(asm, 0x20); // mem[0x20] = base slot 0
    asm.push_u64(0x40).push_u64(0x00).op(op::KECCAK256);
}

/// The fixture token: a balances mapping at slot 0 with `balanceOf`,
/// `transfer` and `transferFrom`, emitting the ERC-20 Transfer event. The
/// constructor credits the deployer with its argument.
pub fn token_runtime() -> Vec<u8> {
    let transfer_topic = sandscan::contract::erc20_transfer_topic();
    let mut asm = Asm::new();

    // selector dispatch
    asm.push_u64(0).op(op::CALLDATALOAD).push_u64(0xe0).op(op::SHR);
    asm.op(op::DUP1)
        .push_u64(selector("balanceOf(address)") as u64)
        .op(op::EQ)
        .push_label("balance_of")
        .op(op::JUMPI);
    asm.op(op::DUP1)
        .push_u64(selector("transfer(address,uint256)") as u64)
        .op(op::EQ)
        .push_label("transfer")
        .op(op::JUMPI);
    asm.op(op::DUP1)
        .push_u64(selector("transferFrom(address,address,uint256)") as u64)
        .op(op::EQ)
        .push_label("transfer_from")
        .op(op::JUMPI);
    asm.push_u64(0).push_u64(0).op(op::REVERT);

    // balanceOf(address)
    asm.label("balance_of");
    asm.push_u64(0x04).op(op::CALLDATALOAD);
    mapping_slot(&mut asm);
    asm.op(op::SLOAD);
    mstore_at(&mut asm, 0x00);
    asm.push_u64(0x20).push_u64(0x00).op(op::RETURN);

    // transfer(to, amount): from = caller
    asm.label("transfer");
    // balances[caller] -= amount
    asm.op(op::CALLER);
    mapping_slot(&mut asm); // [sel, fromSlot]
    asm.op(op::DUP1).op(op::SLOAD); // [sel, fromSlot, fromBal]
    asm.push_u64(0x24).op(op::CALLDATALOAD); // [.., fromBal, amt]
    asm.op(op::SWAP1).op(op::SUB); // [sel, fromSlot, fromBal - amt]
    asm.op(op::SWAP1).op(op::SSTORE); // [sel]
    // balances[to] += amount
    asm.push_u64(0x04).op(op::CALLDATALOAD);
    mapping_slot(&mut asm); // [sel, toSlot]
    asm.op(op::DUP1).op(op::SLOAD); // [sel, toSlot, toBal]
    asm.push_u64(0x24).op(op::CALLDATALOAD); // [.., toBal, amt]
    asm.op(op::ADD); // [sel, toSlot, toBal + amt]
    asm.op(op::SWAP1).op(op::SSTORE); // [sel]
    // emit Transfer(caller, to, amount)
    asm.push_u64(0x24).op(op::CALLDATALOAD);
    mstore_at(&mut asm, 0x00); // mem[0] = amount
    asm.push_u64(0x04).op(op::CALLDATALOAD); // [sel, to]
    asm.op(op::CALLER); // [sel, to, from]
    asm.push_b256(transfer_topic); // [sel, to, from, topic]
    asm.push_u64(0x20).push_u64(0x00).op(op::LOG3);
    // return true
    asm.push_u64(1);
    mstore_at(&mut asm, 0x00);
    asm.push_u64(0x20).push_u64(0x00).op(op::RETURN);

    // transferFrom(from, to, amount)
    asm.label("transfer_from");
    asm.push_u64(0x04).op(op::CALLDATALOAD);
    mapping_slot(&mut asm);
    asm.op(op::DUP1).op(op::SLOAD);
    asm.push_u64(0x44).op(op::CALLDATALOAD);
    asm.op(op::SWAP1).op(op::SUB);
    asm.op(op::SWAP1).op(op::SSTORE);
    asm.push_u64(0x24).op(op::CALLDATALOAD);
    mapping_slot(&mut asm);
    asm.op(op::DUP1).op(op::SLOAD);
    asm.push_u64(0x44).op(op::CALLDATALOAD);
    asm.op(op::ADD);
    asm.op(op::SWAP1).op(op::SSTORE);
    asm.push_u64(0x44).op(op::CALLDATALOAD);
    mstore_at(&mut asm, 0x00);
    asm.push_u64(0x24).op(op::CALLDATALOAD); // to
    asm.push_u64(0x04).op(op::CALLDATALOAD); // from
    asm.push_b256(transfer_topic);
    asm.push_u64(0x20).push_u64(0x00).op(op::LOG3);
    asm.push_u64(1);
    mstore_at(&mut asm, 0x00);
    asm.push_u64(0x20).push_u64(0x00).op(op::RETURN);

    asm.build()
}

/// Wrap a runtime into init code that first runs `constructor`, then
/// returns the runtime. The constructor may consume trailing calldata-style
/// arguments appended after the init code.
pub fn initcode(constructor: impl FnOnce(&mut Asm), runtime: &[u8]) -> Vec<u8> {
    let mut asm = Asm::new();
    constructor(&mut asm);
    asm.push_label("runtime_len_a");
    asm.push_label("runtime_start");
    asm.push_u64(0).op(op::CODECOPY);
    asm.push_label("runtime_len_b");
    asm.push_u64(0).op(op::RETURN);
    // The label table can point anywhere in the byte stream; reuse it to
    // patch in the runtime length and offset.
    let mut code = {
        asm.labels.insert("runtime_len_a", runtime.len());
        asm.labels.insert("runtime_len_b", runtime.len());
        let here = asm.code.len();
        asm.labels.insert("runtime_start", here);
        asm.build()
    };
    code.extend_from_slice(runtime);
    code
}

/// The token's init code: `balances[caller] = arg`, then return the
/// runtime. The 32-byte argument is appended after the init code.
pub fn token_initcode() -> Vec<u8> {
    initcode(
        |asm| {
            asm.op(op::CALLER);
            mapping_slot(asm); // [slot]
            // arg = last 32 bytes of the deployment payload
            asm.push_u64(0x20)
                .op(op::DUP1)
                .op(op::CODESIZE)
                .op(op::SUB) // [slot, 32, cs - 32]
                .push_u64(0x40)
                .op(op::CODECOPY); // mem[0x40] = arg
            asm.push_u64(0x40).op(op::MLOAD); // [slot, arg]
            asm.op(op::SWAP1).op(op::SSTORE);
        },
        &token_runtime(),
    )
}

/// `setValue(x)`: stores calldata word 4 into slot 0.
pub fn set_value_runtime() -> Vec<u8> {
    let mut asm = Asm::new();
    asm.push_u64(0x04).op(op::CALLDATALOAD); // [v]
    asm.push_u64(0).op(op::SSTORE);
    asm.op(op::STOP);
    asm.build()
}

/// `addAddress(a)`: pushes onto a dynamic array at slot 0 the Solidity
/// way: read length, store length + 1, then read-modify-write the element
/// slot keccak256(0) + length.
pub fn add_address_runtime() -> Vec<u8> {
    let mut asm = Asm::new();
    asm.push_u64(0).op(op::SLOAD); // [len]
    asm.op(op::DUP1).push_u64(1).op(op::ADD); // [len, len+1]
    asm.push_u64(0).op(op::SSTORE); // [len]
    asm.push_u64(0);
    mstore_at(&mut asm, 0x00); // mem[0] = 0
    asm.push_u64(0x20).push_u64(0x00).op(op::KECCAK256); // [len, k]
    asm.op(op::ADD); // [slot]
    asm.op(op::DUP1).op(op::SLOAD).op(op::POP); // element read-modify-write read
    asm.push_u64(0x04).op(op::CALLDATALOAD); // [slot, a]
    asm.op(op::SWAP1).op(op::SSTORE);
    asm.op(op::STOP);
    asm.build()
}

pub fn plain_initcode(runtime: &[u8]) -> Vec<u8> {
    initcode(|_| {}, runtime)
}

/// Deploy `code` from `from` and return the created address.
pub fn deploy(
    exe: &ExeVM,
    state: &mut MemoryState,
    ctx: &mut VmContext,
    from: Address,
    code: Vec<u8>,
) -> Address {
    let (result, receipt) = exe
        .debugging_call(state, ctx, from, None, U256::ZERO, Bytes::from(code), None)
        .expect("deploy");
    assert!(!result.failed(), "deployment failed: {:?}", result.error);
    receipt.expect("deploy receipt").contract_address.expect("created address")
}

pub fn call_data(signature: &str, args: &[B256]) -> Bytes {
    let mut data = sandscan::contract::selector(signature).to_vec();
    for arg in args {
        data.extend_from_slice(arg.as_slice());
    }
    Bytes::from(data)
}

pub fn addr_word(addr: Address) -> B256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_slice());
    B256::from(word)
}

pub fn u64_word(value: u64) -> B256 {
    B256::from(U256::from(value))
}

/// A data-flow analyzer with pluggable source/sink classification; records
/// the tainted sinks it sees.
pub struct TestAnalyzer<F: FnMut(&Operation) -> (bool, bool)> {
    pub check: F,
    pub tainted_sinks: Vec<(NodeId, usize, u8)>,
}

impl<F: FnMut(&Operation) -> (bool, bool)> TestAnalyzer<F> {
    pub fn new(check: F) -> Self {
        Self { check, tainted_sinks: Vec::new() }
    }

    pub fn sink_fired(&self) -> bool {
        !self.tainted_sinks.is_empty()
    }
}

impl<F: FnMut(&Operation) -> (bool, bool)> Analyzer for TestAnalyzer<F> {
    fn new_flow_node(&mut self, graph: &mut FlowGraph, op_id: OpId, _op: &Operation) -> NodeId {
        graph.new_node("test", op_id, NodeExt::None)
    }

    fn check_operation(&mut self, operation: &Operation) -> (bool, bool) {
        (self.check)(operation)
    }

    fn sink_tainted(&mut self, graph: &FlowGraph, node: NodeId) {
        let operation = graph.operation(node);
        self.tainted_sinks.push((node, operation.index(), operation.op()));
    }

    fn flow(&mut self, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
        policy::default_flow(self, cx)
    }
}

/// Whether any transitive upstream of `node` (itself included) is an
/// operation satisfying `pred`.
pub fn upstream_reaches(
    graph: &FlowGraph,
    node: NodeId,
    pred: &dyn Fn(&Operation) -> bool,
) -> bool {
    let mut stack = vec![node];
    let mut seen = std::collections::HashSet::new();
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        if pred(graph.operation(n)) {
            return true;
        }
        stack.extend(graph.upstream(n));
    }
    false
}

/// An in-memory [`sandscan::BlockchainReader`] serving fixed account data,
/// for forked-state tests.
#[derive(Default)]
pub struct StubReader {
    pub balances: HashMap<Address, U256>,
    pub codes: HashMap<Address, Bytes>,
    pub nonces: HashMap<Address, u64>,
    pub storage: HashMap<(Address, B256), B256>,
    pub latest: u64,
}

use sandscan::chain::{BlockData, BlockTag, BlockchainReader, HeaderData, ReceiptData};
use sandscan::engine::Tx;
use sandscan::error::ReaderError;

impl BlockchainReader for StubReader {
    fn balance_at(&self, addr: Address, _block: BlockTag) -> Result<U256, ReaderError> {
        Ok(self.balances.get(&addr).copied().unwrap_or_default())
    }

    fn code_at(&self, addr: Address, _block: BlockTag) -> Result<Bytes, ReaderError> {
        Ok(self.codes.get(&addr).cloned().unwrap_or_default())
    }

    fn storage_at(&self, addr: Address, slot: B256, _block: BlockTag) -> Result<B256, ReaderError> {
        Ok(self.storage.get(&(addr, slot)).copied().unwrap_or_default())
    }

    fn nonce_at(&self, addr: Address, _block: BlockTag) -> Result<u64, ReaderError> {
        Ok(self.nonces.get(&addr).copied().unwrap_or_default())
    }

    fn block_number(&self) -> Result<u64, ReaderError> {
        Ok(self.latest)
    }

    fn block_hash_by_number(&self, _number: u64) -> Result<B256, ReaderError> {
        Ok(B256::ZERO)
    }

    fn block_by_number(&self, _block: BlockTag) -> Result<BlockData, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn block_by_hash(&self, _hash: B256) -> Result<BlockData, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn header_by_number(&self, _block: BlockTag) -> Result<HeaderData, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn header_by_hash(&self, _hash: B256) -> Result<HeaderData, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn transaction_by_hash(&self, _hash: B256) -> Result<Tx, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn transaction_receipt(&self, _hash: B256) -> Result<ReceiptData, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn transaction_in_block(&self, _block_hash: B256, _index: u64) -> Result<Tx, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn transaction_count(&self, _block_hash: B256) -> Result<u64, ReaderError> {
        Err(ReaderError::NotFound)
    }

    fn chain_id(&self) -> Result<u64, ReaderError> {
        Ok(1)
    }

    fn close(&self) {}
}
