//! Opcode metadata the tracers rely on: stack effects, basic-block
//! boundaries, precompile detection and base gas costs.
//!
//! Stack effects are kept as an explicit table rather than derived from the
//! interpreter so that the mirror stack of the data-flow engine always has
//! the same operand cardinality as the real EVM stack (DUP is 0-pop/1-push
//! and SWAP is 0-pop/0-push from the mirror's point of view).

use revm::primitives::Address;

pub const STOP: u8 = 0x00;
pub const ADD: u8 = 0x01;
pub const MUL: u8 = 0x02;
pub const SUB: u8 = 0x03;
pub const DIV: u8 = 0x04;
pub const SDIV: u8 = 0x05;
pub const MOD: u8 = 0x06;
pub const SMOD: u8 = 0x07;
pub const ADDMOD: u8 = 0x08;
pub const MULMOD: u8 = 0x09;
pub const EXP: u8 = 0x0a;
pub const SIGNEXTEND: u8 = 0x0b;
pub const LT: u8 = 0x10;
pub const GT: u8 = 0x11;
pub const SLT: u8 = 0x12;
pub const SGT: u8 = 0x13;
pub const EQ: u8 = 0x14;
pub const ISZERO: u8 = 0x15;
pub const AND: u8 = 0x16;
pub const OR: u8 = 0x17;
pub const XOR: u8 = 0x18;
pub const NOT: u8 = 0x19;
pub const BYTE: u8 = 0x1a;
pub const SHL: u8 = 0x1b;
pub const SHR: u8 = 0x1c;
pub const SAR: u8 = 0x1d;
pub const KECCAK256: u8 = 0x20;
pub const ADDRESS: u8 = 0x30;
pub const BALANCE: u8 = 0x31;
pub const ORIGIN: u8 = 0x32;
pub const CALLER: u8 = 0x33;
pub const CALLVALUE: u8 = 0x34;
pub const CALLDATALOAD: u8 = 0x35;
pub const CALLDATASIZE: u8 = 0x36;
pub const CALLDATACOPY: u8 = 0x37;
pub const CODESIZE: u8 = 0x38;
pub const CODECOPY: u8 = 0x39;
pub const GASPRICE: u8 = 0x3a;
pub const EXTCODESIZE: u8 = 0x3b;
pub const EXTCODECOPY: u8 = 0x3c;
pub const RETURNDATASIZE: u8 = 0x3d;
pub const RETURNDATACOPY: u8 = 0x3e;
pub const EXTCODEHASH: u8 = 0x3f;
pub const BLOCKHASH: u8 = 0x40;
pub const COINBASE: u8 = 0x41;
pub const TIMESTAMP: u8 = 0x42;
pub const NUMBER: u8 = 0x43;
pub const DIFFICULTY: u8 = 0x44;
pub const GASLIMIT: u8 = 0x45;
pub const CHAINID: u8 = 0x46;
pub const SELFBALANCE: u8 = 0x47;
pub const BASEFEE: u8 = 0x48;
pub const POP: u8 = 0x50;
pub const MLOAD: u8 = 0x51;
pub const MSTORE: u8 = 0x52;
pub const MSTORE8: u8 = 0x53;
pub const SLOAD: u8 = 0x54;
pub const SSTORE: u8 = 0x55;
pub const JUMP: u8 = 0x56;
pub const JUMPI: u8 = 0x57;
pub const PC: u8 = 0x58;
pub const MSIZE: u8 = 0x59;
pub const GAS: u8 = 0x5a;
pub const JUMPDEST: u8 = 0x5b;
pub const TLOAD: u8 = 0x5c;
pub const TSTORE: u8 = 0x5d;
pub const MCOPY: u8 = 0x5e;
pub const PUSH0: u8 = 0x5f;
pub const PUSH1: u8 = 0x60;
pub const PUSH32: u8 = 0x7f;
pub const DUP1: u8 = 0x80;
pub const DUP16: u8 = 0x8f;
pub const SWAP1: u8 = 0x90;
pub const SWAP16: u8 = 0x9f;
pub const LOG0: u8 = 0xa0;
pub const LOG1: u8 = 0xa1;
pub const LOG2: u8 = 0xa2;
pub const LOG3: u8 = 0xa3;
pub const LOG4: u8 = 0xa4;
pub const CREATE: u8 = 0xf0;
pub const CALL: u8 = 0xf1;
pub const CALLCODE: u8 = 0xf2;
pub const RETURN: u8 = 0xf3;
pub const DELEGATECALL: u8 = 0xf4;
pub const CREATE2: u8 = 0xf5;
pub const STATICCALL: u8 = 0xfa;
pub const REVERT: u8 = 0xfd;
pub const INVALID: u8 = 0xfe;
pub const SELFDESTRUCT: u8 = 0xff;

pub fn is_push(op: u8) -> bool {
    (PUSH0..=PUSH32).contains(&op)
}

pub fn is_dup(op: u8) -> bool {
    (DUP1..=DUP16).contains(&op)
}

pub fn is_swap(op: u8) -> bool {
    (SWAP1..=SWAP16).contains(&op)
}

pub fn is_log(op: u8) -> bool {
    (LOG0..=LOG4).contains(&op)
}

/// Opcodes that terminate a basic block.
pub fn is_block_tail(op: u8) -> bool {
    matches!(
        op,
        JUMP | JUMPI
            | RETURN
            | STOP
            | INVALID
            | REVERT
            | SELFDESTRUCT
            | CREATE
            | CREATE2
            | CALL
            | CALLCODE
            | DELEGATECALL
            | STATICCALL
    )
}

/// Addresses `0x00..01` through `0x00..ff` are reserved for precompiles.
pub fn is_precompiled(addr: &Address) -> bool {
    let bytes = addr.as_slice();
    bytes[..19].iter().all(|b| *b == 0) && bytes[19] != 0
}

pub fn name(op: u8) -> &'static str {
    match op {
        STOP => "STOP",
        ADD => "ADD",
        MUL => "MUL",
        SUB => "SUB",
        DIV => "DIV",
        SDIV => "SDIV",
        MOD => "MOD",
        SMOD => "SMOD",
        ADDMOD => "ADDMOD",
        MULMOD => "MULMOD",
        EXP => "EXP",
        SIGNEXTEND => "SIGNEXTEND",
        LT => "LT",
        GT => "GT",
        SLT => "SLT",
        SGT => "SGT",
        EQ => "EQ",
        ISZERO => "ISZERO",
        AND => "AND",
        OR => "OR",
        XOR => "XOR",
        NOT => "NOT",
        BYTE => "BYTE",
        SHL => "SHL",
        SHR => "SHR",
        SAR => "SAR",
        KECCAK256 => "KECCAK256",
        ADDRESS => "ADDRESS",
        BALANCE => "BALANCE",
        ORIGIN => "ORIGIN",
        CALLER => "CALLER",
        CALLVALUE => "CALLVALUE",
        CALLDATALOAD => "CALLDATALOAD",
        CALLDATASIZE => "CALLDATASIZE",
        CALLDATACOPY => "CALLDATACOPY",
        CODESIZE => "CODESIZE",
        CODECOPY => "CODECOPY",
        GASPRICE => "GASPRICE",
        EXTCODESIZE => "EXTCODESIZE",
        EXTCODECOPY => "EXTCODECOPY",
        RETURNDATASIZE => "RETURNDATASIZE",
        RETURNDATACOPY => "RETURNDATACOPY",
        EXTCODEHASH => "EXTCODEHASH",
        BLOCKHASH => "BLOCKHASH",
        COINBASE => "COINBASE",
        TIMESTAMP => "TIMESTAMP",
        NUMBER => "NUMBER",
        DIFFICULTY => "DIFFICULTY",
        GASLIMIT => "GASLIMIT",
        CHAINID => "CHAINID",
        SELFBALANCE => "SELFBALANCE",
        BASEFEE => "BASEFEE",
        POP => "POP",
        MLOAD => "MLOAD",
        MSTORE => "MSTORE",
        MSTORE8 => "MSTORE8",
        SLOAD => "SLOAD",
        SSTORE => "SSTORE",
        JUMP => "JUMP",
        JUMPI => "JUMPI",
        PC => "PC",
        MSIZE => "MSIZE",
        GAS => "GAS",
        JUMPDEST => "JUMPDEST",
        RETURN => "RETURN",
        DELEGATECALL => "DELEGATECALL",
        CREATE => "CREATE",
        CREATE2 => "CREATE2",
        CALL => "CALL",
        CALLCODE => "CALLCODE",
        STATICCALL => "STATICCALL",
        REVERT => "REVERT",
        INVALID => "INVALID",
        SELFDESTRUCT => "SELFDESTRUCT",
        op if is_push(op) => "PUSH",
        op if is_dup(op) => "DUP",
        op if is_swap(op) => "SWAP",
        LOG0 => "LOG0",
        LOG1 => "LOG1",
        LOG2 => "LOG2",
        LOG3 => "LOG3",
        LOG4 => "LOG4",
        _ => "UNKNOWN",
    }
}

/// (pops, pushes) of every opcode as observed by a tracer that mirrors the
/// stack. Unknown opcodes report (0, 0).
pub fn stack_effects(op: u8) -> (usize, usize) {
    match op {
        STOP => (0, 0),
        ADD | MUL | SUB | DIV | SDIV | MOD | SMOD | SIGNEXTEND | EXP => (2, 1),
        ADDMOD | MULMOD => (3, 1),
        LT | GT | SLT | SGT | EQ | AND | OR | XOR | BYTE | SHL | SHR | SAR => (2, 1),
        ISZERO | NOT => (1, 1),
        KECCAK256 => (2, 1),
        ADDRESS | ORIGIN | CALLER | CALLVALUE | CALLDATASIZE | CODESIZE | GASPRICE
        | RETURNDATASIZE | COINBASE | TIMESTAMP | NUMBER | DIFFICULTY | GASLIMIT | CHAINID
        | SELFBALANCE | BASEFEE | PC | MSIZE | GAS => (0, 1),
        BALANCE | CALLDATALOAD | EXTCODESIZE | EXTCODEHASH | BLOCKHASH | MLOAD | SLOAD => (1, 1),
        CALLDATACOPY | CODECOPY | RETURNDATACOPY => (3, 0),
        EXTCODECOPY => (4, 0),
        POP => (1, 0),
        MSTORE | MSTORE8 | SSTORE => (2, 0),
        JUMP => (1, 0),
        JUMPI => (2, 0),
        JUMPDEST => (0, 0),
        TLOAD => (1, 1),
        TSTORE => (2, 0),
        MCOPY => (3, 0),
        op if is_push(op) => (0, 1),
        op if is_dup(op) => (0, 1),
        op if is_swap(op) => (0, 0),
        LOG0 => (2, 0),
        LOG1 => (3, 0),
        LOG2 => (4, 0),
        LOG3 => (5, 0),
        LOG4 => (6, 0),
        CREATE => (3, 1),
        CREATE2 => (4, 1),
        CALL | CALLCODE => (7, 1),
        DELEGATECALL | STATICCALL => (6, 1),
        RETURN | REVERT => (2, 0),
        INVALID => (0, 0),
        SELFDESTRUCT => (1, 0),
        _ => (0, 0),
    }
}

/// Static base gas of an opcode. Dynamic components (memory expansion, cold
/// access, value stipends) are not modelled; trace locations only carry this
/// for display and ordering never depends on it.
pub fn base_gas(op: u8) -> u64 {
    match op {
        STOP | INVALID | RETURN | REVERT => 0,
        JUMPDEST => 1,
        ADDRESS | ORIGIN | CALLER | CALLVALUE | CALLDATASIZE | CODESIZE | GASPRICE | COINBASE
        | TIMESTAMP | NUMBER | DIFFICULTY | GASLIMIT | CHAINID | RETURNDATASIZE | PC | MSIZE
        | GAS | BASEFEE | POP => 2,
        ADD | SUB | NOT | LT | GT | SLT | SGT | EQ | ISZERO | AND | OR | XOR | BYTE | SHL | SHR
        | SAR | CALLDATALOAD | MLOAD | MSTORE | MSTORE8 | CALLDATACOPY | CODECOPY
        | RETURNDATACOPY | EXTCODECOPY => 3,
        MUL | DIV | SDIV | MOD | SMOD | SIGNEXTEND | SELFBALANCE => 5,
        ADDMOD | MULMOD | JUMP => 8,
        JUMPI | EXP => 10,
        BLOCKHASH => 20,
        KECCAK256 => 30,
        BALANCE | EXTCODESIZE | EXTCODEHASH | SLOAD | SSTORE | CALL | CALLCODE | DELEGATECALL
        | STATICCALL => 100,
        LOG0 => 375,
        LOG1 => 750,
        LOG2 => 1125,
        LOG3 => 1500,
        LOG4 => 1875,
        CREATE | CREATE2 => 32000,
        SELFDESTRUCT => 5000,
        PUSH0 => 2,
        op if is_push(op) || is_dup(op) || is_swap(op) => 3,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_and_swap_are_mirror_neutral() {
        for op in DUP1..=DUP16 {
            assert_eq!(stack_effects(op), (0, 1));
        }
        for op in SWAP1..=SWAP16 {
            assert_eq!(stack_effects(op), (0, 0));
        }
    }

    #[test]
    fn call_family_effects() {
        assert_eq!(stack_effects(CALL), (7, 1));
        assert_eq!(stack_effects(CALLCODE), (7, 1));
        assert_eq!(stack_effects(DELEGATECALL), (6, 1));
        assert_eq!(stack_effects(STATICCALL), (6, 1));
        assert_eq!(stack_effects(CREATE), (3, 1));
        assert_eq!(stack_effects(CREATE2), (4, 1));
    }

    #[test]
    fn precompile_range() {
        assert!(is_precompiled(&Address::with_last_byte(1)));
        assert!(is_precompiled(&Address::with_last_byte(0xff)));
        assert!(!is_precompiled(&Address::ZERO));
        let mut high = [0u8; 20];
        high[18] = 1;
        high[19] = 1;
        assert!(!is_precompiled(&Address::from(high)));
    }
}
