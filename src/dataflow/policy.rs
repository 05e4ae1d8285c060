//! The default per-opcode flow policy. Analyzers call [`default_flow`]
//! from their `flow` method and intercept the opcodes they specialize.

use revm::primitives::{Address, U256};

use crate::dataflow::graph::any_tainted;
use crate::dataflow::{AfterCx, AfterHook, Analyzer, CallTracker, FlowCx, NodeId};
use crate::opcode as op;

/// The i-th mirror argument from the top.
pub fn arg_back(args: &[Option<NodeId>], i: usize) -> Option<NodeId> {
    args[args.len() - 1 - i]
}

/// Mirror arguments below the top `skip` entries.
pub fn args_below(args: &[Option<NodeId>], skip: usize) -> Vec<Option<NodeId>> {
    args[..args.len() - skip].to_vec()
}

/// Mirror arguments `[len-to, len-from)` counting from the top.
pub fn args_range_back(args: &[Option<NodeId>], from: usize, to: usize) -> Vec<Option<NodeId>> {
    args[args.len() - to..args.len() - from].to_vec()
}

pub fn default_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let code = cx.op.op();
    match code {
        op::STOP | op::POP | op::JUMPDEST => None,
        c if op::is_push(c) => push_flow(a, cx),
        c if op::is_dup(c) => dup_flow(a, cx),
        c if op::is_swap(c) => swap_flow(a, cx),
        c if op::is_log(c) => log_flow(a, cx),
        op::ADD..=op::SIGNEXTEND | op::LT..=op::SAR => pure_op_flow(a, cx),
        op::KECCAK256 => hash_op_flow(a, cx),
        op::ADDRESS
        | op::ORIGIN
        | op::CALLER
        | op::CALLDATASIZE
        | op::GASPRICE
        | op::RETURNDATASIZE
        | op::BLOCKHASH
        | op::COINBASE
        | op::TIMESTAMP
        | op::NUMBER
        | op::DIFFICULTY
        | op::GASLIMIT
        | op::CHAINID
        | op::BASEFEE
        | op::PC
        | op::MSIZE
        | op::GAS => tx_const_read_flow(a, cx),
        op::BALANCE => {
            let addr = cx.step.stack_back_addr(0);
            balance_flow(a, cx, addr)
        }
        op::SELFBALANCE => {
            let addr = cx.step.state_addr;
            balance_flow(a, cx, addr)
        }
        op::CALLVALUE => call_value_flow(a, cx),
        op::CALLDATALOAD => call_data_load_flow(a, cx),
        op::CALLDATACOPY => call_data_copy_flow(a, cx),
        op::CODESIZE => {
            let addr = cx.step.code_addr;
            code_read_to_stack_flow(a, cx, addr)
        }
        op::EXTCODESIZE | op::EXTCODEHASH => {
            let addr = cx.step.stack_back_addr(0);
            code_read_to_stack_flow(a, cx, addr)
        }
        op::CODECOPY => {
            let addr = cx.step.code_addr;
            let dest = cx.step.stack_back(0).saturating_to::<u64>();
            let len = cx.step.stack_back(2).saturating_to::<u64>();
            code_read_to_memory_flow(a, cx, addr, dest, len)
        }
        op::EXTCODECOPY => {
            let addr = cx.step.stack_back_addr(0);
            let dest = cx.step.stack_back(1).saturating_to::<u64>();
            let len = cx.step.stack_back(3).saturating_to::<u64>();
            code_read_to_memory_flow(a, cx, addr, dest, len)
        }
        op::RETURNDATACOPY => return_data_copy_flow(a, cx),
        op::MLOAD => mload_flow(a, cx),
        op::MSTORE => mstore_flow(a, cx, 32),
        op::MSTORE8 => mstore_flow(a, cx, 1),
        op::SLOAD => sload_flow(a, cx),
        op::SSTORE => sstore_flow(a, cx),
        op::JUMP => jump_flow(a, cx),
        op::JUMPI => jumpi_flow(a, cx),
        op::CREATE | op::CREATE2 => create_flow(a, cx),
        op::CALL => call_flow(a, cx),
        op::CALLCODE => call_code_flow(a, cx),
        op::DELEGATECALL | op::STATICCALL => delegate_call_flow(a, cx),
        op::RETURN | op::REVERT => return_flow(a, cx),
        op::INVALID => invalid_flow(a, cx),
        op::SELFDESTRUCT => self_destruct_flow(a, cx),
        _ => None,
    }
}

pub fn push_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    if a.check_operation(cx.op).0 {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn dup_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let pos = (cx.op.op() - op::DUP1) as usize;
    let v = cx.stack.get(pos);
    cx.results[0] = v;
    if v.is_none() && a.check_operation(cx.op).0 {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn swap_flow(_a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let pos = (cx.op.op() - op::SWAP1 + 1) as usize;
    cx.stack.swap(pos);
    None
}

fn log_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    if !a.check_operation(cx.op).1 {
        return None;
    }
    let offset = cx.step.stack_back(0).saturating_to::<u64>();
    let length = cx.step.stack_back(1).saturating_to::<u64>();
    let data = cx.memory.load(offset, length);
    let topics = args_below(cx.args, 2);
    if !data.is_empty() || any_tainted(&topics) {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, topics);
        cx.graph.add_upstream(node, data);
        a.sink_tainted(cx.graph, node);
    }
    None
}

pub fn pure_op_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    if any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, upstream);
        cx.results[0] = Some(node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn hash_op_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let offset = cx.op.arg(0).saturating_to::<u64>();
    let length = cx.op.arg(1).saturating_to::<u64>();
    let payload = cx.memory.load(offset, length);
    if !payload.is_empty() {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream(node, payload);
        cx.results[0] = Some(node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn tx_const_read_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    if a.check_operation(cx.op).0 {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn balance_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>, addr: Address) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let bal = cx.chain.balance(addr);
    if bal.is_some() || any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, upstream);
        cx.graph.add_upstream_opt(node, [bal]);
        cx.results[0] = Some(node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn call_value_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let value = cx.calls.get(cx.call).value;
    if value.is_some() {
        cx.results[0] = value;
    } else if a.check_operation(cx.op).0 {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn call_data_load_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let start = cx.step.stack_back(0).saturating_to::<u64>();
    let data = cx.calls.get(cx.call).get_data(start, 32);
    if !data.is_empty() || any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream(node, data);
        cx.graph.add_upstream_opt(node, upstream);
        cx.results[0] = Some(node);
    } else if a.check_operation(cx.op).0 {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn call_data_copy_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let dest = cx.step.stack_back(0).saturating_to::<u64>();
    let offset = cx.step.stack_back(1).saturating_to::<u64>();
    let length = cx.step.stack_back(2).saturating_to::<u64>();
    {
        let FlowCx { graph, memory, calls, call, .. } = cx;
        let tracker: &CallTracker = calls.get(*call);
        memory.store_call_data(graph, tracker, dest, offset, length);
    }
    if a.check_operation(cx.op).0 && cx.memory.load(dest, length).is_empty() {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.memory.store(cx.graph, dest, length, Some(node));
    }
    None
}

fn code_read_to_stack_flow(
    a: &mut dyn Analyzer,
    cx: &mut FlowCx<'_, '_>,
    addr: Address,
) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let code = cx.chain.code(addr);
    if code.is_some() || any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, upstream);
        cx.graph.add_upstream_opt(node, [code]);
        cx.results[0] = Some(node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn code_read_to_memory_flow(
    a: &mut dyn Analyzer,
    cx: &mut FlowCx<'_, '_>,
    addr: Address,
    dest: u64,
    length: u64,
) -> Option<AfterHook> {
    let code = cx.chain.code(addr);
    if any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, upstream);
        cx.graph.add_upstream_opt(node, [code]);
        cx.memory.store(cx.graph, dest, length, Some(node));
    } else if code.is_some() {
        cx.memory.store(cx.graph, dest, length, code);
    } else if a.check_operation(cx.op).0 {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.memory.store(cx.graph, dest, length, Some(node));
    } else {
        cx.memory.clear(cx.graph, dest, length);
    }
    None
}

fn return_data_copy_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let dest = cx.step.stack_back(0).saturating_to::<u64>();
    let offset = cx.step.stack_back(1).saturating_to::<u64>();
    let length = cx.step.stack_back(2).saturating_to::<u64>();
    {
        let FlowCx { graph, memory, calls, child_call, .. } = cx;
        match **child_call {
            Some(child) => {
                let tracker: &CallTracker = calls.get(child);
                memory.store_call_return_data(graph, tracker, dest, offset, length);
            }
            None => memory.clear(graph, dest, length),
        }
    }
    if a.check_operation(cx.op).0 && cx.memory.load(dest, length).is_empty() {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.memory.store(cx.graph, dest, length, Some(node));
    }
    None
}

fn mload_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let start = cx.step.stack_back(0).saturating_to::<u64>();
    let data = cx.memory.load(start, 32);
    if !data.is_empty() || any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream(node, data);
        cx.graph.add_upstream_opt(node, upstream);
        cx.results[0] = Some(node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn mstore_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>, width: u64) -> Option<AfterHook> {
    let start = cx.step.stack_back(0).saturating_to::<u64>();
    let value = arg_back(cx.args, 1);
    cx.memory.store(cx.graph, start, width, value);
    if value.is_none() && a.check_operation(cx.op).0 {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.memory.store(cx.graph, start, width, Some(node));
    }
    None
}

fn sload_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let key = cx.step.stack_back_b256(0);
    let value = cx.storage.load(key);
    if value.is_some() || any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, [value]);
        cx.graph.add_upstream_opt(node, upstream);
        cx.results[0] = Some(node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        cx.results[0] = Some(a.new_flow_node(cx.graph, cx.op_id, cx.op));
    }
    None
}

fn sstore_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let key = cx.step.stack_back_b256(0);
    if any_tainted(cx.args) {
        let upstream = cx.args.to_vec();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, upstream);
        cx.storage.store(key, node);
        if sink {
            a.sink_tainted(cx.graph, node);
        }
    } else if source {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.storage.store(key, node);
    } else {
        cx.storage.clear(key);
    }
    None
}

fn jump_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let sink = a.check_operation(cx.op).1;
    if let Some(dest) = arg_back(cx.args, 0) {
        if sink {
            let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
            cx.graph.add_upstream(node, [dest]);
            a.sink_tainted(cx.graph, node);
        }
    }
    None
}

fn jumpi_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let sink = a.check_operation(cx.op).1;
    let dest = arg_back(cx.args, 0);
    let cond = arg_back(cx.args, 1);
    if (cond.is_some() || dest.is_some()) && sink {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, [cond, dest]);
        a.sink_tainted(cx.graph, node);
    }
    None
}

/// CREATE / CREATE2: the value flows to the new contract's balance, the
/// init code (from memory) to the child call, and the deployed code
/// arrives via the child's return data once the create completes.
fn create_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let offset = cx.step.stack_back(1).saturating_to::<u64>();
    let length = cx.step.stack_back(2).saturating_to::<u64>();
    let data = cx.memory.load(offset, length);

    let child = cx.calls.alloc(cx.child_pos_plain.clone());
    *cx.child_call = Some(child);
    if source {
        let src = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(child).source = Some(src);
    }
    seed_child_data(cx, child, offset, length);

    let value_arg = arg_back(cx.args, 0);
    let top3 = args_range_back(cx.args, 0, 3.min(cx.args.len()));
    if !data.is_empty() || any_tainted(&top3) {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream(node, data.clone());
        cx.graph.add_upstream_opt(node, top3);
        if sink && (value_arg.is_some() || !data.is_empty()) {
            a.sink_tainted(cx.graph, node);
        }
    }

    let op = cx.op.clone();
    let op_id = cx.op_id;
    Some(Box::new(move |a: &mut dyn Analyzer, cx: &mut AfterCx<'_, '_>| {
        let address = cx.stack_back_addr(0);
        let returned = cx.calls.get(child).get_all_return_data();
        if returned.is_empty() {
            cx.chain.set_code(address, None);
        } else {
            let node = a.new_flow_node(cx.graph, op_id, &op);
            cx.graph.add_upstream(node, returned);
            cx.chain.set_code(address, Some(node));
        }
        cx.chain.set_balance(address, value_arg);
    }))
}

fn call_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let addr = cx.step.stack_back_addr(1);
    if cx.op.arg(2) > U256::ZERO {
        // The transferred value flows into both parties' balances.
        let value_node = arg_back(cx.args, 2);
        cx.chain.set_balance(addr, value_node);
        cx.chain.set_balance(cx.step.state_addr, value_node);
    }
    let args_offset = cx.step.stack_back(3).saturating_to::<u64>();
    let args_length = cx.step.stack_back(4).saturating_to::<u64>();
    let ret_offset = cx.step.stack_back(5).saturating_to::<u64>();
    let ret_length = cx.step.stack_back(6).saturating_to::<u64>();
    let args = cx.memory.load(args_offset, args_length);

    let child = alloc_child(cx, addr);
    if source {
        let src = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(child).source = Some(src);
    }
    seed_child_data(cx, child, args_offset, args_length);

    let addr_and_value = args_range_back(cx.args, 1, 3);
    if sink && (any_tainted(&addr_and_value) || !args.is_empty()) {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, addr_and_value);
        cx.graph.add_upstream(node, args);
        a.sink_tainted(cx.graph, node);
    }

    let op = cx.op.clone();
    let op_id = cx.op_id;
    Some(Box::new(move |a: &mut dyn Analyzer, cx: &mut AfterCx<'_, '_>| {
        let success = cx.calls.get(child).get_success();
        if source {
            // A value-bearing CALL reads the sender's balance, so the call
            // itself can be the source.
            let node = a.new_flow_node(cx.graph, op_id, &op);
            cx.graph.add_upstream_opt(node, [success]);
            cx.results[0] = Some(node);
        } else {
            cx.results[0] = success;
        }
        copy_child_return(cx, child, ret_offset, ret_length);
    }))
}

fn call_code_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let addr = cx.step.stack_back_addr(1);
    if cx.op.arg(2) > U256::ZERO {
        // CALLCODE keeps the value within the current account.
        let value_node = arg_back(cx.args, 2);
        cx.chain.set_balance(cx.step.state_addr, value_node);
    }
    let args_offset = cx.step.stack_back(3).saturating_to::<u64>();
    let args_length = cx.step.stack_back(4).saturating_to::<u64>();
    let ret_offset = cx.step.stack_back(5).saturating_to::<u64>();
    let ret_length = cx.step.stack_back(6).saturating_to::<u64>();
    let args = cx.memory.load(args_offset, args_length);

    let child = alloc_child(cx, addr);
    if source {
        let src = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(child).source = Some(src);
    }
    seed_child_data(cx, child, args_offset, args_length);

    let addr_and_value = args_range_back(cx.args, 1, 3);
    if sink && (any_tainted(&addr_and_value) || !args.is_empty()) {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, addr_and_value);
        cx.graph.add_upstream(node, args);
        a.sink_tainted(cx.graph, node);
    }

    Some(Box::new(move |_a: &mut dyn Analyzer, cx: &mut AfterCx<'_, '_>| {
        cx.results[0] = cx.calls.get(child).get_success();
        copy_child_return(cx, child, ret_offset, ret_length);
    }))
}

/// DELEGATECALL and STATICCALL: no value movement; call data flows to the
/// child, status to the stack, return data back into memory.
fn delegate_call_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let addr = cx.step.stack_back_addr(1);
    let args_offset = cx.step.stack_back(2).saturating_to::<u64>();
    let args_length = cx.step.stack_back(3).saturating_to::<u64>();
    let ret_offset = cx.step.stack_back(4).saturating_to::<u64>();
    let ret_length = cx.step.stack_back(5).saturating_to::<u64>();
    let args = cx.memory.load(args_offset, args_length);

    let child = alloc_child(cx, addr);
    if source {
        let src = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(child).source = Some(src);
    }
    seed_child_data(cx, child, args_offset, args_length);

    let addr_node = arg_back(cx.args, 1);
    if sink && (addr_node.is_some() || !args.is_empty()) {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream_opt(node, [addr_node]);
        cx.graph.add_upstream(node, args);
        a.sink_tainted(cx.graph, node);
    }

    Some(Box::new(move |_a: &mut dyn Analyzer, cx: &mut AfterCx<'_, '_>| {
        cx.results[0] = cx.calls.get(child).get_success();
        copy_child_return(cx, child, ret_offset, ret_length);
    }))
}

fn return_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let offset = cx.step.stack_back(0).saturating_to::<u64>();
    let length = cx.step.stack_back(1).saturating_to::<u64>();
    {
        let FlowCx { memory, calls, call, .. } = cx;
        calls.get_mut(*call).store_return_data(memory, offset, length);
    }
    let (source, sink) = a.check_operation(cx.op);
    if source {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(cx.call).success = Some(node);
    } else if sink && cx.calls.get(cx.call).return_data_is_tainted() {
        let returned = cx.calls.get(cx.call).get_all_return_data();
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.graph.add_upstream(node, returned);
        a.sink_tainted(cx.graph, node);
    }
    None
}

fn invalid_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    if sink {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        a.sink_tainted(cx.graph, node);
    } else if source {
        let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(cx.call).success = Some(node);
    }
    None
}

fn self_destruct_flow(a: &mut dyn Analyzer, cx: &mut FlowCx<'_, '_>) -> Option<AfterHook> {
    let (source, sink) = a.check_operation(cx.op);
    let self_addr = cx.step.state_addr;
    if source {
        let code_node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.chain.set_code(self_addr, Some(code_node));
        let success = a.new_flow_node(cx.graph, cx.op_id, cx.op);
        cx.calls.get_mut(cx.call).success = Some(success);
    } else if sink {
        if let Some(target) = arg_back(cx.args, 0) {
            let node = a.new_flow_node(cx.graph, cx.op_id, cx.op);
            cx.graph.add_upstream(node, [target]);
            a.sink_tainted(cx.graph, node);
        }
    }
    // The remaining balance moves to the target; the origin is zeroed.
    let target = cx.step.stack_back_addr(0);
    let self_balance = cx.chain.balance(self_addr);
    cx.chain.set_balance(target, self_balance);
    cx.chain.set_balance(self_addr, None);
    None
}

fn alloc_child(cx: &mut FlowCx<'_, '_>, addr: Address) -> usize {
    let pos = if crate::opcode::is_precompiled(&addr) {
        cx.child_pos_precompile.clone()
    } else {
        cx.child_pos_plain.clone()
    };
    let child = cx.calls.alloc(pos);
    *cx.child_call = Some(child);
    child
}

fn seed_child_data(cx: &mut FlowCx<'_, '_>, child: usize, offset: u64, length: u64) {
    let FlowCx { memory, calls, .. } = cx;
    calls.get_mut(child).store_data(memory, offset, length);
}

fn copy_child_return(cx: &mut AfterCx<'_, '_>, child: usize, dest: u64, length: u64) {
    let AfterCx { graph, memory, calls, .. } = cx;
    let tracker: &CallTracker = calls.get(child);
    memory.store_call_return_data(graph, tracker, dest, 0, length);
}
