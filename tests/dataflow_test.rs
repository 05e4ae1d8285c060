//! Data-flow engine scenarios on the fixture token contract.

mod common;

use revm::primitives::{Address, Bytes, U256};

use common::{
    addr_word, call_data, deploy, token_initcode, u64_word, upstream_reaches, TestAnalyzer,
};
use sandscan::dataflow::DataFlowTracer;
use sandscan::engine::{ExeVM, MemoryState, VmContext};
use sandscan::opcode as op;
use sandscan::VmState;

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

/// Deploys the token with constructor argument 100 from `account`.
fn setup() -> Harness {
    let exe = ExeVM::new_debugging();
    let mut state = MemoryState::new();
    let mut ctx = VmContext::debugging();
    let mut code = token_initcode();
    code.extend_from_slice(U256::from(100).to_be_bytes::<32>().as_slice());
    let token = deploy(&exe, &mut state, &mut ctx, account(), code);
    Harness { exe, state, ctx, token }
}

#[test]
fn deployer_has_constructor_balance() {
    let mut h = setup();
    let data = call_data("balanceOf(address)", &[addr_word(account())]);
    let (result, _) = h
        .exe
        .debugging_call(&mut h.state, &mut h.ctx, account(), Some(h.token), U256::ZERO, data, None)
        .expect("balanceOf");
    assert!(!result.failed(), "{:?}", result.error);
    assert_eq!(U256::from_be_slice(&result.return_data), U256::from(100));
}

#[test]
fn return_data_is_tainted_by_calldata_in_balance_of() {
    let mut h = setup();
    let mut analyzer = TestAnalyzer::new(|operation| match operation.op() {
        op::CALLDATALOAD => (true, false),
        op::RETURN => (false, true),
        _ => (false, false),
    });
    let flow = {
        let mut tracer = DataFlowTracer::new(vec![&mut analyzer]);
        let data = call_data("balanceOf(address)", &[addr_word(account())]);
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
            .expect("balanceOf");
        assert!(!result.failed(), "{:?}", result.error);
        tracer.take_result()
    };

    assert!(analyzer.sink_fired(), "RETURN sink did not fire");
    let (sink, _, sink_op) = analyzer.tainted_sinks[0];
    assert_eq!(sink_op, op::RETURN);
    assert!(
        upstream_reaches(&flow.graph, sink, &|operation| matches!(
            operation.op(),
            op::CALLDATALOAD | op::CALLDATACOPY
        )),
        "return data not tainted by call data"
    );
}

#[test]
fn log_is_tainted_in_transfer_from()
{
    let mut h = setup();
    let mut analyzer = TestAnalyzer::new(|operation| match operation.op() {
        op::CALLDATALOAD | op::CALLDATACOPY => (true, false),
        c if sandscan::opcode::is_log(c) => (false, true),
        _ => (false, false),
    });
    {
        let mut tracer = DataFlowTracer::new(vec![&mut analyzer]);
        let data = call_data(
            "transferFrom(address,address,uint256)",
            &[addr_word(account()), addr_word(another_account()), u64_word(100)],
        );
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
            .expect("transferFrom");
        assert!(!result.failed(), "{:?}", result.error);
    }
    assert!(analyzer.sink_fired(), "no LOG sink fired");
    assert!(analyzer.tainted_sinks.iter().all(|(_, _, o)| sandscan::opcode::is_log(*o)));
}

#[test]
fn transfer_log_flows_from_root_calldataload() {
    let mut h = setup();
    let mut analyzer = TestAnalyzer::new(|operation| match operation.op() {
        op::CALLDATALOAD => (true, false),
        c if sandscan::opcode::is_log(c) => (false, true),
        _ => (false, false),
    });
    let flow = {
        let mut tracer = DataFlowTracer::new(vec![&mut analyzer]);
        let data =
            call_data("transfer(address,uint256)", &[addr_word(another_account()), u64_word(100)]);
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
            .expect("transfer");
        assert!(!result.failed(), "{:?}", result.error);
        tracer.take_result()
    };
    assert!(analyzer.sink_fired(), "no LOG sink fired");
    let (sink, _, _) = analyzer.tainted_sinks[0];
    assert!(
        upstream_reaches(&flow.graph, sink, &|operation| {
            operation.op() == op::CALLDATALOAD && operation.position().is_root()
        }),
        "log not tainted by a root-call CALLDATALOAD"
    );
}

#[test]
fn operation_indices_are_strictly_increasing_and_upstreams_older() {
    let mut h = setup();
    let mut analyzer = TestAnalyzer::new(|operation| match operation.op() {
        op::CALLDATALOAD => (true, false),
        op::RETURN => (false, true),
        _ => (false, false),
    });
    let flow = {
        let mut tracer = DataFlowTracer::new(vec![&mut analyzer]);
        let data = call_data("balanceOf(address)", &[addr_word(account())]);
        h.exe
            .debugging_call(
                &mut h.state,
                &mut h.ctx,
                account(),
                Some(h.token),
                U256::ZERO,
                data,
                Some(&mut tracer),
            )
            .expect("balanceOf");
        tracer.take_result()
    };

    let mut last = None;
    for operation in &flow.graph.ops {
        if let Some(last) = last {
            assert!(operation.index() > last, "operation indices must increase");
        }
        last = Some(operation.index());
    }
    for (id, node) in flow.graph.nodes.iter().enumerate() {
        for up in &node.from {
            assert!((*up as usize) < id, "upstream nodes must be strictly older");
        }
    }
}

#[test]
fn replaying_the_same_call_yields_an_equivalent_flow_graph() {
    let h = setup();

    let run = |mut state: MemoryState, mut ctx: VmContext| {
        let mut analyzer = TestAnalyzer::new(|operation| match operation.op() {
            op::CALLDATALOAD => (true, false),
            op::RETURN => (false, true),
            _ => (false, false),
        });
        let exe = ExeVM::new_debugging();
        let flow = {
            let mut tracer = DataFlowTracer::new(vec![&mut analyzer]);
            let data = call_data("balanceOf(address)", &[addr_word(account())]);
            exe.debugging_call(
                &mut state,
                &mut ctx,
                account(),
                Some(h.token),
                U256::ZERO,
                data,
                Some(&mut tracer),
            )
            .expect("balanceOf");
            tracer.take_result()
        };
        let sinks: Vec<usize> = analyzer.tainted_sinks.iter().map(|(_, idx, _)| *idx).collect();
        (flow.graph.nodes.len(), flow.graph.ops.len(), sinks)
    };

    let a = run(h.state.clone_state(), h.ctx.clone());
    let b = run(h.state.clone_state(), h.ctx.clone());
    assert_eq!(a, b, "replay must be deterministic");
}

#[test]
fn untraced_calls_report_plain_results() {
    let mut h = setup();
    // a call with no tracer attached still executes and returns data
    let data = call_data("transfer(address,uint256)", &[addr_word(another_account()), u64_word(40)]);
    let (result, receipt) = h
        .exe
        .debugging_call(&mut h.state, &mut h.ctx, account(), Some(h.token), U256::ZERO, data, None)
        .expect("transfer");
    assert!(!result.failed());
    assert_eq!(U256::from_be_slice(&result.return_data), U256::from(1));
    let receipt = receipt.expect("receipt");
    assert!(receipt.status);
    assert_eq!(receipt.logs.len(), 1);

    let data = call_data("balanceOf(address)", &[addr_word(another_account())]);
    let (result, _) = h
        .exe
        .debugging_call(&mut h.state, &mut h.ctx, account(), Some(h.token), U256::ZERO, data, None)
        .expect("balanceOf");
    assert_eq!(U256::from_be_slice(&result.return_data), U256::from(40));
}

#[test]
fn reverting_calls_surface_as_failed_results() {
    let mut h = setup();
    // unknown selector hits the dispatcher's REVERT
    let (result, receipt) = h
        .exe
        .debugging_call(
            &mut h.state,
            &mut h.ctx,
            account(),
            Some(h.token),
            U256::ZERO,
            Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            None,
        )
        .expect("call");
    assert!(result.failed());
    assert!(!receipt.expect("receipt").status);
}
