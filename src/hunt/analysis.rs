//! Attack explanation: replay the victim in both scenarios under taint and
//! addressing analyzers, align the execution paths, locate the consequence
//! point, and extract the influence trace that connects the shared
//! variable's read to it.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::rc::Rc;

use revm::primitives::{keccak256, B256};
use tracing::debug;

use crate::addressing::{AddressingPath, StorageAddressingAnalyzer, TargetSlot};
use crate::contract::is_token_transfer_selector;
use crate::dataflow::{DataFlowTracer, FlowResult, NodeId, Operation};
use crate::engine::state::StateReader;
use crate::engine::{ExeVM, VmState};
use crate::error::SearchError;
use crate::hunt::attack::Attack;
use crate::hunt::history::TxHistorySession;
use crate::hunt::{attack_search_vm_config, taint::TaintAnalyzer};
use crate::opcode;
use crate::summary::{
    Config, Profits, StateVariable, Transfer, TxSummary, TxSummaryTracer,
};
use crate::tracing::location::{TraceBlock, TraceLocation};
use crate::tracing::msg_call::CallId;
use crate::tracing::CombinedTracer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackPattern {
    /// Same path, different profits at some block.
    ComputationAlteration,
    /// Paths diverge and post-divergence profits differ.
    PathConditionAlteration,
    /// The victim's out-of-gas status differs between scenarios.
    GasEstimationGriefing,
}

impl AttackPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackPattern::ComputationAlteration => "ComputationAlteration",
            AttackPattern::PathConditionAlteration => "PathConditionAlteration",
            AttackPattern::GasEstimationGriefing => "GasEstimationGriefing",
        }
    }
}

/// The explanation of one shared variable's influence on the victim.
#[derive(Debug)]
pub struct AttackAnalysis {
    pub pattern: AttackPattern,
    pub shared_variable: StateVariable,
    /// Symbolic addressing paths of the shared variable, when it is a
    /// storage slot.
    pub addressing_paths: Vec<AddressingPath>,
    pub original_value: String,
    pub altered_value: String,
    pub write_point: Option<TraceLocation>,
    pub read_point: Option<TraceLocation>,
    pub consequence_point: TraceLocation,
    /// The provenance chain from the shared-variable read to the
    /// consequence, in execution order.
    pub influence_trace: Vec<Operation>,
    /// Canonical vulnerability identifier: per-call segments rendered as
    /// `codeHash:pc,pc,…` joined with `->`.
    pub influence_string: String,
}

impl AttackAnalysis {
    /// Deterministic for the same attack and shared variable.
    pub fn hash(&self, attack_hash: B256) -> B256 {
        let mut preimage = Vec::new();
        preimage.extend_from_slice(attack_hash.as_slice());
        preimage.extend_from_slice(self.shared_variable.id().as_bytes());
        keccak256(&preimage)
    }
}

/// Run the full analysis pass for a detected attack. The resulting
/// analyses are stored on the attack and returned.
pub fn analyze(attack: &mut Attack, session: &TxHistorySession) -> Result<(), SearchError> {
    let ar = attack.attack_record.clone();
    let vr = attack.victim_record.clone();
    let (Some(ar_summary), Some(vr_summary)) = (&ar.summary, &vr.summary) else {
        return Ok(());
    };

    // Instances of shared variables: written by A, read by V.
    let shared: Vec<(StateVariable, StateVariable)> = ar_summary
        .overall_defs()
        .intersect_with(vr_summary.overall_uses())
        .into_iter()
        .map(|(w, r)| (w.clone(), r.clone()))
        .collect();
    if shared.is_empty() {
        return Ok(());
    }

    debug!(
        attack = %ar.tx.hash(),
        victim = %vr.tx.hash(),
        shared = shared.len(),
        "start processing attack case"
    );

    let exe = ExeVM::new(attack_search_vm_config());

    // 1: reference path: the victim in the attack-free scenario.
    let mut asif_state = ar.state.clone_state();
    let mut asif_ctx = ar.ctx.clone();
    for pre in session.slice_prerequisites(&vr, &ar) {
        exe.apply_tx(&mut asif_state, &pre.tx, &mut asif_ctx, false, false, None)
            .map_err(SearchError::Engine)?;
    }
    let mut af_tracer =
        TxSummaryTracer::new(Config { include_transfer: true, include_trace: true, ..Config::default() });
    exe.apply_tx(&mut asif_state, &vr.tx, &mut asif_ctx, false, true, Some(&mut af_tracer))
        .map_err(SearchError::Engine)?;
    let Some(af_summary) = af_tracer.take_summary() else {
        return Ok(());
    };
    let ref_path = af_summary.flattened_execution_path().clone();

    // 2: original/altered values and analyzers per shared variable.
    let mut pre_attack_state = ar.state.clone_state();
    let mut pre_victim_state = vr.state.clone_state();
    let mut pairs: Vec<PairInfo> = Vec::new();
    for (write, read) in &shared {
        let (original, altered) = match write {
            StateVariable::Balance { address, .. } => (
                pre_attack_state.balance_of(*address).to_string(),
                pre_victim_state.balance_of(*address).to_string(),
            ),
            StateVariable::Storage { address, slot, .. } => (
                pre_attack_state.storage_value(*address, *slot).to_string(),
                pre_victim_state.storage_value(*address, *slot).to_string(),
            ),
            StateVariable::Code { address, .. } => (
                format!("0x{}", hex::encode(pre_attack_state.code_of(*address))),
                format!("0x{}", hex::encode(pre_victim_state.code_of(*address))),
            ),
        };
        pairs.push(PairInfo {
            write: write.clone(),
            read: read.clone(),
            original,
            altered,
            paths: Rc::new(RefCell::new(Vec::new())),
        });
    }

    let mut taint_analyzers: Vec<TaintAnalyzer<'_>> = pairs
        .iter()
        .map(|p| TaintAnalyzer::new(p.read.clone(), &ref_path))
        .collect();
    let mut addressing_analyzers: Vec<Option<StorageAddressingAnalyzer<'_>>> = pairs
        .iter()
        .map(|p| match &p.read {
            StateVariable::Storage { address, slot, .. } => {
                let cell = Rc::clone(&p.paths);
                Some(StorageAddressingAnalyzer::new(
                    Some(TargetSlot { address: *address, slot: *slot }),
                    Box::new(move |op, candidates| {
                        if op != opcode::SLOAD {
                            return;
                        }
                        let mut paths = cell.borrow_mut();
                        for candidate in candidates {
                            if !paths.iter().any(|p: &AddressingPath| p.same_access(&candidate)) {
                                paths.push(candidate);
                            }
                        }
                    }),
                ))
            }
            _ => None,
        })
        .collect();

    // 3: replay the victim in the attack scenario under summary + taint +
    // addressing tracers.
    let mut summary_tracer_a =
        TxSummaryTracer::new(Config { include_transfer: true, include_trace: true, ..Config::default() });
    let (summary_a, flow) = {
        let mut analyzer_refs: Vec<&mut dyn crate::dataflow::Analyzer> = Vec::new();
        for (taint, addressing) in taint_analyzers.iter_mut().zip(addressing_analyzers.iter_mut()) {
            analyzer_refs.push(taint);
            if let Some(addressing) = addressing {
                analyzer_refs.push(addressing);
            }
        }
        let mut flow_tracer = DataFlowTracer::new(analyzer_refs);
        let mut victim_state = vr.state.clone_state();
        let mut victim_ctx = vr.ctx.clone();
        {
            let mut combined =
                CombinedTracer::new(vec![&mut summary_tracer_a, &mut flow_tracer]);
            exe.apply_tx(&mut victim_state, &vr.tx, &mut victim_ctx, false, true, Some(&mut combined))
                .map_err(SearchError::Engine)?;
        }
        let flow = flow_tracer.take_result();
        let Some(summary_a) = summary_tracer_a.take_summary() else {
            return Ok(());
        };
        (summary_a, flow)
    };

    // 4: align the two execution paths and locate consequence candidates.
    let victim = attack.victim;
    let transfers_a: Vec<Transfer> = summary_a
        .overall_transfers()
        .iter()
        .filter(|t| t.from() == victim || t.to() == victim)
        .cloned()
        .collect();
    let transfers_af: Vec<Transfer> = af_summary
        .overall_transfers()
        .iter()
        .filter(|t| t.from() == victim || t.to() == victim)
        .cloned()
        .collect();

    let path_a = summary_a.flattened_execution_path();
    let inside_a = profits_inside_fn(&transfers_a, victim);
    let inside_af = profits_inside_fn(&transfers_af, victim);
    let reverts_a = reverts_fn(&summary_a);
    let reverts_af = reverts_fn(&af_summary);
    let (points_a, _points_af, diverged) = locate_consequence_points(
        path_a,
        &ref_path,
        &inside_a,
        &inside_af,
        &reverts_a,
        &reverts_af,
    );
    if points_a.is_empty() {
        return Ok(());
    }

    let pattern = if diverged {
        let a_oog = vr.summary.as_ref().map_or(false, |s| s.out_of_gas());
        if a_oog != af_summary.out_of_gas() {
            AttackPattern::GasEstimationGriefing
        } else {
            AttackPattern::PathConditionAlteration
        }
    } else {
        AttackPattern::ComputationAlteration
    };

    // 5: per shared variable, find the last tainted consequence block and
    // walk the influence trace back to the variable read.
    let mut code_hash_state = vr.state.clone_state();
    let mut analyses = Vec::new();
    for (i, pair) in pairs.iter().enumerate() {
        let taint = &taint_analyzers[i];
        let mut found: Option<(TraceLocation, NodeId)> = None;
        'points: for idx in points_a.iter().rev() {
            let Ok(idx) = usize::try_from(*idx) else { continue };
            let Some(block) = path_a.get(idx) else { continue };
            let location = if diverged {
                match block.tail() {
                    Some(tail) => tail.clone(),
                    None => continue,
                }
            } else {
                // The consequence is the transfer's own operation.
                let mut hit = None;
                for loc in &block.content {
                    if transfers_a
                        .iter()
                        .any(|t| t.location().map_or(false, |l| l.index == loc.index))
                    {
                        hit = Some(loc.clone());
                        break;
                    }
                }
                match hit {
                    Some(loc) => loc,
                    None => continue,
                }
            };
            let sinks = match location.op {
                opcode::JUMP | opcode::JUMPI => &taint.jumps,
                opcode::CALL => &taint.calls,
                c if opcode::is_log(c) => &taint.logs,
                _ => {
                    debug!(op = opcode::name(location.op), "unexpected consequence opcode");
                    continue 'points;
                }
            };
            if let Some(node) = sinks.get(&location.index) {
                found = Some((location, *node));
                break 'points;
            }
        }
        // No tainted consequence: this variable does not explain the
        // attack.
        let Some((consequence_point, sink)) = found else { continue };

        let Some((source, influence_trace)) =
            locate_influence_trace(&flow, sink, &taint.sources)
        else {
            continue;
        };
        let read_point = flow.graph.operation(source).loc.clone();

        let influence_string =
            influence_string(&flow, &influence_trace, pattern, &mut code_hash_state);

        analyses.push(AttackAnalysis {
            pattern,
            shared_variable: pair.read.clone(),
            addressing_paths: pair.paths.borrow().clone(),
            original_value: pair.original.clone(),
            altered_value: pair.altered.clone(),
            write_point: pair.write.location().cloned(),
            read_point: Some(read_point),
            consequence_point,
            influence_trace,
            influence_string,
        });
    }

    attack.analyses = analyses;
    Ok(())
}

struct PairInfo {
    write: StateVariable,
    read: StateVariable,
    original: String,
    altered: String,
    paths: Rc<RefCell<Vec<AddressingPath>>>,
}

fn profits_inside_fn<'t>(
    transfers: &'t [Transfer],
    victim: revm::primitives::Address,
) -> impl Fn(&TraceBlock) -> Option<Profits> + 't {
    move |block: &TraceBlock| {
        let mut found = false;
        let mut profits = Profits::new();
        for transfer in transfers {
            let Some(location) = transfer.location() else { continue };
            if !block.contains(location) {
                continue;
            }
            let transfer_profits = Profits(transfer.profits()).profits_of(victim);
            if !transfer_profits.is_empty() {
                found = true;
                profits.add(transfer_profits.0);
            }
        }
        found.then_some(profits)
    }
}

fn reverts_fn(summary: &TxSummary) -> impl Fn(&TraceBlock) -> bool + '_ {
    move |block: &TraceBlock| {
        let Some(tail) = block.tail() else { return false };
        summary
            .arena
            .find_by_position(summary.root, &tail.position)
            .map_or(false, |id| summary.arena.get(id).failed())
    }
}

fn blocks_equal(b1: &TraceBlock, b2: &TraceBlock) -> bool {
    match (b1.head(), b2.head()) {
        (Some(h1), Some(h2)) => {
            b1.code_addr == b2.code_addr
                && h1.pc == h2.pc
                && h1.position.cmp_order(&h2.position) == Ordering::Equal
        }
        _ => false,
    }
}

/// Align two block paths. Matching blocks proceed in lockstep; a mismatch
/// opens a search for the next re-merge, accumulating victim profits seen
/// inside the divergent region. Returns candidate consequence indices into
/// each path and whether the paths diverged.
#[allow(clippy::too_many_arguments)]
fn locate_consequence_points(
    path1: &[TraceBlock],
    path2: &[TraceBlock],
    inside1: &dyn Fn(&TraceBlock) -> Option<Profits>,
    inside2: &dyn Fn(&TraceBlock) -> Option<Profits>,
    reverts1: &dyn Fn(&TraceBlock) -> bool,
    reverts2: &dyn Fn(&TraceBlock) -> bool,
) -> (Vec<isize>, Vec<isize>, bool) {
    let mut diverge1: Vec<isize> = Vec::new();
    let mut diverge2: Vec<isize> = Vec::new();
    let mut differ1: Vec<isize> = Vec::new();
    let mut differ2: Vec<isize> = Vec::new();
    let mut profits1 = Profits::new();
    let mut profits2 = Profits::new();

    // Fold the blocks [i1, j1) x [i2, j2) into the running profits;
    // returns whether anything profit-relevant happened.
    let mut update = |profits1: &mut Profits,
                      profits2: &mut Profits,
                      differ1: &mut Vec<isize>,
                      differ2: &mut Vec<isize>,
                      i1: usize,
                      j1: usize,
                      i2: usize,
                      j2: usize|
     -> bool {
        let mut updated = false;
        let mut local1 = Profits::new();
        let mut local2 = Profits::new();
        let mut last1: isize = -1;
        let mut last2: isize = -1;
        for k1 in i1..j1 {
            if reverts1(&path1[k1]) {
                updated = true;
                *profits1 = Profits::new();
            }
            if let Some(p) = inside1(&path1[k1]) {
                updated = true;
                last1 = k1 as isize;
                local1.add(p.0);
            }
        }
        for k2 in i2..j2 {
            if reverts2(&path2[k2]) {
                updated = true;
                *profits2 = Profits::new();
            }
            if let Some(p) = inside2(&path2[k2]) {
                updated = true;
                last2 = k2 as isize;
                local2.add(p.0);
            }
        }
        profits1.add(local1.0.clone());
        profits2.add(local2.0.clone());
        let local_same = matches!(local2.cmp_profits(&local1), Ok(Ordering::Equal));
        if !local_same {
            if last1 >= 0 {
                differ1.push(last1);
            }
            if last2 >= 0 {
                differ2.push(last2);
            }
        }
        updated
    };

    let same_profits =
        |p1: &Profits, p2: &Profits| matches!(p2.cmp_profits(p1), Ok(Ordering::Equal));

    let (mut i1, mut i2) = (0usize, 0usize);
    'proceed: while i1 < path1.len() && i2 < path2.len() {
        if blocks_equal(&path1[i1], &path2[i2]) {
            update(
                &mut profits1, &mut profits2, &mut differ1, &mut differ2, i1, i1 + 1, i2, i2 + 1,
            );
            i1 += 1;
            i2 += 1;
            continue 'proceed;
        }
        // Paths diverge here; search for the next merge point.
        diverge1.push(i1 as isize - 1);
        diverge2.push(i2 as isize - 1);
        for j1 in i1..path1.len() {
            for j2 in i2..path2.len() {
                if !blocks_equal(&path1[j1], &path2[j2]) {
                    continue;
                }
                let updated = update(
                    &mut profits1, &mut profits2, &mut differ1, &mut differ2, i1, j1, i2, j2,
                );
                if updated && !same_profits(&profits1, &profits2) {
                    return (diverge1, diverge2, true);
                }
                i1 = j1;
                i2 = j2;
                continue 'proceed;
            }
        }
        // The paths never merge again.
        let updated = update(
            &mut profits1,
            &mut profits2,
            &mut differ1,
            &mut differ2,
            i1,
            path1.len(),
            i2,
            path2.len(),
        );
        return if updated {
            (diverge1, diverge2, true)
        } else {
            (differ1, differ2, false)
        };
    }
    // Identical paths with (necessarily) different profits somewhere.
    (differ1, differ2, false)
}

/// Walk upstream from the sink, preferring the first path that reaches a
/// true source (the shared-variable read). Returns the source node and the
/// visited operations in execution order.
fn locate_influence_trace(
    flow: &FlowResult,
    sink: NodeId,
    sources: &HashSet<usize>,
) -> Option<(NodeId, Vec<Operation>)> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut trace: Vec<NodeId> = Vec::new();

    fn dfs(
        flow: &FlowResult,
        node: NodeId,
        sources: &HashSet<usize>,
        visited: &mut HashSet<NodeId>,
        trace: &mut Vec<NodeId>,
    ) -> Option<NodeId> {
        if !visited.insert(node) {
            return None;
        }
        let depth = trace.len();
        trace.push(node);
        if sources.contains(&flow.graph.operation(node).index()) {
            return Some(node);
        }
        for from in flow.graph.upstream(node) {
            if let Some(found) = dfs(flow, from, sources, visited, trace) {
                return Some(found);
            }
            trace.truncate(depth + 1);
        }
        trace.truncate(depth);
        None
    }

    let source = dfs(flow, sink, sources, &mut visited, &mut trace)?;
    let mut operations: Vec<Operation> =
        trace.iter().map(|n| flow.graph.operation(*n).clone()).collect();
    operations.reverse();
    Some((source, operations))
}

/// Split the influence trace into per-call segments and render each as
/// `codeHash:pc,pc,…`. For computation-alteration cases that end in a LOG,
/// trailing segments whose top-level call is a recognized token-transfer
/// invocation are dropped.
fn influence_string<S: VmState>(
    flow: &FlowResult,
    trace: &[Operation],
    pattern: AttackPattern,
    state: &mut S,
) -> String {
    if trace.is_empty() {
        return String::new();
    }
    let mut segments: Vec<Vec<&Operation>> = Vec::new();
    let mut current: Vec<&Operation> = Vec::new();
    let mut last_call: Option<CallId> = None;
    for op in trace {
        if let Some(last) = last_call {
            if last != op.call {
                segments.push(std::mem::take(&mut current));
            }
        }
        current.push(op);
        last_call = Some(op.call);
    }
    segments.push(current);

    let last_op = trace.last().expect("non-empty trace");
    if pattern == AttackPattern::ComputationAlteration && opcode::is_log(last_op.op()) {
        for i in (0..segments.len()).rev() {
            let call = flow.arena.get(segments[i][0].call);
            if call.op == opcode::CALL && is_token_transfer_selector(&call.input) {
                segments.truncate(i);
                break;
            }
        }
    }

    segments
        .iter()
        .map(|segment| {
            let code_hash = state.code_hash_of(segment[0].code_addr());
            let mut pcs: Vec<String> = Vec::new();
            for op in segment {
                let pc = op.pc().to_string();
                if !pcs.contains(&pc) {
                    pcs.push(pc);
                }
            }
            format!("{}:{}", code_hash, pcs.join(","))
        })
        .collect::<Vec<_>>()
        .join("->")
}
