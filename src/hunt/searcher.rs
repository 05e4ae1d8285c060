//! The attack search: for every candidate attack anchor, replay later
//! transactions in the attack-free counterfactual and fire the profit
//! oracle. Anchors are searched in parallel over copied states.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revm::primitives::Address;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::chain::BlockchainReader;
use crate::engine::{ExeVM, VmState};
use crate::hunt::analysis;
use crate::hunt::attack::Attack;
use crate::hunt::history::{TxHistory, TxHistorySession, TxPosition, TxRecord};
use crate::hunt::{attack_search_vm_config, SearchContext};
use crate::summary::{Config, Profits, TxSummary, TxSummaryTracer};

pub type AttackHandler = Arc<dyn Fn(&TxHistorySession, &Attack) + Send + Sync>;

/// Observer invoked with both scenario summaries before the oracle
/// decides; used by tooling that wants to inspect every candidate.
pub type OracleHook = Arc<dyn Fn(&OracleObservation<'_>) + Send + Sync>;

pub struct OracleObservation<'a> {
    pub attackers: &'a [Address],
    pub victims: &'a [Address],
    pub attack_record: &'a TxRecord,
    pub victim_record: &'a TxRecord,
    pub profit_record: Option<&'a TxRecord>,
    pub attack_as_if_summary: &'a TxSummary,
    pub victim_as_if_summary: &'a TxSummary,
    pub profit_as_if_summary: Option<&'a TxSummary>,
}

pub type CandidateFilter =
    Arc<dyn Fn(&TxRecord, Option<&TxRecord>, Option<&TxRecord>) -> bool + Send + Sync>;

pub struct AttackSearcher {
    reader: Arc<dyn BlockchainReader>,
    history: Arc<TxHistory>,
    handler: Option<AttackHandler>,
    oracle_hook: Option<OracleHook>,
    /// Parallel attack anchors; 1 searches sequentially.
    concurrency: usize,

    latest_block: AtomicU64,
    prefetched_block: AtomicU64,
}

impl AttackSearcher {
    pub fn new(reader: Arc<dyn BlockchainReader>, history: Arc<TxHistory>) -> Self {
        Self {
            reader,
            history,
            handler: None,
            oracle_hook: None,
            concurrency: 1,
            latest_block: AtomicU64::new(0),
            prefetched_block: AtomicU64::new(0),
        }
    }

    pub fn set_attack_handler(&mut self, handler: AttackHandler) {
        self.handler = Some(handler);
    }

    pub fn set_oracle_hook(&mut self, hook: OracleHook) {
        self.oracle_hook = Some(hook);
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    pub fn open_search_window(self: &Arc<Self>, from: u64, window: usize) -> SearchWindow {
        let session = Arc::new(self.history.start_session(from, window));
        self.latest_block.store(from, AtomicOrdering::Relaxed);
        SearchWindow {
            searcher: Arc::clone(self),
            session,
            search_pivot: TxPosition::default(),
            filter: None,
        }
    }

    /// Keep `num` blocks of history warm ahead of the moving window.
    pub async fn prefetch_blocks(self: &Arc<Self>, ctx: SearchContext, num: usize) {
        loop {
            if ctx.is_done() {
                return;
            }
            let latest = self.latest_block.load(AtomicOrdering::Relaxed);
            if latest > 0 {
                let target = latest + num as u64;
                if target > self.prefetched_block.load(AtomicOrdering::Relaxed) {
                    let range: Vec<u64> = (latest..target).collect();
                    self.history.acquire_blocks(range, self.concurrency, &ctx).await;
                    self.prefetched_block.store(target, AtomicOrdering::Relaxed);
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

pub struct SearchWindow {
    searcher: Arc<AttackSearcher>,
    session: Arc<TxHistorySession>,
    search_pivot: TxPosition,
    filter: Option<CandidateFilter>,
}

impl SearchWindow {
    pub fn session(&self) -> &Arc<TxHistorySession> {
        &self.session
    }

    /// Only candidates at or after the pivot are searched; the rest were
    /// covered by the previous window slide.
    pub fn set_search_pivot(&mut self, block: u64, tx_index: u64) {
        self.search_pivot = TxPosition { block, index: tx_index };
    }

    pub fn set_filter(&mut self, filter: CandidateFilter) {
        self.filter = Some(filter);
    }

    /// Restrict the search to one (attack, victim[, profit]) tuple.
    pub fn set_focus(
        &mut self,
        attack_tx: revm::primitives::B256,
        victim_tx: revm::primitives::B256,
        profit_tx: Option<revm::primitives::B256>,
    ) {
        self.set_filter(Arc::new(move |ar, vr, pr| {
            if ar.tx.hash() != attack_tx {
                return false;
            }
            let Some(vr) = vr else { return true };
            if vr.tx.hash() != victim_tx {
                return false;
            }
            let Some(pr) = pr else { return true };
            profit_tx == Some(pr.tx.hash())
        }));
    }

    /// Release the window's blocks.
    pub fn close(&self) {
        self.session.close();
    }

    /// Search the window. Attack anchors run on the configured worker
    /// pool; each worker owns copied state. Returns the detected attacks
    /// (also delivered to the handler, in discovery order per anchor).
    pub async fn search(&self, ctx: &SearchContext) -> Vec<Attack> {
        let records = Arc::new(self.session.slice_tx_records());
        let found: Arc<Mutex<Vec<Attack>>> = Arc::new(Mutex::new(Vec::new()));
        if records.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(self.searcher.concurrency));
        let mut tasks = Vec::new();

        for (index, ar) in records[..records.len() - 1].iter().enumerate() {
            if ctx.is_done() {
                info!("search early exit due to cancellation");
                break;
            }
            if ar.error.is_some() || ar.is_pseudo() {
                continue;
            }
            if let Some(filter) = &self.filter {
                if !filter(ar, None, None) {
                    continue;
                }
            }
            // Contract creations and plain ether transfers cannot be
            // attack transactions.
            let Some(to) = ar.tx.to else { continue };
            let target_is_contract = self
                .searcher
                .reader
                .code_at(to, Some(ar.block_number.saturating_sub(1)))
                .map(|code| !code.is_empty())
                .unwrap_or(true);
            if !target_is_contract {
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let worker = AnchorWorker {
                searcher: Arc::clone(&self.searcher),
                session: Arc::clone(&self.session),
                records: Arc::clone(&records),
                search_pivot: self.search_pivot,
                filter: self.filter.clone(),
                ctx: ctx.clone(),
                found: Arc::clone(&found),
            };
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                worker.search_victims_given_attack(index);
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
        let mut out = found.lock().expect("search results lock");
        std::mem::take(&mut *out)
    }
}

struct AnchorWorker {
    searcher: Arc<AttackSearcher>,
    session: Arc<TxHistorySession>,
    records: Arc<Vec<Arc<TxRecord>>>,
    search_pivot: TxPosition,
    filter: Option<CandidateFilter>,
    ctx: SearchContext,
    found: Arc<Mutex<Vec<Attack>>>,
}

impl AnchorWorker {
    fn search_victims_given_attack(&self, ar_index: usize) {
        let ar = &self.records[ar_index];
        debug!(attack = %ar.tx.hash(), "search as if it is an attack transaction");
        let exe = ExeVM::new(attack_search_vm_config());

        'victims: for (vr_offset, vr) in self.records[ar_index + 1..].iter().enumerate() {
            if self.ctx.is_done() {
                info!("search early exit due to cancellation");
                return;
            }
            if vr.error.is_some() || vr.is_pseudo() {
                continue;
            }
            if let Some(filter) = &self.filter {
                if !filter(ar, Some(vr), None) {
                    continue;
                }
            }
            if vr.some_contracts_non_verified {
                continue;
            }
            let Some(victim_to) = vr.tx.to else { continue };
            let victim_target_is_contract = self
                .searcher
                .reader
                .code_at(victim_to, Some(vr.block_number.saturating_sub(1)))
                .map(|code| !code.is_empty())
                .unwrap_or(true);
            if !victim_target_is_contract {
                continue;
            }
            if ar.tx.from == vr.tx.from {
                continue;
            }
            if !vr.naive_overlap_with(ar) {
                continue;
            }
            // The victim must read something the attack writes, otherwise
            // its profits cannot depend on the attack.
            if !has_dependency(ar, vr) {
                continue;
            }

            // Attack-free replay: the victim's prerequisites without the
            // attack, then the victim itself.
            let mut state = ar.state.clone_state();
            let mut vm_ctx = ar.ctx.clone();
            for pre in self.session.slice_prerequisites(vr, ar) {
                debug!(
                    attack = %ar.tx.hash(),
                    victim = %vr.tx.hash(),
                    prerequisite = %pre.tx.hash(),
                    "executing victim prerequisite"
                );
                match exe.apply_tx(&mut state, &pre.tx, &mut vm_ctx, false, false, None) {
                    Ok(_) => {}
                    Err(err) if err.is_whitelisted() => continue 'victims,
                    Err(err) => {
                        error!(
                            attack = %ar.tx.hash(),
                            victim = %vr.tx.hash(),
                            prerequisite = %pre.tx.hash(),
                            error = %err,
                            "failed to apply victim prerequisite tx"
                        );
                        continue 'victims;
                    }
                }
            }

            let victim_as_if_summary =
                match summarize_replay(&exe, &mut state, &mut vm_ctx, vr) {
                    Ok(summary) => summary,
                    Err(SkipCandidate::Whitelisted) => continue 'victims,
                    Err(SkipCandidate::Failed) => continue 'victims,
                };

            // The attack transaction after the victim: what the attacker
            // would have gotten without front-running.
            let attack_as_if_summary =
                match summarize_replay(&exe, &mut state, &mut vm_ctx, ar) {
                    Ok(summary) => summary,
                    Err(SkipCandidate::Whitelisted) => continue 'victims,
                    Err(SkipCandidate::Failed) => continue 'victims,
                };

            let Some((attackers, victims)) = infer_attackers_victims(ar, vr) else {
                continue 'victims;
            };

            let attack_as_if_summary = Arc::new(attack_as_if_summary);
            let victim_as_if_summary = Arc::new(victim_as_if_summary);

            if vr.position() >= self.search_pivot {
                debug!(
                    attack = %ar.tx.hash(),
                    victim = %vr.tx.hash(),
                    "checking if it is a real attack"
                );
                if self.check_oracle(
                    &attackers,
                    &victims,
                    ar,
                    vr,
                    None,
                    &attack_as_if_summary,
                    &victim_as_if_summary,
                    None,
                ) {
                    // Found without a profit transaction: the anchor is
                    // done.
                    return;
                }
            }

            // Otherwise look for a trailing profit-taking transaction.
            'profits: for pr in self.records[ar_index + 1 + vr_offset + 1..].iter() {
                if self.ctx.is_done() {
                    info!("search early exit due to cancellation");
                    return;
                }
                if pr.error.is_some() || pr.is_pseudo() {
                    continue;
                }
                if let Some(filter) = &self.filter {
                    if !filter(ar, Some(vr), Some(pr)) {
                        continue;
                    }
                }
                if pr.position() < self.search_pivot {
                    continue;
                }
                if vr.tx.from == pr.tx.from {
                    continue;
                }
                if !pr.naive_overlap_with(ar) {
                    continue;
                }
                // The profit transaction must actually realize a gain for
                // some attacker.
                let profitable = pr.summary.as_ref().map_or(false, |summary| {
                    attackers.iter().any(|attacker| {
                        summary
                            .overall_profits()
                            .profits_of(*attacker)
                            .iter()
                            .any(|p| p.positive())
                    })
                });
                if !profitable {
                    continue;
                }

                let mut profit_state = state.clone_state();
                let mut profit_ctx = vm_ctx.clone();
                for pre in self.session.slice_prerequisites(pr, ar) {
                    match exe.apply_tx(&mut profit_state, &pre.tx, &mut profit_ctx, false, false, None)
                    {
                        Ok(_) => {}
                        Err(err) if err.is_whitelisted() => continue 'profits,
                        Err(err) => {
                            error!(
                                attack = %ar.tx.hash(),
                                profit = %pr.tx.hash(),
                                error = %err,
                                "failed to apply profit prerequisite tx"
                            );
                            continue 'profits;
                        }
                    }
                }
                let profit_as_if_summary =
                    match summarize_replay(&exe, &mut profit_state, &mut profit_ctx, pr) {
                        Ok(summary) => Arc::new(summary),
                        Err(_) => continue 'profits,
                    };

                self.check_oracle(
                    &attackers,
                    &victims,
                    ar,
                    vr,
                    Some(pr),
                    &attack_as_if_summary,
                    &victim_as_if_summary,
                    Some(&profit_as_if_summary),
                );
            }
        }
    }

    /// The attack oracle: some attacker gains more with the attack than
    /// without, and some victim loses. On success the attack is analyzed,
    /// recorded and handed to the handler.
    #[allow(clippy::too_many_arguments)]
    fn check_oracle(
        &self,
        attackers: &[Address],
        victims: &[Address],
        ar: &Arc<TxRecord>,
        vr: &Arc<TxRecord>,
        pr: Option<&Arc<TxRecord>>,
        attack_as_if_summary: &Arc<TxSummary>,
        victim_as_if_summary: &Arc<TxSummary>,
        profit_as_if_summary: Option<&Arc<TxSummary>>,
    ) -> bool {
        if let Some(hook) = &self.searcher.oracle_hook {
            hook(&OracleObservation {
                attackers,
                victims,
                attack_record: ar,
                victim_record: vr,
                profit_record: pr.map(|p| p.as_ref()),
                attack_as_if_summary,
                victim_as_if_summary,
                profit_as_if_summary: profit_as_if_summary.map(|s| s.as_ref()),
            });
        }
        if attackers.is_empty() || victims.is_empty() {
            return false;
        }
        let (Some(ar_summary), Some(vr_summary)) = (&ar.summary, &vr.summary) else {
            return false;
        };

        let mut attack_profits = Profits::new();
        attack_profits.add(ar_summary.overall_profits().0.clone());
        if let Some(pr) = pr {
            if let Some(pr_summary) = &pr.summary {
                attack_profits.add(pr_summary.overall_profits().0.clone());
            }
        }
        let mut attack_as_if_profits = Profits::new();
        attack_as_if_profits.add(attack_as_if_summary.overall_profits().0.clone());
        if let Some(profit_as_if) = profit_as_if_summary {
            attack_as_if_profits.add(profit_as_if.overall_profits().0.clone());
        }
        let victim_profits = vr_summary.overall_profits();
        let victim_as_if_profits = victim_as_if_summary.overall_profits();

        let mut matched: Option<(Address, Profits, Profits)> = None;
        for attacker in attackers {
            let gained = attack_profits.profits_of(*attacker);
            let gained_as_if = attack_as_if_profits.profits_of(*attacker);
            if matches!(gained.cmp_profits(&gained_as_if), Ok(Ordering::Greater)) {
                matched = Some((*attacker, gained, gained_as_if));
                break;
            }
        }
        let Some((attacker, attacker_profits, attacker_as_if_profits)) = matched else {
            return false;
        };

        let mut victim_match: Option<(Address, Profits, Profits)> = None;
        for victim in victims {
            let lost = victim_profits.profits_of(*victim);
            let lost_as_if = victim_as_if_profits.profits_of(*victim);
            if matches!(lost.cmp_profits(&lost_as_if), Ok(Ordering::Less)) {
                victim_match = Some((*victim, lost, lost_as_if));
                break;
            }
        }
        let Some((victim, victim_profit_set, victim_as_if_profit_set)) = victim_match else {
            return false;
        };

        let mut attack = Attack {
            attacker,
            victim,
            attack_record: Arc::clone(ar),
            victim_record: Arc::clone(vr),
            profit_record: pr.cloned(),
            attack_as_if_summary: Arc::clone(attack_as_if_summary),
            victim_as_if_summary: Arc::clone(victim_as_if_summary),
            profit_as_if_summary: profit_as_if_summary.cloned(),
            attacker_profits,
            attacker_as_if_profits,
            victim_profits: victim_profit_set,
            victim_as_if_profits: victim_as_if_profit_set,
            analyses: Vec::new(),
        };

        if let Err(err) = analysis::analyze(&mut attack, &self.session) {
            error!(attack = %attack.hash(), error = %err, "failed to analyze attack");
        }
        if let Some(handler) = &self.searcher.handler {
            handler(&self.session, &attack);
        }
        self.found.lock().expect("search results lock").push(attack);
        true
    }
}

enum SkipCandidate {
    Whitelisted,
    Failed,
}

fn summarize_replay<S: VmState>(
    exe: &ExeVM,
    state: &mut S,
    ctx: &mut crate::engine::VmContext,
    record: &TxRecord,
) -> Result<TxSummary, SkipCandidate> {
    let mut tracer = TxSummaryTracer::new(Config::replay());
    match exe.apply_tx(state, &record.tx, ctx, false, true, Some(&mut tracer)) {
        Ok(_) => tracer.take_summary().ok_or(SkipCandidate::Failed),
        Err(err) if err.is_whitelisted() => Err(SkipCandidate::Whitelisted),
        Err(err) => {
            error!(tx = %record.tx.hash(), error = %err, "failed to summarize replay");
            Err(SkipCandidate::Failed)
        }
    }
}

/// Whether `dependant` reads any state variable `dependency` writes.
fn has_dependency(dependency: &TxRecord, dependant: &TxRecord) -> bool {
    let (Some(dep_summary), Some(sub_summary)) = (&dependency.summary, &dependant.summary) else {
        return false;
    };
    !dep_summary
        .overall_defs()
        .intersect_with(sub_summary.overall_uses())
        .is_empty()
}

/// Candidate attackers are the attack sender and its entry contract; the
/// candidate victim is the victim sender. Overlap disproves the pair.
fn infer_attackers_victims(
    ar: &TxRecord,
    vr: &TxRecord,
) -> Option<(Vec<Address>, Vec<Address>)> {
    let ar_summary = ar.summary.as_ref()?;
    let vr_summary = vr.summary.as_ref()?;
    let (attack_sender, attack_entry) = ar_summary.root_parties();
    let (victim_sender, _) = vr_summary.root_parties();
    let attackers = vec![attack_sender, attack_entry];
    let victims = vec![victim_sender];
    for a in &attackers {
        if victims.contains(a) {
            return None;
        }
    }
    Some((attackers, victims))
}
