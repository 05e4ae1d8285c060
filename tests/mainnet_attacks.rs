//! End-to-end attack reconstruction against mainnet pre-state. These
//! replay real blocks over RPC and are slow; run explicitly with
//!
//!   SANDSCAN_ETH_RPC_URL=<archive node> cargo test --test mainnet_attacks -- --ignored

use std::sync::Arc;

use revm::primitives::b256;

use sandscan::hunt::{construct_attack, AttackPattern, SearchContext, TxHistory};
use sandscan::{CachedReader, RpcReader};

fn reader() -> Option<Arc<CachedReader<RpcReader>>> {
    let url = std::env::var("SANDSCAN_ETH_RPC_URL").ok()?;
    let rpc = RpcReader::new(&url).ok()?;
    CachedReader::new(rpc).ok().map(Arc::new)
}

#[test]
#[ignore = "requires SANDSCAN_ETH_RPC_URL pointing at an archive node"]
fn detects_uniswap_v2_swap_slippage_attack() {
    let Some(reader) = reader() else {
        eprintln!("SANDSCAN_ETH_RPC_URL not set; skipping");
        return;
    };
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async move {
        let history = Arc::new(TxHistory::new(reader.clone(), None));
        let attack_tx =
            b256!("5b4360a6ebdadc234d2b23dbdbc472d9002fca863e757c44e4dbda740c498588");
        let victim_tx =
            b256!("048394c15d45f429c92bd6bda07649f0faa16f2e59845d4a985f0998f568974c");
        let attack = construct_attack(
            reader,
            history,
            attack_tx,
            victim_tx,
            None,
            &SearchContext::new(),
        )
        .await
        .expect("search")
        .expect("attack detected");

        assert_eq!(
            attack.attacker.to_string().to_lowercase(),
            "0xe4013b5bba21556cc1f30a581cb0b5d0e98a56b0"
        );
        assert_eq!(
            attack.victim.to_string().to_lowercase(),
            "0xec44b704a51c27c63478700a5f90d5da53f93097"
        );
        assert_eq!(attack.analyses.len(), 1);
    });
}

#[test]
#[ignore = "requires SANDSCAN_ETH_RPC_URL pointing at an archive node"]
fn detects_out_of_gas_griefing_attack() {
    let Some(reader) = reader() else {
        eprintln!("SANDSCAN_ETH_RPC_URL not set; skipping");
        return;
    };
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async move {
        let history = Arc::new(TxHistory::new(reader.clone(), None));
        let attack_tx =
            b256!("344f1a6eb9ca880748928f6810779f9816db9369a9127bd01bad0ea05b9d9def");
        let victim_tx =
            b256!("2eb6a786109536f526990e3dba0033a2261675ea061c69ac2fd0bc39734d0ea0");
        let attack = construct_attack(
            reader,
            history,
            attack_tx,
            victim_tx,
            None,
            &SearchContext::new(),
        )
        .await
        .expect("search")
        .expect("attack detected");

        assert!(!attack.analyses.is_empty());
        assert!(attack
            .analyses
            .iter()
            .any(|a| a.pattern == AttackPattern::GasEstimationGriefing));
    });
}
