//! Block-range scanner: slides a search window over history and writes
//! detected attacks as JSON lines.
//!
//! Configuration is env-var based:
//!   SANDSCAN_ETH_RPC_URL     RPC endpoint (required)
//!   SANDSCAN_FROM            first block (required)
//!   SANDSCAN_TO              last block, inclusive (required)
//!   SANDSCAN_WINDOW          window size in blocks (default 4)
//!   SANDSCAN_STEP            window slide in blocks (default 1)
//!   SANDSCAN_CONCURRENCY     parallel attack anchors (default 4)
//!   SANDSCAN_PREFETCH        blocks to keep warm ahead (default 0 = off)
//!   SANDSCAN_WINDOW_TIMEOUT  per-window deadline in seconds (default 600)
//!   SANDSCAN_OUT             output path (default attacks.jsonl)

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use sandscan::hunt::docs::AttackDocument;
use sandscan::hunt::{AttackSearcher, SearchContext, TxHistory};
use sandscan::{CachedReader, RpcReader};

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

fn load_window() -> usize {
    env_u64("SANDSCAN_WINDOW").unwrap_or(4).clamp(1, 64) as usize
}

fn load_step() -> u64 {
    env_u64("SANDSCAN_STEP").unwrap_or(1).clamp(1, 64)
}

fn load_concurrency() -> usize {
    env_u64("SANDSCAN_CONCURRENCY").unwrap_or(4).clamp(1, 128) as usize
}

fn load_prefetch() -> usize {
    env_u64("SANDSCAN_PREFETCH").unwrap_or(0).min(256) as usize
}

fn load_window_timeout() -> Duration {
    Duration::from_secs(env_u64("SANDSCAN_WINDOW_TIMEOUT").unwrap_or(600).clamp(10, 86_400))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rpc_url = match std::env::var("SANDSCAN_ETH_RPC_URL") {
        Ok(url) => url,
        Err(_) => bail!("SANDSCAN_ETH_RPC_URL is not set"),
    };
    let Some(from) = env_u64("SANDSCAN_FROM") else { bail!("SANDSCAN_FROM is not set") };
    let Some(to) = env_u64("SANDSCAN_TO") else { bail!("SANDSCAN_TO is not set") };
    if to < from {
        bail!("SANDSCAN_TO must be >= SANDSCAN_FROM");
    }
    let window = load_window();
    let step = load_step();
    let concurrency = load_concurrency();
    let prefetch = load_prefetch();
    let out_path = std::env::var("SANDSCAN_OUT").unwrap_or_else(|_| "attacks.jsonl".into());

    let reader = RpcReader::new(&rpc_url).context("failed to build RPC reader")?;
    let reader = Arc::new(CachedReader::new(reader).context("chain unreachable")?);
    let history = Arc::new(TxHistory::new(reader.clone(), None));

    let mut searcher = AttackSearcher::new(reader, Arc::clone(&history));
    searcher.set_concurrency(concurrency);

    let out = Arc::new(Mutex::new(
        std::fs::File::create(&out_path).with_context(|| format!("cannot create {out_path}"))?,
    ));
    let sink = Arc::clone(&out);
    searcher.set_attack_handler(Arc::new(move |_session, attack| {
        let doc = AttackDocument::from_attack(attack);
        match serde_json::to_string(&doc) {
            Ok(line) => {
                let mut file = sink.lock().expect("sink lock");
                if let Err(err) = writeln!(file, "{line}") {
                    warn!(error = %err, "failed to write attack document");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode attack document"),
        }
    }));
    let searcher = Arc::new(searcher);

    let scan_ctx = SearchContext::new();
    if prefetch > 0 {
        let prefetcher = Arc::clone(&searcher);
        let prefetch_ctx = scan_ctx.clone();
        tokio::spawn(async move {
            prefetcher.prefetch_blocks(prefetch_ctx, prefetch).await;
        });
    }

    let mut found_total = 0usize;
    let mut pivot_block = from;
    let mut pivot_index = 0u64;
    let mut start = from;
    while start <= to {
        let window_ctx = SearchContext::with_deadline(Instant::now() + load_window_timeout());
        let mut search_window = searcher.open_search_window(start, window);
        search_window.set_search_pivot(pivot_block, pivot_index);
        let attacks = search_window.search(&window_ctx).await;
        found_total += attacks.len();
        info!(from = start, window, found = attacks.len(), total = found_total, "window done");
        search_window.close();

        // Everything up to the end of this window has been searched; the
        // next slide only checks pairs involving new transactions.
        pivot_block = start + window as u64;
        pivot_index = 0;
        start += step;
    }

    scan_ctx.cancel();
    info!(total = found_total, out = %out_path, "scan finished");
    Ok(())
}
