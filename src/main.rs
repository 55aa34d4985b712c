mod api;
mod cache;
mod config;
mod error;
mod fetch;
mod fetcher;
mod miner_scope;
mod refresher;
mod schedule;
mod state;
mod stats;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::relay::{router, RelayState};
use crate::cache::{spawn_cleanup, LocalCache, Partition};
use crate::config::{Config, NOTICE_CHANNEL_CAPACITY, STATUS_REPORT_INTERVAL_SECS};
use crate::error::Result;
use crate::fetch::{FetchClient, FetchNotice, HttpTransport, ReqwestTransport};
use crate::fetcher::PoolApi;
use crate::refresher::Refresher;
use crate::schedule::ScheduledTask;
use crate::state::{restore_target, DataOrchestrator};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Local cache ---
    let cache = LocalCache::open(&cfg.db_path).await;
    if cache.is_available() {
        let mut counts = Vec::with_capacity(Partition::ALL.len());
        for partition in Partition::ALL {
            counts.push(format!("{partition}={}", cache.entry_count(partition).await));
        }
        let bytes = cache.size_estimate().await;
        info!(bytes, "Cache entries: {}", counts.join(" "));
    }

    // --- Fetch client ---
    let latency = Arc::new(LatencyStats::new());
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
    let client = FetchClient::new(Arc::clone(&transport))
        .with_timeout(cfg.fetch_timeout)
        .with_notices(notice_tx)
        .with_latency(Arc::clone(&latency));
    let api = PoolApi::new(Arc::new(client), cfg.price_api_url.clone());

    tokio::spawn(async move { notice_consumer(notice_rx).await });

    // --- Orchestrator ---
    let target = restore_target(&cache, cfg.api_url.clone(), cfg.miner_address.clone()).await;
    let orchestrator = DataOrchestrator::new(api, cache.clone(), target.clone());
    orchestrator.set_target(target.clone()).await;
    match &target.address {
        Some(addr) => info!("Tracking miner {addr} on {}", target.api_url),
        None => warn!(
            "MINER_ADDRESS not set, tracking pool-wide data only on {}",
            target.api_url,
        ),
    }

    // --- Background tasks ---
    let health = Arc::new(HealthState::new());
    let refresher = Refresher::start(Arc::clone(&orchestrator), Arc::clone(&health));
    let cleanup = spawn_cleanup(cache.clone());

    let report_orchestrator = Arc::clone(&orchestrator);
    let reporter = ScheduledTask::spawn(
        "status-report",
        Duration::from_secs(STATUS_REPORT_INTERVAL_SECS),
        Duration::from_secs(STATUS_REPORT_INTERVAL_SECS),
        move || {
            let orchestrator = Arc::clone(&report_orchestrator);
            async move { report_status(&orchestrator) }
        },
    );

    // --- HTTP relay ---
    let relay_state = RelayState {
        transport,
        pool_api_url: target.api_url.clone(),
        price_api_url: cfg.price_api_url.clone(),
        timeout: cfg.fetch_timeout,
        health,
        latency,
        orchestrator: Some(Arc::clone(&orchestrator)),
    };
    let app = router(relay_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.relay_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP relay listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    refresher.shutdown().await;
    cleanup.shutdown().await;
    reporter.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Consumes fetch notices and logs them as user-facing status lines.
async fn notice_consumer(mut rx: mpsc::Receiver<FetchNotice>) {
    while let Some(notice) = rx.recv().await {
        match notice {
            FetchNotice::Retrying { endpoint, attempt, max_attempts, delay, cause } => {
                info!(
                    "[NOTICE] {endpoint}: attempt {attempt}/{max_attempts} failed ({cause}), retrying in {:.1}s",
                    delay.as_secs_f64(),
                );
            }
            FetchNotice::Recovered { endpoint, attempts } => {
                info!("[NOTICE] {endpoint}: connection restored after {attempts} attempts");
            }
            FetchNotice::Failed { endpoint, attempts, cause } => {
                warn!("[NOTICE] {endpoint}: giving up after {attempts} attempts: {cause}");
            }
        }
    }
}

fn report_status(orchestrator: &DataOrchestrator) {
    let status = orchestrator.status();
    let Some(pool) = orchestrator.pool_info() else {
        info!(loading = status.is_loading, "[STATUS] no pool data yet");
        return;
    };

    let sidechain = &pool.sidechain;
    info!(
        height = sidechain.height,
        miners = sidechain.window.miners,
        effort = sidechain.effort.current,
        "[STATUS] pool {} | network {} | {} window miners | effort {:.1}%{}",
        stats::format_hashrate(stats::pool_hashrate(&pool)),
        stats::format_hashrate(stats::network_hashrate(&pool)),
        sidechain.window.miners,
        sidechain.effort.current,
        orchestrator
            .price()
            .map(|p| format!(" | XMR ${:.2}", p.usd))
            .unwrap_or_default(),
    );

    if let Some(address) = orchestrator.target().address {
        let window = orchestrator.miner_window_shares();
        match stats::window_share(window.as_deref(), &address, &pool) {
            Some(share) => {
                let hashrate = stats::estimated_miner_hashrate(share, &pool);
                info!(
                    "[MINER] window share {:.4}% | ~{} | {:.6} XMR per block{}",
                    share * 100.0,
                    stats::format_hashrate(hashrate),
                    stats::expected_reward_xmr(share, &pool),
                    stats::expected_share_interval_secs(hashrate, &pool)
                        .map(|secs| format!(" | a share every ~{:.0} min", secs / 60.0))
                        .unwrap_or_default(),
                );
            }
            None => info!("[MINER] window data unavailable"),
        }
        if let Some(miner) = orchestrator.miner_info() {
            info!(
                "[MINER] lifetime {} shares, {} uncles",
                miner.total_shares(),
                miner.total_uncles(),
            );
        }
        if let Some(payouts) = orchestrator.miner_payouts() {
            let summary = stats::payout_summary(&payouts, orchestrator.price());
            info!(
                "[MINER] {} payouts totalling {:.6} XMR{}",
                summary.count,
                summary.total_xmr,
                summary.total_usd.map(|usd| format!(" (${usd:.2})")).unwrap_or_default(),
            );
        }
    }

    if let Some(err) = status.error {
        warn!("[STATUS] last refresh error: {err}");
    }
}
