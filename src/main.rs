//! curve_market - worker binary
//!
//! ```text
//! --heartbeat       candle heartbeat loop
//! --reconcile       graduation reconciliation loop
//! --serve           both loops
//! --backfill-stats  rebuild participant stats from the ledger, then exit
//! --recompute-ath   rebuild all-time highs from candle history, then exit
//! --env <name>      config/<name>.yaml (default: dev)
//! ```

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use curve_market::candles::{CandleAggregator, HeartbeatWorker};
use curve_market::config::{AppConfig, SourceOfTruth};
use curve_market::db::Database;
use curve_market::feed::{HttpPriceFeed, QuotePriceFeed};
use curve_market::graduation::adapters::{Announcer, LogAnnouncer};
use curve_market::graduation::rpc::{
    HttpCustodyService, HttpPoolCreator, SolanaLedgerReader, WebhookAnnouncer,
};
use curve_market::graduation::{GraduationController, GraduationWatcher, WatcherConfig};
use curve_market::settlement::backfill_participant_stats;
use curve_market::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

// ============================================================
// WIRING
// ============================================================

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::open(url, config.postgres_max_connections)
                .await
                .context("Failed to open PostgreSQL ledger")?;
            info!("Using PostgreSQL ledger store");
            Ok(Arc::new(PgLedgerStore::new(db.pool().clone())))
        }
        None => {
            info!("No postgres_url configured; using in-process ledger store");
            Ok(Arc::new(MemoryLedgerStore::new()))
        }
    }
}

fn build_aggregator(
    config: &AppConfig,
    store: Arc<dyn LedgerStore>,
) -> anyhow::Result<Arc<CandleAggregator>> {
    let feed: Arc<dyn QuotePriceFeed> =
        Arc::new(HttpPriceFeed::new(config.endpoints.price_feed_url.as_str())?);
    Ok(Arc::new(CandleAggregator::new(store, feed)))
}

fn build_watcher(
    config: &AppConfig,
    store: Arc<dyn LedgerStore>,
) -> anyhow::Result<GraduationWatcher> {
    let endpoints = &config.endpoints;
    let announcer: Arc<dyn Announcer> = match &endpoints.announce_webhook_url {
        Some(url) => Arc::new(WebhookAnnouncer::new(url.as_str())?),
        None => Arc::new(LogAnnouncer),
    };
    let controller = Arc::new(GraduationController::new(
        store.clone(),
        Arc::new(HttpCustodyService::new(endpoints.custody_service_url.as_str())?),
        Arc::new(HttpPoolCreator::new(endpoints.pool_service_url.as_str())?),
        announcer,
        config.schedule.pool_creation_timeout(),
    ));

    let policy = config.graduation.source_of_truth;
    let watcher = GraduationWatcher::new(
        store,
        controller,
        policy,
        config.curve.graduation_threshold,
        WatcherConfig::from_schedule(&config.schedule),
    );
    if policy == SourceOfTruth::OnChain {
        let reader = SolanaLedgerReader::new(
            endpoints.rpc_url.as_str(),
            config.graduation.curve_program_address()?,
            config.graduation.account_discriminator,
        )?;
        return Ok(watcher.with_reader(Arc::new(reader)));
    }
    Ok(watcher)
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = curve_market::logging::init_logging(&config);

    info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        source_of_truth = ?config.graduation.source_of_truth,
        "Starting curve_market"
    );

    let store = build_store(&config).await?;

    if has_flag("--backfill-stats") {
        let participants = backfill_participant_stats(store.as_ref()).await?;
        println!("Rebuilt stats for {} participants", participants);
        return Ok(());
    }

    if has_flag("--recompute-ath") {
        let drifted = build_aggregator(&config, store)?
            .recompute_all_time_highs()
            .await?;
        println!("Repaired all-time high for {} assets", drifted.len());
        for asset in drifted {
            println!("  {}", asset);
        }
        return Ok(());
    }

    let heartbeat = has_flag("--heartbeat") || has_flag("--serve");
    let reconcile = has_flag("--reconcile") || has_flag("--serve");
    if !heartbeat && !reconcile {
        anyhow::bail!(
            "no mode given: use --heartbeat, --reconcile, --serve, --backfill-stats or --recompute-ath"
        );
    }

    let heartbeat_worker = if heartbeat {
        Some(HeartbeatWorker::new(
            build_aggregator(&config, store.clone())?,
            config.schedule.heartbeat_interval(),
        ))
    } else {
        None
    };
    let watcher = if reconcile {
        Some(build_watcher(&config, store)?)
    } else {
        None
    };

    match (heartbeat_worker, watcher) {
        (Some(worker), Some(watcher)) => {
            tokio::spawn(async move {
                worker.run().await;
            });
            watcher.run().await
        }
        (Some(worker), None) => worker.run().await,
        (None, Some(watcher)) => watcher.run().await,
        (None, None) => Ok(()),
    }
}
