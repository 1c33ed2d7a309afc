//! Settlement flows through [`SettlementEngine`] against the in-memory
//! store, including failure injection and the stats backfill.

use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::engine::{SettlementEngine, SettlementOutcome};
use super::plan::SettlementContext;
use super::stats::backfill_participant_stats;
use crate::candles::{CandleAggregator, CandleKey, Resolution};
use crate::config::{CurveConfig, SourceOfTruth};
use crate::core_types::{Address, Lamports};
use crate::feed::FixedPriceFeed;
use crate::graduation::GraduationController;
use crate::graduation::adapters::mock::{MockAnnouncer, MockCustody, MockPoolCreator};
use crate::graduation::state::Lifecycle;
use crate::models::{Direction, NewMarket, QuotePriceSnapshot, TradeRequest};
use crate::store::LedgerStore;
use crate::store::mock::FlakyStore;

const ONE_SOL: Lamports = 1_000_000_000;
const GRADUATING_BUY: Lamports = 85_860_000_000;

fn asset() -> Address {
    Address::new_from_array([1; 32])
}

fn creator() -> Address {
    Address::new_from_array([2; 32])
}

fn trader(n: u8) -> Address {
    Address::new_from_array([10 + n; 32])
}

fn buy(amount: Lamports, signature: &str) -> TradeRequest {
    TradeRequest::new(asset(), Direction::Buy, amount, trader(0), signature)
}

struct Harness {
    store: Arc<FlakyStore>,
    engine: SettlementEngine,
}

impl Harness {
    async fn new() -> Self {
        Self::with_policy(SourceOfTruth::Custodial).await
    }

    async fn with_policy(source_of_truth: SourceOfTruth) -> Self {
        let store = Arc::new(FlakyStore::new());
        let ctx = SettlementContext::from_curve(CurveConfig::default()).unwrap();
        let engine = SettlementEngine::new(store.clone(), ctx, source_of_truth);
        engine
            .create_market(&NewMarket::new(asset(), creator()))
            .await
            .unwrap();
        Self { store, engine }
    }

    async fn settle(&self, request: &TradeRequest) -> SettlementOutcome {
        self.engine.settle(request).await.unwrap()
    }
}

async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// ============================================================================
// Idempotency and atomicity
// ============================================================================

#[tokio::test]
async fn test_duplicate_signature_applies_once() {
    let h = Harness::new().await;
    let request = buy(ONE_SOL, "sig-dup");
    let first = h.settle(&request).await;
    let before = h.store.get_market(&asset()).await.unwrap().unwrap();

    let err = h.engine.settle(&request).await.unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_SETTLEMENT");

    let after = h.store.get_market(&asset()).await.unwrap().unwrap();
    assert_eq!(before.reserves, after.reserves);
    assert_eq!(h.store.all_trades().await.unwrap().len(), 1);
    let trade_id = first.settled().unwrap().trade.trade_id;
    assert_eq!(
        h.store.all_fee_distributions().await.unwrap(),
        h.store.fees_for_trade(trade_id).await.unwrap()
    );
}

#[tokio::test]
async fn test_concurrent_duplicates_commit_once() {
    let h = Harness::new().await;
    let request = buy(ONE_SOL, "sig-race");
    let results = join_all((0..10).map(|_| h.engine.settle(&request))).await;

    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(committed, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.code(), "DUPLICATE_SETTLEMENT");
    }
    assert_eq!(h.store.all_trades().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_trades_serialize_per_asset() {
    let h = Harness::new().await;
    let requests: Vec<TradeRequest> = (0..20)
        .map(|i| buy(ONE_SOL / 2, &format!("sig-{}", i)))
        .collect();
    let results = join_all(requests.iter().map(|r| h.engine.settle(r))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let trades = h.store.all_trades().await.unwrap();
    assert_eq!(trades.len(), 20);
    let mut ids: Vec<i64> = trades.iter().map(|t| t.trade_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);

    // Every trade priced against the reserves the previous one left
    let market = h.store.get_market(&asset()).await.unwrap().unwrap();
    let fees: Lamports = trades.iter().map(|t| t.fee_total).sum();
    assert_eq!(market.reserves.real_quote, 20 * (ONE_SOL / 2) - fees);
    let sold: u64 = trades.iter().map(|t| t.asset_amount).sum();
    assert_eq!(market.circulating_supply(), sold + (market.total_supply - 793_100_000_000_000));
}

#[tokio::test]
async fn test_rejected_trade_leaves_signature_free() {
    let h = Harness::new().await;
    let err = h
        .engine
        .settle(&buy(ONE_SOL, "sig-slip").with_min_output(u64::MAX))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SLIPPAGE_EXCEEDED");
    assert!(h.store.all_trades().await.unwrap().is_empty());

    let outcome = h.settle(&buy(ONE_SOL, "sig-slip")).await;
    assert!(outcome.settled().is_some());
}

#[tokio::test]
async fn test_empty_partial_sell_is_rejected_without_a_trade() {
    let h = Harness::new().await;
    let request = TradeRequest::new(asset(), Direction::Sell, 1_000_000, trader(0), "sig-empty")
        .allowing_partial_fill();
    let err = h.engine.settle(&request).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_LIQUIDITY");
    assert!(h.store.all_trades().await.unwrap().is_empty());
    assert!(h.store.trade_by_ref("sig-empty").await.unwrap().is_none());
    assert!(
        h.store
            .candles_in_range(&asset(), Resolution::M1, 0, i64::MAX)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_invalid_requests_never_reach_store() {
    let h = Harness::new().await;
    assert_eq!(
        h.engine.settle(&buy(0, "sig-zero")).await.unwrap_err().code(),
        "INVALID_INPUT"
    );
    assert_eq!(
        h.engine.settle(&buy(ONE_SOL, "")).await.unwrap_err().code(),
        "INVALID_INPUT"
    );
    assert_eq!(h.store.settle_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_asset() {
    let h = Harness::new().await;
    let request = TradeRequest::new(
        Address::new_from_array([99; 32]),
        Direction::Buy,
        ONE_SOL,
        trader(0),
        "sig-x",
    );
    assert_eq!(
        h.engine.settle(&request).await.unwrap_err().code(),
        "NOT_FOUND"
    );
}

// ============================================================================
// Partial commit
// ============================================================================

#[tokio::test]
async fn test_externally_confirmed_trade_reports_partial_commit() {
    let h = Harness::new().await;
    h.store.fail_settle.store(true, Ordering::SeqCst);

    let outcome = h.settle(&buy(ONE_SOL, "sig-final").confirmed()).await;
    let SettlementOutcome::PartialCommit { external_ref, cause } = outcome else {
        panic!("expected partial commit");
    };
    assert_eq!(external_ref, "sig-final");
    assert_eq!(cause.code(), "STORE_FAILURE");
    assert_eq!(h.store.settle_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unconfirmed_store_failure_is_an_error() {
    let h = Harness::new().await;
    h.store.fail_settle.store(true, Ordering::SeqCst);

    let err = h.engine.settle(&buy(ONE_SOL, "sig-x")).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_on_chain_policy_treats_every_trade_as_final() {
    let h = Harness::with_policy(SourceOfTruth::OnChain).await;
    h.store.fail_settle.store(true, Ordering::SeqCst);

    let outcome = h.settle(&buy(ONE_SOL, "sig-x")).await;
    assert!(outcome.is_partial());
}

#[tokio::test]
async fn test_rejection_is_never_partial() {
    let h = Harness::with_policy(SourceOfTruth::OnChain).await;
    h.settle(&buy(ONE_SOL, "sig-a").confirmed()).await;
    let err = h
        .engine
        .settle(&buy(ONE_SOL, "sig-a").confirmed())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_SETTLEMENT");
}

// ============================================================================
// Downstream effects
// ============================================================================

#[tokio::test]
async fn test_stats_follow_commits() {
    let h = Harness::new().await;
    let outcome = h.settle(&buy(ONE_SOL, "sig-1").with_referrer(trader(5))).await;
    let settled = outcome.settled().unwrap();
    settle_tasks().await;

    let stats = h
        .store
        .participant_stats(&trader(0).to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.volume_quote, ONE_SOL);
    assert_eq!(stats.trade_count, 1);

    let referrer = h
        .store
        .participant_stats(&trader(5).to_string())
        .await
        .unwrap()
        .unwrap();
    let referrer_fee: Lamports = settled
        .fees
        .iter()
        .filter(|f| f.recipient == trader(5).to_string())
        .map(|f| f.amount)
        .sum();
    assert!(referrer_fee > 0);
    assert_eq!(referrer.fees_earned, referrer_fee);
}

#[tokio::test]
async fn test_stats_failure_healed_by_backfill() {
    let h = Harness::new().await;
    h.store.fail_stats.store(true, Ordering::SeqCst);
    let first = h.settle(&buy(ONE_SOL, "sig-1")).await;
    let second = h.settle(&buy(2 * ONE_SOL, "sig-2")).await;
    assert!(first.settled().is_some() && second.settled().is_some());
    settle_tasks().await;
    assert!(
        h.store
            .participant_stats(&trader(0).to_string())
            .await
            .unwrap()
            .is_none()
    );

    h.store.fail_stats.store(false, Ordering::SeqCst);
    backfill_participant_stats(h.store.as_ref()).await.unwrap();

    let stats = h
        .store
        .participant_stats(&trader(0).to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.volume_quote, 3 * ONE_SOL);
    assert_eq!(stats.trade_count, 2);
    let creator_stats = h
        .store
        .participant_stats(&creator().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(creator_stats.assets_created, 1);
    assert!(creator_stats.fees_earned > 0);
}

#[tokio::test]
async fn test_trade_stamped_with_stored_rate_and_candled() {
    let store = Arc::new(FlakyStore::new());
    let ctx = SettlementContext::from_curve(CurveConfig::default()).unwrap();
    let candles = Arc::new(CandleAggregator::new(
        store.clone(),
        Arc::new(FixedPriceFeed::new(Decimal::from(150))),
    ));
    let engine = SettlementEngine::new(store.clone(), ctx, SourceOfTruth::Custodial)
        .with_candles(candles);
    engine
        .create_market(&NewMarket::new(asset(), creator()))
        .await
        .unwrap();
    store
        .store_quote_price(&QuotePriceSnapshot {
            rate_usd: Decimal::from(140),
            source: "test".to_string(),
            fetched_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let outcome = engine.settle(&buy(ONE_SOL, "sig-1")).await.unwrap();
    let trade = &outcome.settled().unwrap().trade;
    assert_eq!(trade.quote_usd_rate, Some(Decimal::from(140)));

    let key = CandleKey::containing(asset(), Resolution::M1, trade.executed_at.timestamp());
    let candle = store.get_candle(&key).await.unwrap().unwrap();
    assert_eq!(candle.close_usd, trade.price * Decimal::from(140));
    let market = store.get_market(&asset()).await.unwrap().unwrap();
    assert_eq!(market.ath_usd, Some(candle.high_usd));
}

#[tokio::test]
async fn test_graduating_trade_ends_curve_and_starts_migration() {
    let store = Arc::new(FlakyStore::new());
    let ctx = SettlementContext::from_curve(CurveConfig::default()).unwrap();
    let custody = Arc::new(MockCustody::new());
    let pools = Arc::new(MockPoolCreator::new());
    let controller = Arc::new(GraduationController::new(
        store.clone(),
        custody.clone(),
        pools.clone(),
        Arc::new(MockAnnouncer::new()),
        Duration::from_secs(5),
    ));
    let engine = SettlementEngine::new(store.clone(), ctx, SourceOfTruth::Custodial)
        .with_graduation(controller);
    engine
        .create_market(&NewMarket::new(asset(), creator()))
        .await
        .unwrap();

    let outcome = engine.settle(&buy(GRADUATING_BUY, "sig-big")).await.unwrap();
    let settled = outcome.settled().unwrap();
    assert!(settled.graduated_now);
    assert_eq!(settled.lifecycle, Lifecycle::Graduated);

    let err = engine.settle(&buy(ONE_SOL, "sig-late")).await.unwrap_err();
    assert_eq!(err.code(), "ALREADY_GRADUATED");

    settle_tasks().await;
    let market = store.get_market(&asset()).await.unwrap().unwrap();
    assert_eq!(market.lifecycle, Lifecycle::Migrated);
    assert_eq!(custody.release_count(), 1);
    assert_eq!(pools.create_count(), 1);
}
