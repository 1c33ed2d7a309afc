//! End-to-end market scenarios against the public API and the in-process
//! ledger store.

use chrono::DateTime;
use rust_decimal::Decimal;
use std::sync::Arc;

use curve_market::candles::{CandleKey, RESOLUTIONS};
use curve_market::{
    Address, CandleAggregator, CurveConfig, Direction, Fill, FixedPriceFeed, Lamports, Lifecycle,
    LedgerStore, MemoryLedgerStore, NewMarket, Reserves, SettlementContext, SettlementEngine,
    SourceOfTruth, TradeRequest, quote_buy, quote_sell,
};

const ONE_SOL: Lamports = 1_000_000_000;
const GRADUATING_BUY: Lamports = 85_860_000_000;
/// 2024-01-01T00:00:30Z
const T0: i64 = 1_704_067_230;

fn asset() -> Address {
    Address::new_from_array([1; 32])
}

fn trader(n: u8) -> Address {
    Address::new_from_array([20 + n; 32])
}

fn launch_reserves() -> Reserves {
    Reserves {
        virtual_quote: 30 * ONE_SOL,
        virtual_asset: 1_073_000_000_000_000,
        real_quote: 0,
        real_asset: 793_100_000_000_000,
    }
}

struct Market {
    store: Arc<MemoryLedgerStore>,
    aggregator: Arc<CandleAggregator>,
    engine: SettlementEngine,
}

async fn launch() -> Market {
    let store = Arc::new(MemoryLedgerStore::new());
    let aggregator = Arc::new(CandleAggregator::new(
        store.clone(),
        Arc::new(FixedPriceFeed::new(Decimal::from(150))),
    ));
    let ctx = SettlementContext::from_curve(CurveConfig::default()).unwrap();
    let engine = SettlementEngine::new(store.clone(), ctx, SourceOfTruth::Custodial)
        .with_candles(aggregator.clone());
    engine
        .create_market(&NewMarket::new(asset(), Address::new_from_array([2; 32])))
        .await
        .unwrap();
    Market {
        store,
        aggregator,
        engine,
    }
}

fn request(direction: Direction, amount: u64, signature: &str, ts: i64) -> TradeRequest {
    TradeRequest::new(asset(), direction, amount, trader(0), signature)
        .at(DateTime::from_timestamp(ts, 0).unwrap())
}

// ============================================================================
// Pricing
// ============================================================================

#[test]
fn qa_buy_one_sol_at_launch() {
    let quote = quote_buy(ONE_SOL, &launch_reserves(), 10_000).unwrap();
    assert_eq!(quote.fee, 10_000_000);
    assert_eq!(quote.quote_after_fee, 990_000_000);
    assert_eq!(quote.asset_out, 34_277_831_558_567);
}

#[test]
fn qa_round_trip_never_returns_more_than_paid() {
    for quote_in in [1_000_000, ONE_SOL, 7 * ONE_SOL + 13, 40 * ONE_SOL] {
        let before = launch_reserves();
        let buy = quote_buy(quote_in, &before, 10_000).unwrap();
        let after_buy = Reserves {
            virtual_quote: buy.new_virtual_quote,
            virtual_asset: buy.new_virtual_asset,
            real_quote: before.real_quote + buy.quote_after_fee,
            real_asset: before.real_asset - buy.asset_out,
        };
        assert!(after_buy.invariant() >= before.invariant());

        let sell = quote_sell(buy.asset_out, &after_buy, 10_000).unwrap();
        assert!(sell.quote_out <= quote_in, "quote_in {}", quote_in);
        let after_sell_k = sell.new_virtual_quote as u128 * sell.new_virtual_asset as u128;
        assert!(after_sell_k >= after_buy.invariant());
    }
}

#[test]
fn qa_sell_capped_at_real_quote() {
    let reserves = Reserves {
        real_quote: ONE_SOL,
        ..launch_reserves()
    };
    let quote = quote_sell(400_000_000_000_000, &reserves, 10_000).unwrap();
    assert_eq!(quote.quote_out_gross, ONE_SOL);
    assert!(quote.fill.is_partial());
    let Fill::Partial { requested, filled } = quote.fill else {
        unreachable!();
    };
    assert_eq!(requested, 400_000_000_000_000);
    assert!(filled < requested);
}

// ============================================================================
// Settlement
// ============================================================================

#[tokio::test]
async fn qa_duplicate_reference_settles_once() {
    let m = launch().await;
    let buy = request(Direction::Buy, ONE_SOL, "sig-1", T0);
    assert!(m.engine.settle(&buy).await.is_ok());

    let err = m.engine.settle(&buy).await.unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_SETTLEMENT");
    assert_eq!(m.store.all_trades().await.unwrap().len(), 1);

    let trade = m.store.trade_by_ref("sig-1").await.unwrap().unwrap();
    let fees = m.store.fees_for_trade(trade.trade_id).await.unwrap();
    assert_eq!(fees.iter().map(|f| f.amount).sum::<u64>(), trade.fee_total);
    assert_eq!(m.store.all_fee_distributions().await.unwrap().len(), fees.len());
}

#[tokio::test]
async fn qa_buy_then_sell_through_settlement() {
    let m = launch().await;
    let launched = m.store.get_market(&asset()).await.unwrap().unwrap();
    assert_eq!(launched.circulating_supply(), 206_900_000_000_000);
    let bought = m
        .engine
        .settle(&request(Direction::Buy, ONE_SOL, "sig-buy", T0))
        .await
        .unwrap();
    let units = bought.settled().unwrap().trade.asset_amount;
    assert_eq!(units, 34_277_831_558_567);

    let sold = m
        .engine
        .settle(&request(Direction::Sell, units, "sig-sell", T0 + 5))
        .await
        .unwrap();
    let sold = sold.settled().unwrap();
    assert!(sold.trade.quote_amount < ONE_SOL);
    assert_eq!(sold.fill, Fill::Full);

    let market = m.store.get_market(&asset()).await.unwrap().unwrap();
    assert_eq!(market.circulating_supply(), launched.circulating_supply());
    assert!(market.reserves.invariant() >= launch_reserves().invariant());
}

#[tokio::test]
async fn qa_graduation_is_one_way() {
    let m = launch().await;
    let outcome = m
        .engine
        .settle(&request(Direction::Buy, GRADUATING_BUY, "sig-grad", T0))
        .await
        .unwrap();
    let settled = outcome.settled().unwrap();
    assert!(settled.graduated_now);
    assert_eq!(settled.lifecycle, Lifecycle::Graduated);

    for (direction, amount, signature) in [
        (Direction::Buy, ONE_SOL, "sig-late-buy"),
        (Direction::Sell, 1_000_000, "sig-late-sell"),
    ] {
        let err = m
            .engine
            .settle(&request(direction, amount, signature, T0 + 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_GRADUATED");
    }

    assert!(
        !m.store
            .advance_lifecycle(&asset(), Lifecycle::Graduated, Lifecycle::Active, None)
            .await
            .unwrap()
    );
    let market = m.store.get_market(&asset()).await.unwrap().unwrap();
    assert_eq!(market.lifecycle, Lifecycle::Graduated);
}

// ============================================================================
// Candles
// ============================================================================

#[tokio::test]
async fn qa_candles_stay_consistent_across_trading() {
    let m = launch().await;
    let mut ts = T0;
    for i in 0..12u64 {
        let direction = if i % 3 == 2 { Direction::Sell } else { Direction::Buy };
        let amount = match direction {
            Direction::Buy => ONE_SOL / 4 * (i + 1),
            Direction::Sell => 1_000_000_000_000,
        };
        m.engine
            .settle(&request(direction, amount, &format!("sig-{}", i), ts))
            .await
            .unwrap();
        ts += 97;
    }
    m.aggregator
        .heartbeat(DateTime::from_timestamp(ts + 3_600, 0).unwrap())
        .await
        .unwrap();

    for r in RESOLUTIONS {
        let candles = m.store.candles_in_range(&asset(), r, 0, i64::MAX).await.unwrap();
        assert!(!candles.is_empty(), "{}", r);
        for candle in &candles {
            assert!(candle.is_consistent(), "{} {:?}", r, candle);
            assert!(candle.high >= candle.open.max(candle.close));
            assert!(candle.low <= candle.open.min(candle.close));
        }
    }
}

#[tokio::test]
async fn qa_idle_market_heartbeat_carries_close_forward() {
    let m = launch().await;
    let outcome = m
        .engine
        .settle(&request(Direction::Buy, ONE_SOL, "sig-1", T0))
        .await
        .unwrap();
    let price = outcome.settled().unwrap().trade.price;

    let tomorrow = T0 + 24 * 60 * 60;
    m.aggregator
        .heartbeat(DateTime::from_timestamp(tomorrow, 0).unwrap())
        .await
        .unwrap();

    for r in RESOLUTIONS {
        let key = CandleKey::containing(asset(), r, tomorrow);
        let candle = m.store.get_candle(&key).await.unwrap().unwrap();
        assert_eq!(candle.trade_count, 0, "{}", r);
        assert_eq!(candle.volume_quote, Decimal::ZERO);
        assert_eq!(candle.open, price);
        assert_eq!(candle.close, price);
        assert_eq!(candle.close_usd, price * Decimal::from(150));
    }
}
