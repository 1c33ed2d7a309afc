//! In-process Ledger Store
//!
//! Each market sits behind its own `tokio::sync::Mutex`, so settlements for
//! one asset serialize while other assets proceed in parallel. Candle series
//! are locked per (asset, resolution).

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::LedgerStore;
use crate::candles::candle::{Candle, CandleKey, CandleMutation, apply_mutation};
use crate::candles::resolution::{RESOLUTIONS, Resolution};
use crate::config::CurveConfig;
use crate::core_types::{Address, UnixSeconds};
use crate::error::MarketError;
use crate::graduation::state::{Lifecycle, MigrationState};
use crate::models::{
    FeeDistribution, Market, MarketFilter, MigrationRecord, MigrationUpdate, NewMarket,
    ParticipantStats, QuotePriceSnapshot, SettledTrade, StatsDelta, Trade, TradeRequest,
};
use crate::settlement::plan::{SettlementContext, plan_trade};

type CandleSeries = Arc<Mutex<BTreeMap<UnixSeconds, Candle>>>;

#[derive(Default)]
pub struct MemoryLedgerStore {
    markets: DashMap<Address, Arc<Mutex<Market>>>,
    trades: DashMap<i64, Trade>,
    refs: DashMap<String, i64>,
    fees: DashMap<i64, Vec<FeeDistribution>>,
    next_trade_id: AtomicI64,
    stats: DashMap<String, ParticipantStats>,
    quote_price: RwLock<Option<QuotePriceSnapshot>>,
    candles: DashMap<(Address, Resolution), CandleSeries>,
    migrations: DashMap<Address, MigrationRecord>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn market_handle(&self, asset: &Address) -> Option<Arc<Mutex<Market>>> {
        self.markets.get(asset).map(|m| m.value().clone())
    }

    fn series(&self, asset: &Address, resolution: Resolution) -> CandleSeries {
        self.candles
            .entry((*asset, resolution))
            .or_default()
            .value()
            .clone()
    }

    fn existing_series(&self, asset: &Address, resolution: Resolution) -> Option<CandleSeries> {
        self.candles
            .get(&(*asset, resolution))
            .map(|s| s.value().clone())
    }

    fn add_stats(&self, participant: &str, delta: &StatsDelta) {
        let mut entry = self
            .stats
            .entry(participant.to_string())
            .or_insert_with(|| ParticipantStats {
                participant: participant.to_string(),
                ..Default::default()
            });
        entry.volume_quote += delta.volume_quote;
        entry.trade_count += delta.trade_count;
        entry.fees_earned += delta.fees_earned;
        entry.assets_created += delta.assets_created;
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_market(
        &self,
        new: &NewMarket,
        curve: &CurveConfig,
    ) -> Result<Market, MarketError> {
        let market = Market::launch(new, curve);
        match self.markets.entry(new.asset) {
            Entry::Occupied(_) => {
                return Err(MarketError::InvalidInput(format!(
                    "market for {} already exists",
                    new.asset
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(market.clone())));
            }
        }
        self.add_stats(
            &new.creator.to_string(),
            &StatsDelta {
                assets_created: 1,
                ..Default::default()
            },
        );
        Ok(market)
    }

    async fn get_market(&self, asset: &Address) -> Result<Option<Market>, MarketError> {
        match self.market_handle(asset) {
            Some(handle) => Ok(Some(handle.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list_markets(&self, filter: MarketFilter) -> Result<Vec<Market>, MarketError> {
        let handles: Vec<_> = self.markets.iter().map(|m| m.value().clone()).collect();
        let mut markets = Vec::with_capacity(handles.len());
        for handle in handles {
            let market = handle.lock().await.clone();
            let keep = match filter {
                MarketFilter::All => true,
                MarketFilter::NotMigrated => market.lifecycle != Lifecycle::Migrated,
                MarketFilter::Traded => market.last_price.is_some(),
            };
            if keep {
                markets.push(market);
            }
        }
        markets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.asset.cmp(&b.asset)));
        Ok(markets)
    }

    async fn advance_lifecycle(
        &self,
        asset: &Address,
        from: Lifecycle,
        to: Lifecycle,
        pool_id: Option<&str>,
    ) -> Result<bool, MarketError> {
        let handle = self
            .market_handle(asset)
            .ok_or(MarketError::NotFound(*asset))?;
        let mut market = handle.lock().await;
        if market.lifecycle != from || !from.can_advance_to(to) {
            return Ok(false);
        }
        market.lifecycle = to;
        if market.graduated_at.is_none() {
            market.graduated_at = Some(Utc::now());
        }
        if to == Lifecycle::Migrated {
            market.pool_id = pool_id.map(str::to_string);
        }
        Ok(true)
    }

    async fn raise_ath(&self, asset: &Address, price_usd: Decimal) -> Result<bool, MarketError> {
        let handle = self
            .market_handle(asset)
            .ok_or(MarketError::NotFound(*asset))?;
        let mut market = handle.lock().await;
        match market.ath_usd {
            Some(ath) if ath >= price_usd => Ok(false),
            _ => {
                market.ath_usd = Some(price_usd);
                Ok(true)
            }
        }
    }

    async fn set_ath(&self, asset: &Address, ath_usd: Option<Decimal>) -> Result<(), MarketError> {
        let handle = self
            .market_handle(asset)
            .ok_or(MarketError::NotFound(*asset))?;
        handle.lock().await.ath_usd = ath_usd;
        Ok(())
    }

    async fn set_price_24h_ago(
        &self,
        asset: &Address,
        price_usd: Option<Decimal>,
    ) -> Result<(), MarketError> {
        let handle = self
            .market_handle(asset)
            .ok_or(MarketError::NotFound(*asset))?;
        handle.lock().await.price_24h_ago_usd = price_usd;
        Ok(())
    }

    async fn settle_trade(
        &self,
        request: &TradeRequest,
        ctx: &SettlementContext,
        quote_usd_rate: Option<Decimal>,
    ) -> Result<SettledTrade, MarketError> {
        let handle = self
            .market_handle(&request.asset)
            .ok_or(MarketError::NotFound(request.asset))?;
        let mut market = handle.lock().await;

        if self.refs.contains_key(&request.external_ref) {
            return Err(MarketError::DuplicateSettlement(
                request.external_ref.clone(),
            ));
        }

        let plan = plan_trade(&market, request, ctx)?;

        // Same ref on another asset may race us; the map entry decides.
        let trade_id = match self.refs.entry(request.external_ref.clone()) {
            Entry::Occupied(_) => {
                return Err(MarketError::DuplicateSettlement(
                    request.external_ref.clone(),
                ));
            }
            Entry::Vacant(slot) => {
                let id = self.next_trade_id.fetch_add(1, Ordering::SeqCst) + 1;
                slot.insert(id);
                id
            }
        };

        let settled = plan.into_settled(trade_id, request, quote_usd_rate);
        market.reserves = settled.reserves;
        market.last_price = Some(settled.trade.price);
        if settled.graduated_now {
            market.lifecycle = Lifecycle::Graduated;
            market.graduated_at = Some(request.executed_at);
        }
        self.trades.insert(trade_id, settled.trade.clone());
        self.fees.insert(trade_id, settled.fees.clone());

        debug!(
            asset = %request.asset,
            trade_id = trade_id,
            signature = %request.external_ref,
            "Trade committed"
        );
        Ok(settled)
    }

    async fn trade_by_ref(&self, external_ref: &str) -> Result<Option<Trade>, MarketError> {
        Ok(self
            .refs
            .get(external_ref)
            .and_then(|id| self.trades.get(id.value()).map(|t| t.value().clone())))
    }

    async fn trades_for_asset(
        &self,
        asset: &Address,
        limit: usize,
    ) -> Result<Vec<Trade>, MarketError> {
        let asset = asset.to_string();
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| t.asset == asset)
            .map(|t| t.value().clone())
            .collect();
        trades.sort_by(|a, b| b.trade_id.cmp(&a.trade_id));
        trades.truncate(limit);
        Ok(trades)
    }

    async fn all_trades(&self) -> Result<Vec<Trade>, MarketError> {
        let mut trades: Vec<Trade> = self.trades.iter().map(|t| t.value().clone()).collect();
        trades.sort_by_key(|t| t.trade_id);
        Ok(trades)
    }

    async fn fees_for_trade(&self, trade_id: i64) -> Result<Vec<FeeDistribution>, MarketError> {
        Ok(self
            .fees
            .get(&trade_id)
            .map(|f| f.value().clone())
            .unwrap_or_default())
    }

    async fn all_fee_distributions(&self) -> Result<Vec<FeeDistribution>, MarketError> {
        let mut ids: Vec<i64> = self.fees.iter().map(|f| *f.key()).collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.fees.get(&id).map(|f| f.value().clone()))
            .flatten()
            .collect())
    }

    async fn apply_stats_delta(
        &self,
        participant: &str,
        delta: &StatsDelta,
    ) -> Result<(), MarketError> {
        self.add_stats(participant, delta);
        Ok(())
    }

    async fn participant_stats(
        &self,
        participant: &str,
    ) -> Result<Option<ParticipantStats>, MarketError> {
        Ok(self.stats.get(participant).map(|s| s.value().clone()))
    }

    async fn replace_participant_stats(
        &self,
        stats: &[ParticipantStats],
    ) -> Result<(), MarketError> {
        self.stats.clear();
        for s in stats {
            self.stats.insert(s.participant.clone(), s.clone());
        }
        Ok(())
    }

    async fn quote_price(&self) -> Result<Option<QuotePriceSnapshot>, MarketError> {
        Ok(self.quote_price.read().await.clone())
    }

    async fn store_quote_price(&self, snapshot: &QuotePriceSnapshot) -> Result<(), MarketError> {
        *self.quote_price.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn upsert_candle(
        &self,
        key: &CandleKey,
        mutation: &CandleMutation,
    ) -> Result<Candle, MarketError> {
        let series = self.series(&key.asset, key.resolution);
        let mut series = series.lock().await;
        let previous = series
            .range(..key.bucket_start)
            .next_back()
            .map(|(_, c)| c.clone());
        let candle = apply_mutation(key, series.get(&key.bucket_start), previous.as_ref(), mutation);
        series.insert(key.bucket_start, candle.clone());
        Ok(candle)
    }

    async fn get_candle(&self, key: &CandleKey) -> Result<Option<Candle>, MarketError> {
        match self.existing_series(&key.asset, key.resolution) {
            Some(series) => Ok(series.lock().await.get(&key.bucket_start).cloned()),
            None => Ok(None),
        }
    }

    async fn candles_in_range(
        &self,
        asset: &Address,
        resolution: Resolution,
        from: UnixSeconds,
        to: UnixSeconds,
    ) -> Result<Vec<Candle>, MarketError> {
        if from >= to {
            return Ok(Vec::new());
        }
        match self.existing_series(asset, resolution) {
            Some(series) => Ok(series
                .lock()
                .await
                .range(from..to)
                .map(|(_, c)| c.clone())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn candle_at_or_before(
        &self,
        asset: &Address,
        resolution: Resolution,
        ts: UnixSeconds,
    ) -> Result<Option<Candle>, MarketError> {
        match self.existing_series(asset, resolution) {
            Some(series) => Ok(series
                .lock()
                .await
                .range(..=ts)
                .next_back()
                .map(|(_, c)| c.clone())),
            None => Ok(None),
        }
    }

    async fn earliest_candle(
        &self,
        asset: &Address,
        resolution: Resolution,
    ) -> Result<Option<Candle>, MarketError> {
        match self.existing_series(asset, resolution) {
            Some(series) => Ok(series.lock().await.values().next().cloned()),
            None => Ok(None),
        }
    }

    async fn max_high_usd(&self, asset: &Address) -> Result<Option<Decimal>, MarketError> {
        let mut max: Option<Decimal> = None;
        for resolution in RESOLUTIONS {
            if let Some(series) = self.existing_series(asset, resolution) {
                let series = series.lock().await;
                for candle in series.values() {
                    max = Some(max.map_or(candle.high_usd, |m| m.max(candle.high_usd)));
                }
            }
        }
        Ok(max)
    }

    async fn claim_migration(
        &self,
        asset: &Address,
    ) -> Result<Option<MigrationRecord>, MarketError> {
        match self.migrations.entry(*asset) {
            Entry::Vacant(slot) => {
                let record = MigrationRecord {
                    asset: asset.to_string(),
                    state: MigrationState::Claimed,
                    quote_released: 0,
                    asset_released: 0,
                    pool_id: None,
                    last_error: None,
                    attempts: 1,
                    updated_at: Utc::now(),
                };
                slot.insert(record.clone());
                Ok(Some(record))
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.state != MigrationState::ReleaseFailed {
                    return Ok(None);
                }
                record.state = MigrationState::Claimed;
                record.attempts += 1;
                record.updated_at = Utc::now();
                Ok(Some(record.clone()))
            }
        }
    }

    async fn get_migration(&self, asset: &Address) -> Result<Option<MigrationRecord>, MarketError> {
        Ok(self.migrations.get(asset).map(|r| r.value().clone()))
    }

    async fn update_migration(
        &self,
        asset: &Address,
        from: MigrationState,
        to: MigrationState,
        update: &MigrationUpdate,
    ) -> Result<bool, MarketError> {
        let Some(mut record) = self.migrations.get_mut(asset) else {
            return Ok(false);
        };
        if record.state != from {
            return Ok(false);
        }
        record.state = to;
        if let Some(quote) = update.quote_released {
            record.quote_released = quote;
        }
        if let Some(units) = update.asset_released {
            record.asset_released = units;
        }
        if let Some(pool_id) = &update.pool_id {
            record.pool_id = Some(pool_id.clone());
        }
        if update.last_error.is_some() {
            record.last_error = update.last_error.clone();
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn migrations_in_state(
        &self,
        state: MigrationState,
    ) -> Result<Vec<MigrationRecord>, MarketError> {
        Ok(self
            .migrations
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    fn addr(b: u8) -> Address {
        Address::new_from_array([b; 32])
    }

    fn ctx() -> SettlementContext {
        SettlementContext::from_curve(CurveConfig::default()).unwrap()
    }

    async fn store_with_market() -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        store
            .create_market(&NewMarket::new(addr(1), addr(2)), &CurveConfig::default())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_market_once() {
        let store = store_with_market().await;
        let err = store
            .create_market(&NewMarket::new(addr(1), addr(2)), &CurveConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let stats = store.participant_stats(&addr(2).to_string()).await.unwrap().unwrap();
        assert_eq!(stats.assets_created, 1);
    }

    #[tokio::test]
    async fn test_settle_unknown_market() {
        let store = MemoryLedgerStore::new();
        let request = TradeRequest::new(addr(9), Direction::Buy, 1_000, addr(3), "sig");
        let err = store.settle_trade(&request, &ctx(), None).await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_ref_rejected() {
        let store = store_with_market().await;
        let request = TradeRequest::new(addr(1), Direction::Buy, 1_000_000_000, addr(3), "sig-1");
        store.settle_trade(&request, &ctx(), None).await.unwrap();
        let before = store.get_market(&addr(1)).await.unwrap().unwrap();

        let err = store.settle_trade(&request, &ctx(), None).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_SETTLEMENT");

        let after = store.get_market(&addr(1)).await.unwrap().unwrap();
        assert_eq!(before.reserves, after.reserves);
        assert_eq!(store.all_trades().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_plan_leaves_ref_free() {
        let store = store_with_market().await;
        let request = TradeRequest::new(addr(1), Direction::Buy, 1_000_000_000, addr(3), "sig-2")
            .with_min_output(u64::MAX);
        assert!(store.settle_trade(&request, &ctx(), None).await.is_err());
        assert!(store.trade_by_ref("sig-2").await.unwrap().is_none());

        let retry = TradeRequest::new(addr(1), Direction::Buy, 1_000_000_000, addr(3), "sig-2");
        assert!(store.settle_trade(&retry, &ctx(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle_cas() {
        let store = store_with_market().await;
        assert!(
            !store
                .advance_lifecycle(&addr(1), Lifecycle::Graduated, Lifecycle::Migrated, None)
                .await
                .unwrap()
        );
        assert!(
            store
                .advance_lifecycle(&addr(1), Lifecycle::Active, Lifecycle::Graduated, None)
                .await
                .unwrap()
        );
        assert!(
            !store
                .advance_lifecycle(&addr(1), Lifecycle::Graduated, Lifecycle::Active, None)
                .await
                .unwrap()
        );
        assert!(
            store
                .advance_lifecycle(&addr(1), Lifecycle::Graduated, Lifecycle::Migrated, Some("pool"))
                .await
                .unwrap()
        );
        let market = store.get_market(&addr(1)).await.unwrap().unwrap();
        assert_eq!(market.lifecycle, Lifecycle::Migrated);
        assert_eq!(market.pool_id.as_deref(), Some("pool"));
    }

    #[tokio::test]
    async fn test_raise_ath_is_conditional() {
        let store = store_with_market().await;
        assert!(store.raise_ath(&addr(1), Decimal::from(5)).await.unwrap());
        assert!(!store.raise_ath(&addr(1), Decimal::from(4)).await.unwrap());
        assert!(!store.raise_ath(&addr(1), Decimal::from(5)).await.unwrap());
        assert!(store.raise_ath(&addr(1), Decimal::from(6)).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_migration_once() {
        let store = store_with_market().await;
        assert!(store.claim_migration(&addr(1)).await.unwrap().is_some());
        assert!(store.claim_migration(&addr(1)).await.unwrap().is_none());

        assert!(
            store
                .update_migration(
                    &addr(1),
                    MigrationState::Claimed,
                    MigrationState::ReleaseFailed,
                    &MigrationUpdate {
                        last_error: Some("custody down".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        );
        let reclaimed = store.claim_migration(&addr(1)).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.last_error.as_deref(), Some("custody down"));
    }

    #[tokio::test]
    async fn test_candle_range_queries() {
        let store = store_with_market().await;
        let mutation = CandleMutation::Trade {
            price: Decimal::ONE,
            price_usd: Some(Decimal::from(100)),
            volume_quote: Decimal::ONE,
            volume_usd: Some(Decimal::from(100)),
        };
        for ts in [0, 60, 120, 600] {
            let key = CandleKey::containing(addr(1), Resolution::M1, ts);
            store.upsert_candle(&key, &mutation).await.unwrap();
        }
        let range = store
            .candles_in_range(&addr(1), Resolution::M1, 60, 600)
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
        let at = store
            .candle_at_or_before(&addr(1), Resolution::M1, 599)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at.bucket_start, 120);
        let first = store.earliest_candle(&addr(1), Resolution::M1).await.unwrap().unwrap();
        assert_eq!(first.bucket_start, 0);
    }
}
