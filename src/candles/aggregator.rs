//! Candle Aggregator
//!
//! Keeps the five candle series of every traded asset current. Driven by
//! settled trades ([`CandleAggregator::on_trade`]) and by a periodic
//! heartbeat that keeps USD values live while nobody trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::candle::{Candle, CandleKey, CandleMutation};
use super::change::{DAY_SECONDS, percent_change};
use super::resolution::{RESOLUTIONS, Resolution};
use crate::core_types::{Address, UnixSeconds};
use crate::error::MarketError;
use crate::feed::QuotePriceFeed;
use crate::models::{Market, MarketFilter, QuotePriceSnapshot, Trade};
use crate::store::LedgerStore;

/// Summary of one heartbeat pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub markets: usize,
    pub candles: usize,
    pub failures: usize,
    /// The feed failed and the stored snapshot was used
    pub stale_rate: bool,
}

pub struct CandleAggregator {
    store: Arc<dyn LedgerStore>,
    feed: Arc<dyn QuotePriceFeed>,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, feed: Arc<dyn QuotePriceFeed>) -> Self {
        Self { store, feed }
    }

    /// Fetch the feed's rate and store it as the snapshot.
    pub async fn refresh_quote_price(&self) -> Result<QuotePriceSnapshot, MarketError> {
        let rate = self.feed.fetch_rate().await?;
        if rate <= Decimal::ZERO {
            return Err(MarketError::external(
                "price_feed",
                format!("non-positive rate {}", rate),
            ));
        }
        let snapshot = QuotePriceSnapshot {
            rate_usd: rate,
            source: self.feed.source().to_string(),
            fetched_at: Utc::now(),
        };
        self.store.store_quote_price(&snapshot).await?;
        debug!(rate = %rate, source = %snapshot.source, "Quote price snapshot refreshed");
        Ok(snapshot)
    }

    /// Refresh from the feed, falling back to the stored snapshot.
    async fn rate_for_heartbeat(&self) -> Result<(Decimal, bool), MarketError> {
        match self.refresh_quote_price().await {
            Ok(snapshot) => Ok((snapshot.rate_usd, false)),
            Err(e) => match self.store.quote_price().await? {
                Some(stored) => {
                    warn!(
                        error = %e,
                        fetched_at = %stored.fetched_at,
                        "Price feed unavailable; using stored quote price"
                    );
                    Ok((stored.rate_usd, true))
                }
                None => Err(e),
            },
        }
    }

    /// Stored snapshot, refreshed from the feed only when none exists.
    async fn rate_for_trade(&self, trade: &Trade) -> Result<Decimal, MarketError> {
        if let Some(rate) = trade.quote_usd_rate {
            return Ok(rate);
        }
        if let Some(stored) = self.store.quote_price().await? {
            return Ok(stored.rate_usd);
        }
        Ok(self.refresh_quote_price().await?.rate_usd)
    }

    /// Fold a settled trade into every resolution and raise the ATH.
    pub async fn on_trade(&self, trade: &Trade) -> Result<Vec<Candle>, MarketError> {
        let asset = Address::from_str(&trade.asset)
            .map_err(|e| MarketError::InvalidInput(format!("bad asset {}: {}", trade.asset, e)))?;
        let rate = match self.rate_for_trade(trade).await {
            Ok(rate) => Some(rate),
            Err(e) => {
                warn!(
                    asset = %trade.asset,
                    signature = %trade.external_ref,
                    error = %e,
                    "No quote/USD rate; recording base candle only"
                );
                None
            }
        };
        let volume_quote = trade.volume_quote();
        let mutation = CandleMutation::Trade {
            price: trade.price,
            price_usd: rate.map(|r| trade.price * r),
            volume_quote,
            volume_usd: rate.map(|r| volume_quote * r),
        };

        let ts = trade.executed_at.timestamp();
        let mut candles = Vec::with_capacity(RESOLUTIONS.len());
        for resolution in RESOLUTIONS {
            let key = CandleKey::containing(asset, resolution, ts);
            candles.push(self.store.upsert_candle(&key, &mutation).await?);
        }

        self.raise_ath(&asset, &candles).await?;
        Ok(candles)
    }

    async fn raise_ath(&self, asset: &Address, candles: &[Candle]) -> Result<(), MarketError> {
        if let Some(high) = candles.iter().map(|c| c.high_usd).max() {
            if self.store.raise_ath(asset, high).await? {
                debug!(asset = %asset, ath_usd = %high, "New all-time high");
            }
        }
        Ok(())
    }

    /// Refresh USD values of every traded asset at `now`.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<HeartbeatReport, MarketError> {
        let (rate, stale_rate) = self.rate_for_heartbeat().await?;
        let markets = self.store.list_markets(MarketFilter::Traded).await?;

        let mut report = HeartbeatReport {
            stale_rate,
            ..Default::default()
        };
        for market in &markets {
            match self.heartbeat_market(market, rate, now).await {
                Ok(touched) => {
                    report.markets += 1;
                    report.candles += touched;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(asset = %market.asset, error = %e, "Heartbeat failed for asset");
                }
            }
        }

        debug!(
            markets = report.markets,
            candles = report.candles,
            failures = report.failures,
            "Heartbeat pass complete"
        );
        Ok(report)
    }

    async fn heartbeat_market(
        &self,
        market: &Market,
        rate: Decimal,
        now: DateTime<Utc>,
    ) -> Result<usize, MarketError> {
        let Some(price) = market.last_price else {
            return Ok(0);
        };
        let asset = market.asset;
        let ts = now.timestamp();

        let mut candles = Vec::with_capacity(RESOLUTIONS.len());
        // 1-minute first: coarser buckets read their extremes from it
        for resolution in RESOLUTIONS {
            let key = CandleKey::containing(asset, resolution, ts);
            let (usd_high, usd_low) = if resolution.is_finest() {
                (None, None)
            } else {
                self.fine_extremes(&key).await?
            };
            let mutation = CandleMutation::Heartbeat {
                price,
                rate,
                usd_high,
                usd_low,
            };
            candles.push(self.store.upsert_candle(&key, &mutation).await?);
        }

        self.raise_ath(&asset, &candles).await?;

        let reference = self.reference_price_24h(&asset, ts).await?;
        if reference != market.price_24h_ago_usd {
            self.store.set_price_24h_ago(&asset, reference).await?;
        }
        Ok(candles.len())
    }

    /// USD high/low across the 1-minute candles inside `key`'s bucket.
    async fn fine_extremes(
        &self,
        key: &CandleKey,
    ) -> Result<(Option<Decimal>, Option<Decimal>), MarketError> {
        let fine = self
            .store
            .candles_in_range(&key.asset, Resolution::M1, key.bucket_start, key.bucket_end())
            .await?;
        let high = fine.iter().map(|c| c.high_usd).max();
        let low = fine.iter().map(|c| c.low_usd).min();
        Ok((high, low))
    }

    /// USD close from about 24 hours before `now`, or the first recorded
    /// price when the asset is younger than a day.
    pub async fn reference_price_24h(
        &self,
        asset: &Address,
        now: UnixSeconds,
    ) -> Result<Option<Decimal>, MarketError> {
        if let Some(candle) = self
            .store
            .candle_at_or_before(asset, Resolution::M1, now - DAY_SECONDS)
            .await?
        {
            return Ok(Some(candle.close_usd));
        }
        Ok(self
            .store
            .earliest_candle(asset, Resolution::M1)
            .await?
            .map(|c| c.open_usd))
    }

    /// 24h change computed from candle history instead of the snapshot.
    pub async fn percent_change_from_history(
        &self,
        asset: &Address,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>, MarketError> {
        let ts = now.timestamp();
        let Some(current) = self
            .store
            .candle_at_or_before(asset, Resolution::M1, ts)
            .await?
        else {
            return Ok(None);
        };
        let reference = self.reference_price_24h(asset, ts).await?;
        Ok(reference.and_then(|r| percent_change(r, current.close_usd)))
    }

    /// Overwrite every market's ATH with the maximum USD high of its candle
    /// history. Returns the assets whose stored value had drifted.
    pub async fn recompute_all_time_highs(&self) -> Result<Vec<Address>, MarketError> {
        let markets = self.store.list_markets(MarketFilter::All).await?;
        let mut drifted = Vec::new();
        for market in markets {
            let max = self.store.max_high_usd(&market.asset).await?;
            if max != market.ath_usd {
                warn!(
                    asset = %market.asset,
                    stored = ?market.ath_usd,
                    recomputed = ?max,
                    "All-time high drifted; repairing"
                );
                self.store.set_ath(&market.asset, max).await?;
                drifted.push(market.asset);
            }
        }
        info!(repaired = drifted.len(), "All-time high recompute complete");
        Ok(drifted)
    }
}

/// Runs the heartbeat on a fixed cadence.
pub struct HeartbeatWorker {
    aggregator: Arc<CandleAggregator>,
    interval: Duration,
}

impl HeartbeatWorker {
    pub fn new(aggregator: Arc<CandleAggregator>, interval: Duration) -> Self {
        Self {
            aggregator,
            interval,
        }
    }

    /// Loop forever. Failed passes are logged; the next tick retries.
    pub async fn run(&self) -> ! {
        info!(interval_secs = self.interval.as_secs(), "Starting heartbeat worker");
        loop {
            if let Err(e) = self.aggregator.heartbeat(Utc::now()).await {
                error!(error = %e, "Heartbeat pass failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
