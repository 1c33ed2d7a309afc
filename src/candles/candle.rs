//! Candle rows and the pure update rule shared by every store.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::resolution::Resolution;
use crate::core_types::{Address, UnixSeconds};

/// Unique key of a candle row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub asset: Address,
    pub resolution: Resolution,
    pub bucket_start: UnixSeconds,
}

impl CandleKey {
    /// Key of the bucket that contains `ts`.
    pub fn containing(asset: Address, resolution: Resolution, ts: UnixSeconds) -> Self {
        Self {
            asset,
            resolution,
            bucket_start: resolution.bucket_start(ts),
        }
    }

    pub fn bucket_end(&self) -> UnixSeconds {
        self.resolution.bucket_end(self.bucket_start)
    }
}

/// OHLCV in quote units and USD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub asset: String,
    pub resolution: Resolution,
    pub bucket_start: UnixSeconds,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub open_usd: Decimal,
    pub high_usd: Decimal,
    pub low_usd: Decimal,
    pub close_usd: Decimal,
    pub volume_quote: Decimal,
    pub volume_usd: Decimal,
    pub trade_count: u64,
}

impl Candle {
    /// `high ≥ max(open, close)` and `low ≤ min(open, close)` in both units.
    pub fn is_consistent(&self) -> bool {
        self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high_usd >= self.open_usd.max(self.close_usd)
            && self.low_usd <= self.open_usd.min(self.close_usd)
    }
}

/// What touched a candle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandleMutation {
    /// A settled trade at `price` (post-trade spot). The USD values are
    /// `None` when no quote/USD rate was available; the base OHLCV is still
    /// recorded and USD fields are carried until the next heartbeat.
    Trade {
        price: Decimal,
        price_usd: Option<Decimal>,
        volume_quote: Decimal,
        volume_usd: Option<Decimal>,
    },
    /// Periodic USD refresh at `rate`. The USD close is always derived from
    /// the quote close of the row being updated, so a trade that lands first
    /// is never overwritten. `price` is the last traded quote price, only
    /// used to seed a bucket with no previous candle. `usd_high`/`usd_low`
    /// are the 1-minute extremes inside the bucket, for coarse resolutions.
    Heartbeat {
        price: Decimal,
        rate: Decimal,
        usd_high: Option<Decimal>,
        usd_low: Option<Decimal>,
    },
}

/// Apply `mutation` to the candle at `key`.
///
/// `existing` is the current row for the key, `previous` the most recent
/// candle before it at the same resolution. A fresh candle opens at the
/// previous close. High and low are always widened to cover open and close.
pub fn apply_mutation(
    key: &CandleKey,
    existing: Option<&Candle>,
    previous: Option<&Candle>,
    mutation: &CandleMutation,
) -> Candle {
    match (existing, mutation) {
        (
            None,
            CandleMutation::Trade {
                price,
                price_usd,
                volume_quote,
                volume_usd,
            },
        ) => {
            let open = previous.map(|c| c.close).unwrap_or(*price);
            let carried_usd = previous.map(|c| c.close_usd).unwrap_or(Decimal::ZERO);
            let close_usd = price_usd.unwrap_or(carried_usd);
            let open_usd = previous.map(|c| c.close_usd).unwrap_or(close_usd);
            Candle {
                asset: key.asset.to_string(),
                resolution: key.resolution,
                bucket_start: key.bucket_start,
                open,
                high: open.max(*price),
                low: open.min(*price),
                close: *price,
                open_usd,
                high_usd: open_usd.max(close_usd),
                low_usd: open_usd.min(close_usd),
                close_usd,
                volume_quote: *volume_quote,
                volume_usd: volume_usd.unwrap_or(Decimal::ZERO),
                trade_count: 1,
            }
        }
        (
            Some(current),
            CandleMutation::Trade {
                price,
                price_usd,
                volume_quote,
                volume_usd,
            },
        ) => {
            let close_usd = price_usd.unwrap_or(current.close_usd);
            Candle {
                high: current.high.max(*price),
                low: current.low.min(*price),
                close: *price,
                high_usd: current.high_usd.max(close_usd),
                low_usd: current.low_usd.min(close_usd),
                close_usd,
                volume_quote: current.volume_quote + volume_quote,
                volume_usd: current.volume_usd + volume_usd.unwrap_or(Decimal::ZERO),
                trade_count: current.trade_count + 1,
                ..current.clone()
            }
        }
        (
            None,
            CandleMutation::Heartbeat {
                price,
                rate,
                usd_high,
                usd_low,
            },
        ) => {
            let carried = previous.map(|c| c.close).unwrap_or(*price);
            let close_usd = carried * rate;
            let open_usd = previous.map(|c| c.close_usd).unwrap_or(close_usd);
            let (high_usd, low_usd) = widen(open_usd, open_usd, close_usd, *usd_high, *usd_low);
            Candle {
                asset: key.asset.to_string(),
                resolution: key.resolution,
                bucket_start: key.bucket_start,
                open: carried,
                high: carried,
                low: carried,
                close: carried,
                open_usd,
                high_usd,
                low_usd,
                close_usd,
                volume_quote: Decimal::ZERO,
                volume_usd: Decimal::ZERO,
                trade_count: 0,
            }
        }
        (
            Some(current),
            CandleMutation::Heartbeat {
                rate,
                usd_high,
                usd_low,
                ..
            },
        ) => {
            let close_usd = current.close * rate;
            let (high_usd, low_usd) = widen(
                current.high_usd,
                current.low_usd,
                close_usd,
                *usd_high,
                *usd_low,
            );
            Candle {
                high_usd,
                low_usd,
                close_usd,
                ..current.clone()
            }
        }
    }
}

fn widen(
    high: Decimal,
    low: Decimal,
    price: Decimal,
    extra_high: Option<Decimal>,
    extra_low: Option<Decimal>,
) -> (Decimal, Decimal) {
    let high = high.max(price).max(extra_high.unwrap_or(price));
    let low = low.min(price).min(extra_low.unwrap_or(price));
    (high, low)
}
