//! Ledger data models
//!
//! `Market` is mutable (reserves, lifecycle, price references). `Trade` and
//! `FeeDistribution` rows are immutable once written.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CurveConfig;
use crate::core_types::{Address, AssetUnits, Lamports, SettlementRef};
use crate::curve::{Fill, Reserves};
use crate::fee::FeeRole;
use crate::graduation::state::{Lifecycle, MigrationState};
use crate::money::{lamports_to_quote, units_to_tokens};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum Direction {
    Buy = 1,
    Sell = 2,
}

impl Direction {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Direction::Buy),
            2 => Some(Direction::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One bonding-curve market per asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub asset: Address,
    pub creator: Address,
    pub reserves: Reserves,
    pub total_supply: AssetUnits,
    pub lifecycle: Lifecycle,
    /// Spot price after the most recent trade (quote per token)
    pub last_price: Option<Decimal>,
    pub ath_usd: Option<Decimal>,
    /// USD close from roughly 24 hours before the last heartbeat
    pub price_24h_ago_usd: Option<Decimal>,
    pub pool_id: Option<String>,
    pub graduated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Market {
    /// Seed a fresh market from the curve configuration.
    pub fn launch(new: &NewMarket, curve: &CurveConfig) -> Self {
        Self {
            asset: new.asset,
            creator: new.creator,
            reserves: Reserves {
                virtual_quote: curve.initial_virtual_quote,
                virtual_asset: curve.initial_virtual_asset,
                real_quote: 0,
                real_asset: curve.initial_real_asset,
            },
            total_supply: curve.total_supply,
            lifecycle: Lifecycle::Active,
            last_price: None,
            ath_usd: None,
            price_24h_ago_usd: None,
            pool_id: None,
            graduated_at: None,
            created_at: new.created_at,
        }
    }

    #[inline]
    pub fn spot_price(&self) -> Decimal {
        self.reserves.spot_price()
    }

    /// Units held outside the curve: `total_supply − real_asset`.
    #[inline]
    pub fn circulating_supply(&self) -> AssetUnits {
        self.total_supply.saturating_sub(self.reserves.real_asset)
    }

    /// Fully diluted value in whole quote units.
    pub fn market_cap(&self) -> Decimal {
        self.spot_price() * units_to_tokens(self.total_supply)
    }

    /// Share of the graduation threshold reached, in percent (capped at 100).
    pub fn graduation_progress(&self, threshold: Lamports) -> Decimal {
        if threshold == 0 {
            return Decimal::ONE_HUNDRED;
        }
        let pct = lamports_to_quote(self.reserves.real_quote) / lamports_to_quote(threshold)
            * Decimal::ONE_HUNDRED;
        pct.min(Decimal::ONE_HUNDRED)
    }
}

/// Launch parameters for a new market.
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub asset: Address,
    pub creator: Address,
    pub created_at: DateTime<Utc>,
}

impl NewMarket {
    pub fn new(asset: Address, creator: Address) -> Self {
        Self {
            asset,
            creator,
            created_at: Utc::now(),
        }
    }
}

/// Filter for listing markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketFilter {
    All,
    /// ACTIVE and GRADUATED markets
    NotMigrated,
    /// Markets with at least one recorded trade
    Traded,
}

/// A settlement request.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub asset: Address,
    pub direction: Direction,
    /// Lamports in for a buy, asset units in for a sell
    pub amount: u64,
    pub trader: Address,
    pub external_ref: SettlementRef,
    pub referrer: Option<Address>,
    /// Minimum asset units out (buy) or net lamports out (sell)
    pub min_output: Option<u64>,
    /// Accept a sell capped at the real quote reserve
    pub allow_partial_fill: bool,
    /// The quote movement is already final on an external ledger
    pub confirmed_externally: bool,
    pub executed_at: DateTime<Utc>,
}

impl TradeRequest {
    pub fn new(
        asset: Address,
        direction: Direction,
        amount: u64,
        trader: Address,
        external_ref: impl Into<SettlementRef>,
    ) -> Self {
        Self {
            asset,
            direction,
            amount,
            trader,
            external_ref: external_ref.into(),
            referrer: None,
            min_output: None,
            allow_partial_fill: false,
            confirmed_externally: false,
            executed_at: Utc::now(),
        }
    }

    pub fn with_referrer(mut self, referrer: Address) -> Self {
        self.referrer = Some(referrer);
        self
    }

    pub fn with_min_output(mut self, min_output: u64) -> Self {
        self.min_output = Some(min_output);
        self
    }

    pub fn allowing_partial_fill(mut self) -> Self {
        self.allow_partial_fill = true;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed_externally = true;
        self
    }

    pub fn at(mut self, executed_at: DateTime<Utc>) -> Self {
        self.executed_at = executed_at;
        self
    }
}

/// Append-only trade ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: i64,
    pub asset: String,
    pub trader: String,
    pub direction: Direction,
    /// Lamports paid (buy) or received net of fee (sell)
    pub quote_amount: Lamports,
    pub asset_amount: AssetUnits,
    pub fee_total: Lamports,
    /// Spot price after the trade, quote per token
    pub price: Decimal,
    /// Quote/USD exchange rate at execution
    pub quote_usd_rate: Option<Decimal>,
    pub external_ref: SettlementRef,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    pub fn price_usd(&self) -> Option<Decimal> {
        self.quote_usd_rate.map(|rate| self.price * rate)
    }

    pub fn volume_quote(&self) -> Decimal {
        lamports_to_quote(self.quote_amount)
    }
}

/// One fee share paid out of a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDistribution {
    pub trade_id: i64,
    pub asset: String,
    pub role: FeeRole,
    pub recipient: String,
    pub amount: Lamports,
}

/// Result of one committed settlement.
#[derive(Debug, Clone)]
pub struct SettledTrade {
    pub trade: Trade,
    pub fees: Vec<FeeDistribution>,
    pub reserves: Reserves,
    pub lifecycle: Lifecycle,
    /// This settlement pushed the market over the graduation threshold
    pub graduated_now: bool,
    pub fill: Fill,
    pub price_impact: Decimal,
}

/// Lifetime aggregates per participant. Eventually consistent; rebuilt from
/// the ledger by the backfill job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStats {
    pub participant: String,
    pub volume_quote: u64,
    pub trade_count: u64,
    pub fees_earned: u64,
    pub assets_created: u64,
}

/// Increment applied to one participant's aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub volume_quote: u64,
    pub trade_count: u64,
    pub fees_earned: u64,
    pub assets_created: u64,
}

/// Latest quote-currency/USD rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotePriceSnapshot {
    pub rate_usd: Decimal,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// Migration progress for one graduated asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub asset: String,
    pub state: MigrationState,
    pub quote_released: Lamports,
    pub asset_released: AssetUnits,
    pub pool_id: Option<String>,
    pub last_error: Option<String>,
    pub attempts: i32,
    pub updated_at: DateTime<Utc>,
}

/// Fields written alongside a migration state transition. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationUpdate {
    pub quote_released: Option<Lamports>,
    pub asset_released: Option<AssetUnits>,
    pub pool_id: Option<String>,
    pub last_error: Option<String>,
}
