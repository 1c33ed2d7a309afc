//! Ledger Store
//!
//! Owns every mutation of market state. Two implementations share this
//! contract:
//!
//! - [`postgres::PgLedgerStore`]: row locks and compare-and-swap updates in
//!   PostgreSQL
//! - [`memory::MemoryLedgerStore`]: per-asset async mutexes, for single-node
//!   runs and tests
//!
//! Writes that the heartbeat and the reconciliation watcher perform are all
//! "create if absent, else conditionally update", so both are safe to run
//! concurrently or repeatedly.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::candles::candle::{Candle, CandleKey, CandleMutation};
use crate::candles::resolution::Resolution;
use crate::config::CurveConfig;
use crate::core_types::{Address, UnixSeconds};
use crate::error::MarketError;
use crate::graduation::state::{Lifecycle, MigrationState};
use crate::models::{
    FeeDistribution, Market, MarketFilter, MigrationRecord, MigrationUpdate, NewMarket,
    ParticipantStats, QuotePriceSnapshot, SettledTrade, StatsDelta, Trade, TradeRequest,
};
use crate::settlement::plan::SettlementContext;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // === Markets ===

    /// Launch a market seeded from `curve`. Fails with `InvalidInput` if the
    /// asset already has one.
    async fn create_market(
        &self,
        new: &NewMarket,
        curve: &CurveConfig,
    ) -> Result<Market, MarketError>;

    async fn get_market(&self, asset: &Address) -> Result<Option<Market>, MarketError>;

    async fn list_markets(&self, filter: MarketFilter) -> Result<Vec<Market>, MarketError>;

    /// Compare-and-swap the lifecycle from `from` to `to`. Returns `false`
    /// when the stored state was not `from`. Moving to `Migrated` records
    /// `pool_id`; moving to `Graduated` stamps `graduated_at`.
    async fn advance_lifecycle(
        &self,
        asset: &Address,
        from: Lifecycle,
        to: Lifecycle,
        pool_id: Option<&str>,
    ) -> Result<bool, MarketError>;

    /// Raise the all-time high if `price_usd` exceeds it. Returns whether it
    /// changed.
    async fn raise_ath(&self, asset: &Address, price_usd: Decimal) -> Result<bool, MarketError>;

    /// Overwrite the all-time high (batch repair).
    async fn set_ath(&self, asset: &Address, ath_usd: Option<Decimal>) -> Result<(), MarketError>;

    async fn set_price_24h_ago(
        &self,
        asset: &Address,
        price_usd: Option<Decimal>,
    ) -> Result<(), MarketError>;

    // === Settlement ===

    /// Settle one trade as a single atomic unit scoped to the asset.
    ///
    /// Under the asset's lock: reject a known `external_ref` as
    /// `DuplicateSettlement`, load the market, plan the trade, then write
    /// reserves, lifecycle, the trade row and its fee rows together.
    async fn settle_trade(
        &self,
        request: &TradeRequest,
        ctx: &SettlementContext,
        quote_usd_rate: Option<Decimal>,
    ) -> Result<SettledTrade, MarketError>;

    async fn trade_by_ref(&self, external_ref: &str) -> Result<Option<Trade>, MarketError>;

    /// Most recent trades first.
    async fn trades_for_asset(
        &self,
        asset: &Address,
        limit: usize,
    ) -> Result<Vec<Trade>, MarketError>;

    /// Every trade in ledger order.
    async fn all_trades(&self) -> Result<Vec<Trade>, MarketError>;

    async fn fees_for_trade(&self, trade_id: i64) -> Result<Vec<FeeDistribution>, MarketError>;

    async fn all_fee_distributions(&self) -> Result<Vec<FeeDistribution>, MarketError>;

    // === Participant statistics ===

    async fn apply_stats_delta(
        &self,
        participant: &str,
        delta: &StatsDelta,
    ) -> Result<(), MarketError>;

    async fn participant_stats(
        &self,
        participant: &str,
    ) -> Result<Option<ParticipantStats>, MarketError>;

    /// Replace every stored aggregate with `stats`.
    async fn replace_participant_stats(
        &self,
        stats: &[ParticipantStats],
    ) -> Result<(), MarketError>;

    // === Quote price ===

    async fn quote_price(&self) -> Result<Option<QuotePriceSnapshot>, MarketError>;

    async fn store_quote_price(&self, snapshot: &QuotePriceSnapshot) -> Result<(), MarketError>;

    // === Candles ===

    /// Create or update the candle at `key`, serialized per key. The new
    /// row is computed by [`crate::candles::candle::apply_mutation`] from
    /// the current row and the latest candle before it.
    async fn upsert_candle(
        &self,
        key: &CandleKey,
        mutation: &CandleMutation,
    ) -> Result<Candle, MarketError>;

    async fn get_candle(&self, key: &CandleKey) -> Result<Option<Candle>, MarketError>;

    /// Candles with `from <= bucket_start < to`, oldest first.
    async fn candles_in_range(
        &self,
        asset: &Address,
        resolution: Resolution,
        from: UnixSeconds,
        to: UnixSeconds,
    ) -> Result<Vec<Candle>, MarketError>;

    /// Latest candle with `bucket_start <= ts`.
    async fn candle_at_or_before(
        &self,
        asset: &Address,
        resolution: Resolution,
        ts: UnixSeconds,
    ) -> Result<Option<Candle>, MarketError>;

    async fn earliest_candle(
        &self,
        asset: &Address,
        resolution: Resolution,
    ) -> Result<Option<Candle>, MarketError>;

    /// Highest USD high across every resolution of the asset.
    async fn max_high_usd(&self, asset: &Address) -> Result<Option<Decimal>, MarketError>;

    // === Migrations ===

    /// Claim the asset's migration: insert a `Claimed` row, or take over a
    /// `ReleaseFailed` one. Returns `None` when another claim holds it or it
    /// already progressed.
    async fn claim_migration(&self, asset: &Address)
    -> Result<Option<MigrationRecord>, MarketError>;

    async fn get_migration(&self, asset: &Address) -> Result<Option<MigrationRecord>, MarketError>;

    /// Compare-and-swap the migration state. Returns `false` when the stored
    /// state was not `from`.
    async fn update_migration(
        &self,
        asset: &Address,
        from: MigrationState,
        to: MigrationState,
        update: &MigrationUpdate,
    ) -> Result<bool, MarketError>;

    async fn migrations_in_state(
        &self,
        state: MigrationState,
    ) -> Result<Vec<MigrationRecord>, MarketError>;
}
