//! PostgreSQL Ledger Store
//!
//! Settlement and candle upserts each run in one transaction holding a row
//! lock (`SELECT ... FOR UPDATE`). Lifecycle, ATH and migration updates are
//! single conditional statements.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use tracing::debug;

use super::LedgerStore;
use crate::candles::candle::{Candle, CandleKey, CandleMutation, apply_mutation};
use crate::candles::resolution::Resolution;
use crate::config::CurveConfig;
use crate::core_types::{Address, UnixSeconds};
use crate::curve::Reserves;
use crate::error::MarketError;
use crate::fee::FeeRole;
use crate::graduation::state::{Lifecycle, MigrationState};
use crate::models::{
    Direction, FeeDistribution, Market, MarketFilter, MigrationRecord, MigrationUpdate,
    NewMarket, ParticipantStats, QuotePriceSnapshot, SettledTrade, StatsDelta, Trade,
    TradeRequest,
};
use crate::settlement::plan::{SettlementContext, plan_trade};

const MARKET_COLUMNS: &str = "asset, creator, virtual_quote, virtual_asset, real_quote, \
    real_asset, total_supply, lifecycle, last_price, ath_usd, price_24h_ago_usd, pool_id, \
    graduated_at, created_at";

const TRADE_COLUMNS: &str = "trade_id, asset, trader, direction, quote_amount, asset_amount, \
    fee_total, price, quote_usd_rate, external_ref, executed_at";

const CANDLE_COLUMNS: &str = "asset, resolution, bucket_start, open, high, low, close, \
    open_usd, high_usd, low_usd, close_usd, volume_quote, volume_usd, trade_count";

const MIGRATION_COLUMNS: &str = "asset, state, quote_released, asset_released, pool_id, \
    last_error, attempts, updated_at";

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn market_exists(&self, asset: &Address) -> Result<bool, MarketError> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM markets WHERE asset = $1")
            .bind(asset.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn ensure_market(&self, asset: &Address) -> Result<(), MarketError> {
        if self.market_exists(asset).await? {
            Ok(())
        } else {
            Err(MarketError::NotFound(*asset))
        }
    }
}

fn parse_address(value: &str) -> Result<Address, MarketError> {
    Address::from_str(value).map_err(|e| MarketError::store("decode_address", e))
}

fn market_from_row(row: &PgRow) -> Result<Market, MarketError> {
    let asset: String = row.try_get("asset")?;
    let creator: String = row.try_get("creator")?;
    let lifecycle_id: i16 = row.try_get("lifecycle")?;
    let lifecycle = Lifecycle::from_id(lifecycle_id).ok_or_else(|| {
        MarketError::store("decode_market", format!("unknown lifecycle {}", lifecycle_id))
    })?;
    Ok(Market {
        asset: parse_address(&asset)?,
        creator: parse_address(&creator)?,
        reserves: Reserves {
            virtual_quote: row.try_get::<i64, _>("virtual_quote")? as u64,
            virtual_asset: row.try_get::<i64, _>("virtual_asset")? as u64,
            real_quote: row.try_get::<i64, _>("real_quote")? as u64,
            real_asset: row.try_get::<i64, _>("real_asset")? as u64,
        },
        total_supply: row.try_get::<i64, _>("total_supply")? as u64,
        lifecycle,
        last_price: row.try_get("last_price")?,
        ath_usd: row.try_get("ath_usd")?,
        price_24h_ago_usd: row.try_get("price_24h_ago_usd")?,
        pool_id: row.try_get("pool_id")?,
        graduated_at: row.try_get("graduated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade, MarketError> {
    let direction_id: i16 = row.try_get("direction")?;
    let direction = Direction::from_id(direction_id).ok_or_else(|| {
        MarketError::store("decode_trade", format!("unknown direction {}", direction_id))
    })?;
    Ok(Trade {
        trade_id: row.try_get("trade_id")?,
        asset: row.try_get("asset")?,
        trader: row.try_get("trader")?,
        direction,
        quote_amount: row.try_get::<i64, _>("quote_amount")? as u64,
        asset_amount: row.try_get::<i64, _>("asset_amount")? as u64,
        fee_total: row.try_get::<i64, _>("fee_total")? as u64,
        price: row.try_get("price")?,
        quote_usd_rate: row.try_get("quote_usd_rate")?,
        external_ref: row.try_get("external_ref")?,
        executed_at: row.try_get("executed_at")?,
    })
}

fn fee_from_row(row: &PgRow) -> Result<FeeDistribution, MarketError> {
    let role_id: i16 = row.try_get("role")?;
    let role = FeeRole::from_id(role_id)
        .ok_or_else(|| MarketError::store("decode_fee", format!("unknown role {}", role_id)))?;
    Ok(FeeDistribution {
        trade_id: row.try_get("trade_id")?,
        asset: row.try_get("asset")?,
        role,
        recipient: row.try_get("recipient")?,
        amount: row.try_get::<i64, _>("amount")? as u64,
    })
}

fn candle_from_row(row: &PgRow) -> Result<Candle, MarketError> {
    let resolution: String = row.try_get("resolution")?;
    let resolution = Resolution::from_str(&resolution)
        .map_err(|e| MarketError::store("decode_candle", e))?;
    Ok(Candle {
        asset: row.try_get("asset")?,
        resolution,
        bucket_start: row.try_get("bucket_start")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        open_usd: row.try_get("open_usd")?,
        high_usd: row.try_get("high_usd")?,
        low_usd: row.try_get("low_usd")?,
        close_usd: row.try_get("close_usd")?,
        volume_quote: row.try_get("volume_quote")?,
        volume_usd: row.try_get("volume_usd")?,
        trade_count: row.try_get::<i64, _>("trade_count")? as u64,
    })
}

fn stats_from_row(row: &PgRow) -> Result<ParticipantStats, MarketError> {
    Ok(ParticipantStats {
        participant: row.try_get("participant")?,
        volume_quote: row.try_get::<i64, _>("volume_quote")? as u64,
        trade_count: row.try_get::<i64, _>("trade_count")? as u64,
        fees_earned: row.try_get::<i64, _>("fees_earned")? as u64,
        assets_created: row.try_get::<i64, _>("assets_created")? as u64,
    })
}

fn migration_from_row(row: &PgRow) -> Result<MigrationRecord, MarketError> {
    let state_id: i16 = row.try_get("state")?;
    let state = MigrationState::from_id(state_id).ok_or_else(|| {
        MarketError::store("decode_migration", format!("unknown state {}", state_id))
    })?;
    Ok(MigrationRecord {
        asset: row.try_get("asset")?,
        state,
        quote_released: row.try_get::<i64, _>("quote_released")? as u64,
        asset_released: row.try_get::<i64, _>("asset_released")? as u64,
        pool_id: row.try_get("pool_id")?,
        last_error: row.try_get("last_error")?,
        attempts: row.try_get("attempts")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_candle(
    tx: &mut Transaction<'_, Postgres>,
    candle: &Candle,
) -> Result<bool, MarketError> {
    let result = sqlx::query(
        r#"
        INSERT INTO candles (asset, resolution, bucket_start, open, high, low, close,
                             open_usd, high_usd, low_usd, close_usd, volume_quote, volume_usd,
                             trade_count)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (asset, resolution, bucket_start) DO NOTHING
        "#,
    )
    .bind(&candle.asset)
    .bind(candle.resolution.as_str())
    .bind(candle.bucket_start)
    .bind(candle.open)
    .bind(candle.high)
    .bind(candle.low)
    .bind(candle.close)
    .bind(candle.open_usd)
    .bind(candle.high_usd)
    .bind(candle.low_usd)
    .bind(candle.close_usd)
    .bind(candle.volume_quote)
    .bind(candle.volume_usd)
    .bind(candle.trade_count as i64)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn update_candle(
    tx: &mut Transaction<'_, Postgres>,
    candle: &Candle,
) -> Result<(), MarketError> {
    sqlx::query(
        r#"
        UPDATE candles
        SET open = $4, high = $5, low = $6, close = $7,
            open_usd = $8, high_usd = $9, low_usd = $10, close_usd = $11,
            volume_quote = $12, volume_usd = $13, trade_count = $14, updated_at = NOW()
        WHERE asset = $1 AND resolution = $2 AND bucket_start = $3
        "#,
    )
    .bind(&candle.asset)
    .bind(candle.resolution.as_str())
    .bind(candle.bucket_start)
    .bind(candle.open)
    .bind(candle.high)
    .bind(candle.low)
    .bind(candle.close)
    .bind(candle.open_usd)
    .bind(candle.high_usd)
    .bind(candle.low_usd)
    .bind(candle.close_usd)
    .bind(candle.volume_quote)
    .bind(candle.volume_usd)
    .bind(candle.trade_count as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_candle(
    tx: &mut Transaction<'_, Postgres>,
    key: &CandleKey,
) -> Result<Option<Candle>, MarketError> {
    let sql = format!(
        "SELECT {} FROM candles WHERE asset = $1 AND resolution = $2 AND bucket_start = $3 FOR UPDATE",
        CANDLE_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(key.asset.to_string())
        .bind(key.resolution.as_str())
        .bind(key.bucket_start)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(candle_from_row).transpose()
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_market(
        &self,
        new: &NewMarket,
        curve: &CurveConfig,
    ) -> Result<Market, MarketError> {
        let market = Market::launch(new, curve);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO markets (asset, creator, virtual_quote, virtual_asset, real_quote,
                                 real_asset, total_supply, lifecycle, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (asset) DO NOTHING
            "#,
        )
        .bind(market.asset.to_string())
        .bind(market.creator.to_string())
        .bind(market.reserves.virtual_quote as i64)
        .bind(market.reserves.virtual_asset as i64)
        .bind(market.reserves.real_quote as i64)
        .bind(market.reserves.real_asset as i64)
        .bind(market.total_supply as i64)
        .bind(market.lifecycle.id())
        .bind(market.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(MarketError::InvalidInput(format!(
                "market for {} already exists",
                new.asset
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO participant_stats (participant, assets_created)
            VALUES ($1, 1)
            ON CONFLICT (participant)
            DO UPDATE SET assets_created = participant_stats.assets_created + 1, updated_at = NOW()
            "#,
        )
        .bind(market.creator.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(market)
    }

    async fn get_market(&self, asset: &Address) -> Result<Option<Market>, MarketError> {
        let sql = format!("SELECT {} FROM markets WHERE asset = $1", MARKET_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(asset.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(market_from_row).transpose()
    }

    async fn list_markets(&self, filter: MarketFilter) -> Result<Vec<Market>, MarketError> {
        let condition = match filter {
            MarketFilter::All => "TRUE",
            MarketFilter::NotMigrated => "lifecycle <> 20",
            MarketFilter::Traded => "last_price IS NOT NULL",
        };
        let sql = format!(
            "SELECT {} FROM markets WHERE {} ORDER BY created_at, asset",
            MARKET_COLUMNS, condition
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(market_from_row).collect()
    }

    async fn advance_lifecycle(
        &self,
        asset: &Address,
        from: Lifecycle,
        to: Lifecycle,
        pool_id: Option<&str>,
    ) -> Result<bool, MarketError> {
        if !from.can_advance_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE markets
            SET lifecycle = $3,
                graduated_at = COALESCE(graduated_at, NOW()),
                pool_id = CASE WHEN $3 = 20 THEN $4 ELSE pool_id END
            WHERE asset = $1 AND lifecycle = $2
            "#,
        )
        .bind(asset.to_string())
        .bind(from.id())
        .bind(to.id())
        .bind(pool_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_market(asset).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn raise_ath(&self, asset: &Address, price_usd: Decimal) -> Result<bool, MarketError> {
        let result = sqlx::query(
            "UPDATE markets SET ath_usd = $2 WHERE asset = $1 AND (ath_usd IS NULL OR ath_usd < $2)",
        )
        .bind(asset.to_string())
        .bind(price_usd)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.ensure_market(asset).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn set_ath(&self, asset: &Address, ath_usd: Option<Decimal>) -> Result<(), MarketError> {
        let result = sqlx::query("UPDATE markets SET ath_usd = $2 WHERE asset = $1")
            .bind(asset.to_string())
            .bind(ath_usd)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MarketError::NotFound(*asset));
        }
        Ok(())
    }

    async fn set_price_24h_ago(
        &self,
        asset: &Address,
        price_usd: Option<Decimal>,
    ) -> Result<(), MarketError> {
        let result = sqlx::query("UPDATE markets SET price_24h_ago_usd = $2 WHERE asset = $1")
            .bind(asset.to_string())
            .bind(price_usd)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MarketError::NotFound(*asset));
        }
        Ok(())
    }

    async fn settle_trade(
        &self,
        request: &TradeRequest,
        ctx: &SettlementContext,
        quote_usd_rate: Option<Decimal>,
    ) -> Result<SettledTrade, MarketError> {
        let asset = request.asset.to_string();
        let mut tx = self.pool.begin().await?;

        // Serializes settlements for this asset until commit
        let sql = format!(
            "SELECT {} FROM markets WHERE asset = $1 FOR UPDATE",
            MARKET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&asset)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(MarketError::NotFound(request.asset));
        };
        let market = market_from_row(&row)?;

        let known: Option<i64> =
            sqlx::query_scalar("SELECT trade_id FROM trades WHERE external_ref = $1")
                .bind(&request.external_ref)
                .fetch_optional(&mut *tx)
                .await?;
        if known.is_some() {
            return Err(MarketError::DuplicateSettlement(
                request.external_ref.clone(),
            ));
        }

        let plan = plan_trade(&market, request, ctx)?;

        sqlx::query(
            r#"
            UPDATE markets
            SET virtual_quote = $2, virtual_asset = $3, real_quote = $4, real_asset = $5,
                lifecycle = $6, last_price = $7,
                graduated_at = CASE WHEN $8 THEN $9 ELSE graduated_at END
            WHERE asset = $1
            "#,
        )
        .bind(&asset)
        .bind(plan.reserves.virtual_quote as i64)
        .bind(plan.reserves.virtual_asset as i64)
        .bind(plan.reserves.real_quote as i64)
        .bind(plan.reserves.real_asset as i64)
        .bind(plan.lifecycle.id())
        .bind(plan.price)
        .bind(plan.graduated_now)
        .bind(request.executed_at)
        .execute(&mut *tx)
        .await?;

        // A concurrent settlement on another asset may have taken the ref
        let trade_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO trades (asset, trader, direction, quote_amount, asset_amount, fee_total,
                                price, quote_usd_rate, external_ref, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (external_ref) DO NOTHING
            RETURNING trade_id
            "#,
        )
        .bind(&asset)
        .bind(request.trader.to_string())
        .bind(plan.direction.id())
        .bind(plan.quote_amount as i64)
        .bind(plan.asset_amount as i64)
        .bind(plan.fee_total as i64)
        .bind(plan.price)
        .bind(quote_usd_rate)
        .bind(&request.external_ref)
        .bind(request.executed_at)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(trade_id) = trade_id else {
            return Err(MarketError::DuplicateSettlement(
                request.external_ref.clone(),
            ));
        };

        for (role, recipient, amount) in &plan.fees {
            sqlx::query(
                r#"
                INSERT INTO fee_distributions (trade_id, asset, role, recipient, amount)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(trade_id)
            .bind(&asset)
            .bind(role.id())
            .bind(recipient.to_string())
            .bind(*amount as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            asset = %request.asset,
            trade_id = trade_id,
            signature = %request.external_ref,
            "Trade committed"
        );
        Ok(plan.into_settled(trade_id, request, quote_usd_rate))
    }

    async fn trade_by_ref(&self, external_ref: &str) -> Result<Option<Trade>, MarketError> {
        let sql = format!("SELECT {} FROM trades WHERE external_ref = $1", TRADE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn trades_for_asset(
        &self,
        asset: &Address,
        limit: usize,
    ) -> Result<Vec<Trade>, MarketError> {
        let sql = format!(
            "SELECT {} FROM trades WHERE asset = $1 ORDER BY trade_id DESC LIMIT $2",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(asset.to_string())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn all_trades(&self) -> Result<Vec<Trade>, MarketError> {
        let sql = format!("SELECT {} FROM trades ORDER BY trade_id", TRADE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn fees_for_trade(&self, trade_id: i64) -> Result<Vec<FeeDistribution>, MarketError> {
        let rows = sqlx::query(
            "SELECT trade_id, asset, role, recipient, amount FROM fee_distributions \
             WHERE trade_id = $1 ORDER BY role",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fee_from_row).collect()
    }

    async fn all_fee_distributions(&self) -> Result<Vec<FeeDistribution>, MarketError> {
        let rows = sqlx::query(
            "SELECT trade_id, asset, role, recipient, amount FROM fee_distributions \
             ORDER BY trade_id, role",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fee_from_row).collect()
    }

    async fn apply_stats_delta(
        &self,
        participant: &str,
        delta: &StatsDelta,
    ) -> Result<(), MarketError> {
        sqlx::query(
            r#"
            INSERT INTO participant_stats (participant, volume_quote, trade_count, fees_earned,
                                           assets_created)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (participant) DO UPDATE SET
                volume_quote = participant_stats.volume_quote + EXCLUDED.volume_quote,
                trade_count = participant_stats.trade_count + EXCLUDED.trade_count,
                fees_earned = participant_stats.fees_earned + EXCLUDED.fees_earned,
                assets_created = participant_stats.assets_created + EXCLUDED.assets_created,
                updated_at = NOW()
            "#,
        )
        .bind(participant)
        .bind(delta.volume_quote as i64)
        .bind(delta.trade_count as i64)
        .bind(delta.fees_earned as i64)
        .bind(delta.assets_created as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn participant_stats(
        &self,
        participant: &str,
    ) -> Result<Option<ParticipantStats>, MarketError> {
        let row = sqlx::query(
            "SELECT participant, volume_quote, trade_count, fees_earned, assets_created \
             FROM participant_stats WHERE participant = $1",
        )
        .bind(participant)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stats_from_row).transpose()
    }

    async fn replace_participant_stats(
        &self,
        stats: &[ParticipantStats],
    ) -> Result<(), MarketError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM participant_stats")
            .execute(&mut *tx)
            .await?;
        for s in stats {
            sqlx::query(
                r#"
                INSERT INTO participant_stats (participant, volume_quote, trade_count,
                                               fees_earned, assets_created)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&s.participant)
            .bind(s.volume_quote as i64)
            .bind(s.trade_count as i64)
            .bind(s.fees_earned as i64)
            .bind(s.assets_created as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn quote_price(&self) -> Result<Option<QuotePriceSnapshot>, MarketError> {
        let row = sqlx::query(
            "SELECT rate_usd, source, fetched_at FROM quote_price_snapshot WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(QuotePriceSnapshot {
                rate_usd: row.try_get("rate_usd")?,
                source: row.try_get("source")?,
                fetched_at: row.try_get("fetched_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn store_quote_price(&self, snapshot: &QuotePriceSnapshot) -> Result<(), MarketError> {
        sqlx::query(
            r#"
            INSERT INTO quote_price_snapshot (id, rate_usd, source, fetched_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET rate_usd = EXCLUDED.rate_usd, source = EXCLUDED.source,
                fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(snapshot.rate_usd)
        .bind(&snapshot.source)
        .bind(snapshot.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_candle(
        &self,
        key: &CandleKey,
        mutation: &CandleMutation,
    ) -> Result<Candle, MarketError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM candles WHERE asset = $1 AND resolution = $2 AND bucket_start < $3 \
             ORDER BY bucket_start DESC LIMIT 1",
            CANDLE_COLUMNS
        );
        let previous = sqlx::query(&sql)
            .bind(key.asset.to_string())
            .bind(key.resolution.as_str())
            .bind(key.bucket_start)
            .fetch_optional(&mut *tx)
            .await?;
        let previous = previous.as_ref().map(candle_from_row).transpose()?;

        let candle = match lock_candle(&mut tx, key).await? {
            Some(current) => {
                let next = apply_mutation(key, Some(&current), previous.as_ref(), mutation);
                update_candle(&mut tx, &next).await?;
                next
            }
            None => {
                let fresh = apply_mutation(key, None, previous.as_ref(), mutation);
                if insert_candle(&mut tx, &fresh).await? {
                    fresh
                } else {
                    // Lost the insert race; extend the winner's row
                    let current = lock_candle(&mut tx, key).await?.ok_or_else(|| {
                        MarketError::store("upsert_candle", "candle vanished after conflict")
                    })?;
                    let next = apply_mutation(key, Some(&current), previous.as_ref(), mutation);
                    update_candle(&mut tx, &next).await?;
                    next
                }
            }
        };

        tx.commit().await?;
        Ok(candle)
    }

    async fn get_candle(&self, key: &CandleKey) -> Result<Option<Candle>, MarketError> {
        let sql = format!(
            "SELECT {} FROM candles WHERE asset = $1 AND resolution = $2 AND bucket_start = $3",
            CANDLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.asset.to_string())
            .bind(key.resolution.as_str())
            .bind(key.bucket_start)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(candle_from_row).transpose()
    }

    async fn candles_in_range(
        &self,
        asset: &Address,
        resolution: Resolution,
        from: UnixSeconds,
        to: UnixSeconds,
    ) -> Result<Vec<Candle>, MarketError> {
        let sql = format!(
            "SELECT {} FROM candles WHERE asset = $1 AND resolution = $2 \
             AND bucket_start >= $3 AND bucket_start < $4 ORDER BY bucket_start",
            CANDLE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(asset.to_string())
            .bind(resolution.as_str())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(candle_from_row).collect()
    }

    async fn candle_at_or_before(
        &self,
        asset: &Address,
        resolution: Resolution,
        ts: UnixSeconds,
    ) -> Result<Option<Candle>, MarketError> {
        let sql = format!(
            "SELECT {} FROM candles WHERE asset = $1 AND resolution = $2 AND bucket_start <= $3 \
             ORDER BY bucket_start DESC LIMIT 1",
            CANDLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(asset.to_string())
            .bind(resolution.as_str())
            .bind(ts)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(candle_from_row).transpose()
    }

    async fn earliest_candle(
        &self,
        asset: &Address,
        resolution: Resolution,
    ) -> Result<Option<Candle>, MarketError> {
        let sql = format!(
            "SELECT {} FROM candles WHERE asset = $1 AND resolution = $2 \
             ORDER BY bucket_start LIMIT 1",
            CANDLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(asset.to_string())
            .bind(resolution.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(candle_from_row).transpose()
    }

    async fn max_high_usd(&self, asset: &Address) -> Result<Option<Decimal>, MarketError> {
        let max: Option<Decimal> =
            sqlx::query_scalar("SELECT MAX(high_usd) FROM candles WHERE asset = $1")
                .bind(asset.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }

    async fn claim_migration(
        &self,
        asset: &Address,
    ) -> Result<Option<MigrationRecord>, MarketError> {
        let sql = format!(
            r#"
            INSERT INTO migrations (asset, state, attempts)
            VALUES ($1, $2, 1)
            ON CONFLICT (asset) DO UPDATE
            SET state = EXCLUDED.state, attempts = migrations.attempts + 1, updated_at = NOW()
            WHERE migrations.state = $3
            RETURNING {}
            "#,
            MIGRATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(asset.to_string())
            .bind(MigrationState::Claimed.id())
            .bind(MigrationState::ReleaseFailed.id())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(migration_from_row).transpose()
    }

    async fn get_migration(&self, asset: &Address) -> Result<Option<MigrationRecord>, MarketError> {
        let sql = format!("SELECT {} FROM migrations WHERE asset = $1", MIGRATION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(asset.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(migration_from_row).transpose()
    }

    async fn update_migration(
        &self,
        asset: &Address,
        from: MigrationState,
        to: MigrationState,
        update: &MigrationUpdate,
    ) -> Result<bool, MarketError> {
        let result = sqlx::query(
            r#"
            UPDATE migrations
            SET state = $3,
                quote_released = COALESCE($4, quote_released),
                asset_released = COALESCE($5, asset_released),
                pool_id = COALESCE($6, pool_id),
                last_error = COALESCE($7, last_error),
                updated_at = NOW()
            WHERE asset = $1 AND state = $2
            "#,
        )
        .bind(asset.to_string())
        .bind(from.id())
        .bind(to.id())
        .bind(update.quote_released.map(|v| v as i64))
        .bind(update.asset_released.map(|v| v as i64))
        .bind(update.pool_id.as_deref())
        .bind(update.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn migrations_in_state(
        &self,
        state: MigrationState,
    ) -> Result<Vec<MigrationRecord>, MarketError> {
        let sql = format!(
            "SELECT {} FROM migrations WHERE state = $1 ORDER BY updated_at",
            MIGRATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(state.id())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(migration_from_row).collect()
    }
}
