//! PostgreSQL schema
//!
//! Amounts are BIGINT lamports / raw asset units, prices NUMERIC. Every
//! statement is idempotent so `init_schema` can run on each start.

use sqlx::PgPool;

const CREATE_MARKETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    asset             TEXT PRIMARY KEY,
    creator           TEXT NOT NULL,
    virtual_quote     BIGINT NOT NULL CHECK (virtual_quote > 0),
    virtual_asset     BIGINT NOT NULL CHECK (virtual_asset > 0),
    real_quote        BIGINT NOT NULL CHECK (real_quote >= 0),
    real_asset        BIGINT NOT NULL CHECK (real_asset >= 0),
    total_supply      BIGINT NOT NULL,
    lifecycle         SMALLINT NOT NULL DEFAULT 0,
    last_price        NUMERIC,
    ath_usd           NUMERIC,
    price_24h_ago_usd NUMERIC,
    pool_id           TEXT,
    graduated_at      TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_TRADES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    trade_id       BIGSERIAL PRIMARY KEY,
    asset          TEXT NOT NULL REFERENCES markets(asset),
    trader         TEXT NOT NULL,
    direction      SMALLINT NOT NULL,
    quote_amount   BIGINT NOT NULL,
    asset_amount   BIGINT NOT NULL,
    fee_total      BIGINT NOT NULL,
    price          NUMERIC NOT NULL,
    quote_usd_rate NUMERIC,
    external_ref   TEXT NOT NULL UNIQUE,
    executed_at    TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_TRADES_ASSET_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_trades_asset ON trades (asset, trade_id DESC)";

const CREATE_FEE_DISTRIBUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS fee_distributions (
    trade_id  BIGINT NOT NULL REFERENCES trades(trade_id),
    asset     TEXT NOT NULL,
    role      SMALLINT NOT NULL,
    recipient TEXT NOT NULL,
    amount    BIGINT NOT NULL CHECK (amount > 0),
    PRIMARY KEY (trade_id, role)
)
"#;

const CREATE_CANDLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    asset        TEXT NOT NULL,
    resolution   TEXT NOT NULL,
    bucket_start BIGINT NOT NULL,
    open         NUMERIC NOT NULL,
    high         NUMERIC NOT NULL,
    low          NUMERIC NOT NULL,
    close        NUMERIC NOT NULL,
    open_usd     NUMERIC NOT NULL,
    high_usd     NUMERIC NOT NULL,
    low_usd      NUMERIC NOT NULL,
    close_usd    NUMERIC NOT NULL,
    volume_quote NUMERIC NOT NULL DEFAULT 0,
    volume_usd   NUMERIC NOT NULL DEFAULT 0,
    trade_count  BIGINT NOT NULL DEFAULT 0,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (asset, resolution, bucket_start)
)
"#;

const CREATE_QUOTE_PRICE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS quote_price_snapshot (
    id         SMALLINT PRIMARY KEY CHECK (id = 1),
    rate_usd   NUMERIC NOT NULL,
    source     TEXT NOT NULL,
    fetched_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_PARTICIPANT_STATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS participant_stats (
    participant    TEXT PRIMARY KEY,
    volume_quote   BIGINT NOT NULL DEFAULT 0,
    trade_count    BIGINT NOT NULL DEFAULT 0,
    fees_earned    BIGINT NOT NULL DEFAULT 0,
    assets_created BIGINT NOT NULL DEFAULT 0,
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    asset          TEXT PRIMARY KEY REFERENCES markets(asset),
    state          SMALLINT NOT NULL,
    quote_released BIGINT NOT NULL DEFAULT 0,
    asset_released BIGINT NOT NULL DEFAULT 0,
    pool_id        TEXT,
    last_error     TEXT,
    attempts       INTEGER NOT NULL DEFAULT 1,
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const STATEMENTS: &[(&str, &str)] = &[
    ("markets", CREATE_MARKETS_TABLE),
    ("trades", CREATE_TRADES_TABLE),
    ("idx_trades_asset", CREATE_TRADES_ASSET_INDEX),
    ("fee_distributions", CREATE_FEE_DISTRIBUTIONS_TABLE),
    ("candles", CREATE_CANDLES_TABLE),
    ("quote_price_snapshot", CREATE_QUOTE_PRICE_TABLE),
    ("participant_stats", CREATE_PARTICIPANT_STATS_TABLE),
    ("migrations", CREATE_MIGRATIONS_TABLE),
];

/// Create every table and index if missing.
pub async fn init_schema(pool: &PgPool) -> anyhow::Result<()> {
    tracing::info!("Initializing ledger schema...");

    for (name, sql) in STATEMENTS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", name, e))?;
    }

    tracing::info!("Ledger schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for (name, sql) in STATEMENTS {
            assert!(sql.contains("IF NOT EXISTS"), "{} is not idempotent", name);
        }
    }

    #[test]
    fn test_settlement_ref_is_unique() {
        assert!(CREATE_TRADES_TABLE.contains("external_ref   TEXT NOT NULL UNIQUE"));
        assert!(CREATE_CANDLES_TABLE.contains("PRIMARY KEY (asset, resolution, bucket_start)"));
    }
}
