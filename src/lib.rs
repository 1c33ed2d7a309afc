//! curve_market - Bonding-Curve Market Core
//!
//! Prices, settles and charts assets traded against a constant-product
//! bonding curve, then graduates them to an external pool.
//!
//! # Modules
//!
//! - [`core_types`] - Addresses and amount aliases
//! - [`money`] - Lamport / unit / decimal conversion
//! - [`fee`] - Fee rate and recipient split
//! - [`curve`] - Pure buy/sell pricing
//! - [`models`] - Market, Trade and ledger rows
//! - [`store`] - Ledger Store (PostgreSQL and in-process)
//! - [`settlement`] - Atomic, idempotent trade settlement
//! - [`candles`] - OHLCV series at five resolutions
//! - [`feed`] - Quote/USD exchange-rate feed
//! - [`graduation`] - Lifecycle, migration and reconciliation
//! - [`error`] - Error taxonomy

// Core types - must be first!
pub mod core_types;

// Pricing
pub mod curve;
pub mod fee;
pub mod money;

// Ledger
pub mod db;
pub mod models;
pub mod store;

// Services
pub mod candles;
pub mod feed;
pub mod graduation;
pub mod settlement;

// Ambient
pub mod config;
pub mod error;
pub mod logging;

// Convenient re-exports at crate root
pub use candles::{Candle, CandleAggregator, HeartbeatWorker, Resolution};
pub use config::{AppConfig, CurveConfig, SourceOfTruth};
pub use core_types::{Address, AssetUnits, Lamports};
pub use curve::{Fill, Reserves, quote_buy, quote_sell};
pub use error::MarketError;
pub use feed::{FixedPriceFeed, HttpPriceFeed, QuotePriceFeed};
pub use graduation::{
    GraduationController, GraduationWatcher, Lifecycle, MigrationOutcome, MigrationState,
};
pub use models::{Direction, Market, NewMarket, SettledTrade, Trade, TradeRequest};
pub use settlement::{SettlementContext, SettlementEngine, SettlementOutcome};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
