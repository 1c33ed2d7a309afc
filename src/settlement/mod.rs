//! Settlement
//!
//! - [`plan`]: pure trade planning against a locked market snapshot
//! - [`engine`]: the settlement entry point and its downstream effects
//! - [`stats`]: best-effort participant statistics and the backfill that
//!   repairs them

pub mod engine;
pub mod plan;
pub mod stats;

#[cfg(test)]
mod integration_tests;

pub use engine::{SettlementEngine, SettlementOutcome};
pub use plan::{SettlementContext, TradePlan, plan_trade, validate_request};
pub use stats::{backfill_participant_stats, spawn_stats_update};
