//! Collaborator Adapters
//!
//! Capabilities the migration flow consumes. Every mutating call is keyed by
//! asset and must be idempotent: calling twice for the same asset has the
//! same effect as calling once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::account::CurveAccount;
use crate::core_types::{Address, AssetUnits, Lamports};
use crate::error::MarketError;

/// Reads the authoritative curve account from the external ledger.
#[async_trait]
pub trait ExternalLedgerReader: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the account does not exist.
    async fn read_curve(&self, asset: &Address) -> Result<Option<CurveAccount>, MarketError>;
}

/// Amounts actually moved into migration custody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub quote_released: Lamports,
    pub asset_released: AssetUnits,
    /// External reference of the release (e.g. a transaction signature)
    pub reference: String,
}

/// Moves real reserves out of curve custody.
#[async_trait]
pub trait CustodyService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Release the curve's real reserves into migration custody.
    ///
    /// # Idempotency
    /// A second call for an already released asset returns the original
    /// receipt without moving funds again.
    async fn release_reserves(
        &self,
        asset: &Address,
        quote: Lamports,
        units: AssetUnits,
    ) -> Result<ReleaseReceipt, MarketError>;
}

/// External pool-creation capability.
#[async_trait]
pub trait PoolCreator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the pool and return its identifier.
    async fn create_pool(
        &self,
        asset: &Address,
        quote: Lamports,
        units: AssetUnits,
    ) -> Result<String, MarketError>;

    /// Identifier of an existing pool for `asset`, if any.
    async fn find_pool(&self, asset: &Address) -> Result<Option<String>, MarketError>;
}

/// Payload announced once a migration completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub asset: String,
    pub pool_id: String,
    pub quote_released: Lamports,
    pub asset_released: AssetUnits,
    pub migrated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce_migration(&self, event: &MigrationEvent) -> Result<(), MarketError>;
}

/// Announcer that only writes a log line.
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce_migration(&self, event: &MigrationEvent) -> Result<(), MarketError> {
        info!(
            asset = %event.asset,
            pool_id = %event.pool_id,
            quote = event.quote_released,
            units = event.asset_released,
            "Migration announced"
        );
        Ok(())
    }
}
