//! Graduation Controller
//!
//! Drives a graduated market to its external pool:
//!
//! ```text
//! (a) claim migration record      idempotency guard
//! (b) release real reserves       custody → migration custody
//! (c) create pool                 bounded by pool_timeout
//! (d) record pool + MIGRATED      store
//! (e) announce                    detached, best-effort
//! ```
//!
//! The flow is not atomic. A failed (b) leaves nothing moved and the claim
//! can be taken again. A failed (c) leaves funds in migration custody; only
//! (c) and (d) are ever retried from there, never the release. A failed (d)
//! after a successful (c) is repaired from the pool service's record by the
//! reconciliation watcher.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::adapters::{Announcer, CustodyService, MigrationEvent, PoolCreator};
use super::state::{Lifecycle, MigrationState};
use crate::core_types::{Address, AssetUnits, Lamports};
use crate::error::MarketError;
use crate::models::MigrationUpdate;
use crate::store::LedgerStore;

/// Result of a migration attempt that did not error outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Pool created and recorded in this call
    Migrated { pool_id: String },

    /// Nothing to do; the market was already migrated
    AlreadyMigrated,

    /// Another attempt holds the migration
    InProgress(MigrationState),

    /// Funds are in migration custody but no pool exists yet.
    /// Needs [`GraduationController::retry_pool_creation`].
    ReleasedNotPooled { reason: String },

    /// The pool exists but recording it failed. The external record is
    /// authoritative; reconciliation will write it back.
    PoolCreatedUnrecorded { pool_id: String, reason: String },
}

impl MigrationOutcome {
    /// The pool exists, whether or not it is recorded locally yet.
    pub fn pool_exists(&self) -> bool {
        matches!(
            self,
            MigrationOutcome::Migrated { .. }
                | MigrationOutcome::AlreadyMigrated
                | MigrationOutcome::PoolCreatedUnrecorded { .. }
        )
    }
}

pub struct GraduationController {
    store: Arc<dyn LedgerStore>,
    custody: Arc<dyn CustodyService>,
    pools: Arc<dyn PoolCreator>,
    announcer: Arc<dyn Announcer>,
    pool_timeout: Duration,
}

impl GraduationController {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        custody: Arc<dyn CustodyService>,
        pools: Arc<dyn PoolCreator>,
        announcer: Arc<dyn Announcer>,
        pool_timeout: Duration,
    ) -> Self {
        Self {
            store,
            custody,
            pools,
            announcer,
            pool_timeout,
        }
    }

    /// Run the full migration for a graduated market.
    pub async fn migrate(&self, asset: &Address) -> Result<MigrationOutcome, MarketError> {
        let market = self
            .store
            .get_market(asset)
            .await?
            .ok_or(MarketError::NotFound(*asset))?;
        match market.lifecycle {
            Lifecycle::Migrated => return Ok(MigrationOutcome::AlreadyMigrated),
            Lifecycle::Active => {
                return Err(MarketError::InvalidState {
                    asset: *asset,
                    operation: "migrate",
                    reason: "market has not graduated".to_string(),
                });
            }
            Lifecycle::Graduated => {}
        }

        // (a)
        let Some(claim) = self.store.claim_migration(asset).await? else {
            let state = self
                .store
                .get_migration(asset)
                .await?
                .map(|r| r.state)
                .unwrap_or(MigrationState::Claimed);
            debug!(asset = %asset, state = %state, "Migration already claimed");
            return Ok(match state {
                MigrationState::Pooled => MigrationOutcome::AlreadyMigrated,
                other => MigrationOutcome::InProgress(other),
            });
        };
        info!(
            asset = %asset,
            attempt = claim.attempts,
            real_quote = market.reserves.real_quote,
            real_asset = market.reserves.real_asset,
            "Migration claimed"
        );

        // (b)
        let receipt = match self
            .custody
            .release_reserves(asset, market.reserves.real_quote, market.reserves.real_asset)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(asset = %asset, custody = self.custody.name(), error = %e, "Reserve release failed");
                let update = MigrationUpdate {
                    last_error: Some(e.to_string()),
                    ..Default::default()
                };
                self.store
                    .update_migration(
                        asset,
                        MigrationState::Claimed,
                        MigrationState::ReleaseFailed,
                        &update,
                    )
                    .await?;
                return Err(e);
            }
        };

        let update = MigrationUpdate {
            quote_released: Some(receipt.quote_released),
            asset_released: Some(receipt.asset_released),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .update_migration(asset, MigrationState::Claimed, MigrationState::Released, &update)
            .await
        {
            // Funds moved but the record still says CLAIMED; never re-release
            error!(
                asset = %asset,
                reference = %receipt.reference,
                error = %e,
                "Reserves released but release not recorded"
            );
            return Err(e);
        }
        info!(
            asset = %asset,
            reference = %receipt.reference,
            quote = receipt.quote_released,
            units = receipt.asset_released,
            "Reserves released to migration custody"
        );

        // (c) (d) (e)
        self.create_and_record(asset, receipt.quote_released, receipt.asset_released)
            .await
    }

    /// Retry pool creation for a migration stuck in `RELEASED`. Reuses a
    /// pool the service already knows about before creating a new one.
    pub async fn retry_pool_creation(
        &self,
        asset: &Address,
    ) -> Result<MigrationOutcome, MarketError> {
        let record = self
            .store
            .get_migration(asset)
            .await?
            .ok_or_else(|| MarketError::InvalidState {
                asset: *asset,
                operation: "retry_pool_creation",
                reason: "no migration record".to_string(),
            })?;

        match record.state {
            MigrationState::Pooled => {
                self.heal_lifecycle(asset).await?;
                return Ok(MigrationOutcome::AlreadyMigrated);
            }
            MigrationState::Released => {}
            other => {
                return Err(MarketError::InvalidState {
                    asset: *asset,
                    operation: "retry_pool_creation",
                    reason: format!("migration is {}, expected RELEASED", other),
                });
            }
        }

        if let Some(pool_id) = self.find_pool(asset).await? {
            info!(asset = %asset, pool_id = %pool_id, "Found existing pool; recording it");
            return Ok(self
                .record_pool(asset, pool_id, record.quote_released, record.asset_released)
                .await);
        }

        info!(asset = %asset, attempt = record.attempts, "Retrying pool creation");
        self.create_and_record(asset, record.quote_released, record.asset_released)
            .await
    }

    pub async fn find_pool(&self, asset: &Address) -> Result<Option<String>, MarketError> {
        self.pools.find_pool(asset).await
    }

    /// Record a pool that was created outside this controller (the
    /// external ledger reports the market migrated). Returns whether any
    /// local state changed.
    pub async fn complete_from_external(
        &self,
        asset: &Address,
        pool_id: &str,
    ) -> Result<bool, MarketError> {
        let market = self
            .store
            .get_market(asset)
            .await?
            .ok_or(MarketError::NotFound(*asset))?;

        let mut changed = false;
        if market.lifecycle == Lifecycle::Active {
            changed |= self
                .store
                .advance_lifecycle(asset, Lifecycle::Active, Lifecycle::Graduated, None)
                .await?;
        }
        if market.lifecycle != Lifecycle::Migrated {
            changed |= self
                .store
                .advance_lifecycle(asset, Lifecycle::Graduated, Lifecycle::Migrated, Some(pool_id))
                .await?;
        }

        if let Some(record) = self.store.get_migration(asset).await? {
            if !record.state.is_terminal() {
                let update = MigrationUpdate {
                    pool_id: Some(pool_id.to_string()),
                    ..Default::default()
                };
                changed |= self
                    .store
                    .update_migration(asset, record.state, MigrationState::Pooled, &update)
                    .await?;
            }
        }

        if changed {
            info!(asset = %asset, pool_id = %pool_id, "Migration completed from external ledger");
        }
        Ok(changed)
    }

    /// Advance a `GRADUATED` market whose migration record is already
    /// `POOLED`. Returns whether the lifecycle moved.
    pub async fn heal_lifecycle(&self, asset: &Address) -> Result<bool, MarketError> {
        let Some(record) = self.store.get_migration(asset).await? else {
            return Ok(false);
        };
        let (MigrationState::Pooled, Some(pool_id)) = (record.state, record.pool_id.as_deref())
        else {
            return Ok(false);
        };
        let healed = self
            .store
            .advance_lifecycle(asset, Lifecycle::Graduated, Lifecycle::Migrated, Some(pool_id))
            .await?;
        if healed {
            info!(asset = %asset, pool_id = %pool_id, "Lifecycle caught up with pooled migration");
        }
        Ok(healed)
    }

    async fn create_and_record(
        &self,
        asset: &Address,
        quote: Lamports,
        units: AssetUnits,
    ) -> Result<MigrationOutcome, MarketError> {
        let created =
            tokio::time::timeout(self.pool_timeout, self.pools.create_pool(asset, quote, units))
                .await;
        let pool_id = match created {
            Ok(Ok(pool_id)) => pool_id,
            Ok(Err(e)) => return self.leave_released(asset, e.to_string()).await,
            Err(_) => {
                let reason = format!(
                    "pool creation timed out after {}s",
                    self.pool_timeout.as_secs_f64()
                );
                return self.leave_released(asset, reason).await;
            }
        };
        info!(asset = %asset, pool = self.pools.name(), pool_id = %pool_id, "Pool created");
        Ok(self.record_pool(asset, pool_id, quote, units).await)
    }

    async fn leave_released(
        &self,
        asset: &Address,
        reason: String,
    ) -> Result<MigrationOutcome, MarketError> {
        error!(
            asset = %asset,
            reason = %reason,
            "Pool creation failed; funds held in migration custody, retry pool creation"
        );
        let update = MigrationUpdate {
            last_error: Some(reason.clone()),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .update_migration(asset, MigrationState::Released, MigrationState::Released, &update)
            .await
        {
            warn!(asset = %asset, error = %e, "Could not record pool creation failure");
        }
        Ok(MigrationOutcome::ReleasedNotPooled { reason })
    }

    /// Step (d) and (e). Store failures degrade to `PoolCreatedUnrecorded`.
    async fn record_pool(
        &self,
        asset: &Address,
        pool_id: String,
        quote: Lamports,
        units: AssetUnits,
    ) -> MigrationOutcome {
        if let Err(e) = self.write_pool(asset, &pool_id).await {
            error!(
                asset = %asset,
                pool_id = %pool_id,
                error = %e,
                "Pool created but not recorded; reconciliation will repair"
            );
            return MigrationOutcome::PoolCreatedUnrecorded {
                pool_id,
                reason: e.to_string(),
            };
        }
        info!(asset = %asset, pool_id = %pool_id, "Market migrated");

        let event = MigrationEvent {
            asset: asset.to_string(),
            pool_id: pool_id.clone(),
            quote_released: quote,
            asset_released: units,
            migrated_at: Utc::now(),
        };
        let announcer = self.announcer.clone();
        tokio::spawn(async move {
            if let Err(e) = announcer.announce_migration(&event).await {
                warn!(asset = %event.asset, error = %e, "Migration announcement failed");
            }
        });

        MigrationOutcome::Migrated { pool_id }
    }

    async fn write_pool(&self, asset: &Address, pool_id: &str) -> Result<(), MarketError> {
        let update = MigrationUpdate {
            pool_id: Some(pool_id.to_string()),
            ..Default::default()
        };
        let recorded = self
            .store
            .update_migration(asset, MigrationState::Released, MigrationState::Pooled, &update)
            .await?;
        if !recorded {
            warn!(
                asset = %asset,
                pool_id = %pool_id,
                "Migration record left Released under a concurrent writer; pool not recorded"
            );
            return Err(MarketError::InvalidState {
                asset: *asset,
                operation: "record_pool",
                reason: "migration record is no longer Released".to_string(),
            });
        }
        self.store
            .advance_lifecycle(asset, Lifecycle::Graduated, Lifecycle::Migrated, Some(pool_id))
            .await?;
        Ok(())
    }
}
