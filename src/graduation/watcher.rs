//! Reconciliation Watcher
//!
//! Periodically walks every market that has not migrated, corrects its
//! lifecycle from whichever ledger is authoritative, and re-drives the
//! migration of graduated markets. Every step is idempotent, so a pass can
//! be interrupted or repeated at any point.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::adapters::ExternalLedgerReader;
use super::controller::{GraduationController, MigrationOutcome};
use super::state::{Lifecycle, MigrationState};
use crate::config::{ScheduleConfig, SourceOfTruth};
use crate::core_types::Lamports;
use crate::error::MarketError;
use crate::models::{Market, MarketFilter};
use crate::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval: Duration,
    /// Markets examined per pass. Successive passes page through the rest.
    pub batch_size: usize,
    /// A CLAIMED migration older than this is reported as stuck
    pub stale_claim_after: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 500,
            stale_claim_after: Duration::from_secs(600),
        }
    }
}

impl WatcherConfig {
    pub fn from_schedule(schedule: &ScheduleConfig) -> Self {
        Self {
            interval: schedule.reconcile_interval(),
            batch_size: schedule.reconcile_batch_size,
            ..Default::default()
        }
    }
}

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Lifecycles moved ACTIVE → GRADUATED
    pub graduated: usize,
    /// Migrations completed in this pass
    pub migrated: usize,
    /// Markets the external ledger had already migrated
    pub completed_external: usize,
    /// Funds in migration custody waiting for a pool
    pub released_pending: usize,
    /// Local records repaired from an existing pool
    pub healed: usize,
    /// Local state disagrees with the external ledger in a way only an
    /// operator can settle
    pub manual_review: usize,
    pub errors: usize,
}

impl ReconcileReport {
    /// Nothing was changed or flagged in this pass.
    pub fn is_idle(&self) -> bool {
        self.graduated == 0
            && self.migrated == 0
            && self.completed_external == 0
            && self.released_pending == 0
            && self.healed == 0
            && self.manual_review == 0
            && self.errors == 0
    }
}

pub struct GraduationWatcher {
    store: Arc<dyn LedgerStore>,
    controller: Arc<GraduationController>,
    reader: Option<Arc<dyn ExternalLedgerReader>>,
    source_of_truth: SourceOfTruth,
    threshold: Lamports,
    config: WatcherConfig,
    /// Offset of the next page into the non-migrated markets
    cursor: AtomicUsize,
}

impl GraduationWatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        controller: Arc<GraduationController>,
        source_of_truth: SourceOfTruth,
        threshold: Lamports,
        config: WatcherConfig,
    ) -> Self {
        Self {
            store,
            controller,
            reader: None,
            source_of_truth,
            threshold,
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Reader for the external ledger; required when it is authoritative.
    pub fn with_reader(mut self, reader: Arc<dyn ExternalLedgerReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Loop forever, one pass per interval.
    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            source_of_truth = ?self.source_of_truth,
            "Starting graduation watcher"
        );
        loop {
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "Reconciliation pass failed");
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// Run one pass. Per-market failures are counted, not returned.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, MarketError> {
        if self.source_of_truth == SourceOfTruth::OnChain && self.reader.is_none() {
            return Err(MarketError::external(
                "ledger_reader",
                "external ledger is authoritative but no reader is configured",
            ));
        }

        let markets = self.store.list_markets(MarketFilter::NotMigrated).await?;
        let mut report = ReconcileReport::default();
        for market in self.next_page(&markets) {
            report.scanned += 1;
            if let Err(e) = self.reconcile_market(market, &mut report).await {
                report.errors += 1;
                error!(asset = %market.asset, error = %e, "Failed to reconcile market");
            }
        }

        if !report.is_idle() {
            info!(
                scanned = report.scanned,
                graduated = report.graduated,
                migrated = report.migrated,
                completed_external = report.completed_external,
                released_pending = report.released_pending,
                healed = report.healed,
                manual_review = report.manual_review,
                errors = report.errors,
                "Reconciliation pass complete"
            );
        } else {
            debug!(scanned = report.scanned, "Reconciliation pass found nothing to do");
        }
        Ok(report)
    }

    /// The next `batch_size` markets, wrapping around the list so every
    /// market is visited within `ceil(len / batch_size)` passes.
    fn next_page<'a>(&self, markets: &'a [Market]) -> Vec<&'a Market> {
        if markets.is_empty() {
            return Vec::new();
        }
        let len = markets.len();
        let take = self.config.batch_size.clamp(1, len);
        let start = self.cursor.load(Ordering::Relaxed) % len;
        self.cursor.store((start + take) % len, Ordering::Relaxed);
        markets.iter().cycle().skip(start).take(take).collect()
    }

    async fn reconcile_market(
        &self,
        market: &Market,
        report: &mut ReconcileReport,
    ) -> Result<(), MarketError> {
        let asset = market.asset;
        let mut lifecycle = market.lifecycle;

        match (self.source_of_truth, &self.reader) {
            (SourceOfTruth::OnChain, Some(reader)) => {
                let Some(account) = reader.read_curve(&asset).await? else {
                    warn!(asset = %asset, reader = reader.name(), "Curve account not found");
                    return Ok(());
                };
                if account.migrated {
                    match self.controller.find_pool(&asset).await? {
                        Some(pool_id) => {
                            if self.controller.complete_from_external(&asset, &pool_id).await? {
                                report.completed_external += 1;
                            }
                        }
                        None => {
                            report.manual_review += 1;
                            warn!(
                                asset = %asset,
                                "External ledger reports migrated but no pool is known; not migrating again"
                            );
                        }
                    }
                    return Ok(());
                }
                if !account.graduated {
                    if lifecycle != Lifecycle::Active {
                        report.manual_review += 1;
                        warn!(
                            asset = %asset,
                            lifecycle = %lifecycle,
                            "Local market is ahead of the external ledger; migration held"
                        );
                    }
                    return Ok(());
                }
                if lifecycle == Lifecycle::Active {
                    if self.graduate(market).await? {
                        report.graduated += 1;
                    }
                    lifecycle = Lifecycle::Graduated;
                }
            }
            _ => {
                if lifecycle == Lifecycle::Active && market.reserves.real_quote >= self.threshold {
                    if self.graduate(market).await? {
                        report.graduated += 1;
                    }
                    lifecycle = Lifecycle::Graduated;
                }
            }
        }

        if lifecycle != Lifecycle::Graduated {
            return Ok(());
        }
        self.drive_migration(market, report).await
    }

    async fn graduate(&self, market: &Market) -> Result<bool, MarketError> {
        let moved = self
            .store
            .advance_lifecycle(&market.asset, Lifecycle::Active, Lifecycle::Graduated, None)
            .await?;
        if moved {
            info!(
                asset = %market.asset,
                real_quote = market.reserves.real_quote,
                "Corrected drifted lifecycle to GRADUATED"
            );
        }
        Ok(moved)
    }

    async fn drive_migration(
        &self,
        market: &Market,
        report: &mut ReconcileReport,
    ) -> Result<(), MarketError> {
        let asset = market.asset;
        let record = self.store.get_migration(&asset).await?;

        match record.as_ref().map(|r| r.state) {
            None | Some(MigrationState::ReleaseFailed) => {
                match self.controller.migrate(&asset).await? {
                    MigrationOutcome::Migrated { .. } => report.migrated += 1,
                    MigrationOutcome::ReleasedNotPooled { .. }
                    | MigrationOutcome::PoolCreatedUnrecorded { .. } => {
                        report.released_pending += 1
                    }
                    MigrationOutcome::AlreadyMigrated | MigrationOutcome::InProgress(_) => {}
                }
            }
            Some(MigrationState::Released) => {
                // A pool created before a failed bookkeeping write
                if self.controller.find_pool(&asset).await?.is_some() {
                    if let MigrationOutcome::Migrated { .. } =
                        self.controller.retry_pool_creation(&asset).await?
                    {
                        report.healed += 1;
                    }
                } else {
                    report.released_pending += 1;
                    warn!(
                        asset = %asset,
                        last_error = ?record.as_ref().and_then(|r| r.last_error.as_deref()),
                        "Reserves released but no pool; pool creation needs a manual retry"
                    );
                }
            }
            Some(MigrationState::Claimed) => {
                if let Some(record) = &record {
                    let age = Utc::now() - record.updated_at;
                    if age.to_std().unwrap_or_default() > self.config.stale_claim_after {
                        warn!(
                            asset = %asset,
                            age_secs = age.num_seconds(),
                            "Migration claim looks stuck; release outcome unknown"
                        );
                    } else {
                        debug!(asset = %asset, "Migration in progress");
                    }
                }
            }
            Some(MigrationState::Pooled) => {
                if self.controller.heal_lifecycle(&asset).await? {
                    report.healed += 1;
                }
            }
        }
        Ok(())
    }
}
