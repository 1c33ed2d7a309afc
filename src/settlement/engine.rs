//! Settlement Engine
//!
//! Entry point for one trade. The store commits reserves, the trade row,
//! fee rows and any graduation flip as one unit; everything after the
//! commit (participant stats, candles, migration) is downstream and cannot
//! fail the trade.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::plan::{SettlementContext, validate_request};
use super::stats::spawn_stats_update;
use crate::candles::CandleAggregator;
use crate::config::{CurveConfig, SourceOfTruth};
use crate::error::MarketError;
use crate::graduation::GraduationController;
use crate::models::{Market, NewMarket, SettledTrade, TradeRequest};
use crate::store::LedgerStore;

/// Result of a settlement that was not rejected.
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// Every row is committed
    Committed(SettledTrade),

    /// The trade is final on the external ledger but the local commit
    /// failed. Nothing is retried here; the stats backfill and the
    /// reconciliation watcher bring the store back in line.
    PartialCommit {
        external_ref: String,
        cause: MarketError,
    },
}

impl SettlementOutcome {
    pub fn settled(&self) -> Option<&SettledTrade> {
        match self {
            SettlementOutcome::Committed(settled) => Some(settled),
            SettlementOutcome::PartialCommit { .. } => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, SettlementOutcome::PartialCommit { .. })
    }
}

pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    ctx: SettlementContext,
    source_of_truth: SourceOfTruth,
    candles: Option<Arc<CandleAggregator>>,
    graduation: Option<Arc<GraduationController>>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ctx: SettlementContext,
        source_of_truth: SourceOfTruth,
    ) -> Self {
        Self {
            store,
            ctx,
            source_of_truth,
            candles: None,
            graduation: None,
        }
    }

    /// Fold every committed trade into the candle series.
    pub fn with_candles(mut self, candles: Arc<CandleAggregator>) -> Self {
        self.candles = Some(candles);
        self
    }

    /// Start migration as soon as a trade graduates its market.
    pub fn with_graduation(mut self, graduation: Arc<GraduationController>) -> Self {
        self.graduation = Some(graduation);
        self
    }

    pub fn curve(&self) -> &CurveConfig {
        &self.ctx.curve
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn create_market(&self, new: &NewMarket) -> Result<Market, MarketError> {
        let market = self.store.create_market(new, &self.ctx.curve).await?;
        info!(asset = %market.asset, creator = %market.creator, "Market launched");
        Ok(market)
    }

    /// Settle one trade.
    ///
    /// Rejections (`is_rejection()`) leave the store untouched. A store
    /// failure on a trade the external ledger already confirmed comes back
    /// as [`SettlementOutcome::PartialCommit`] rather than an error.
    pub async fn settle(&self, request: &TradeRequest) -> Result<SettlementOutcome, MarketError> {
        validate_request(request)?;

        let rate = match self.store.quote_price().await {
            Ok(snapshot) => snapshot.map(|s| s.rate_usd),
            Err(e) => {
                warn!(error = %e, "Quote price unavailable; trade recorded without USD rate");
                None
            }
        };

        let settled = match self.store.settle_trade(request, &self.ctx, rate).await {
            Ok(settled) => settled,
            Err(e) if e.is_rejection() => {
                debug!(
                    asset = %request.asset,
                    signature = %request.external_ref,
                    code = e.code(),
                    "Settlement rejected"
                );
                return Err(e);
            }
            Err(e) if self.externally_final(request) => {
                error!(
                    asset = %request.asset,
                    signature = %request.external_ref,
                    error = %e,
                    "Trade final externally but local commit failed"
                );
                return Ok(SettlementOutcome::PartialCommit {
                    external_ref: request.external_ref.clone(),
                    cause: e,
                });
            }
            Err(e) => return Err(e),
        };

        info!(
            asset = %request.asset,
            signature = %request.external_ref,
            direction = %settled.trade.direction,
            quote = settled.trade.quote_amount,
            units = settled.trade.asset_amount,
            trade_id = settled.trade.trade_id,
            "Trade settled"
        );

        self.after_commit(request, &settled).await;
        Ok(SettlementOutcome::Committed(settled))
    }

    fn externally_final(&self, request: &TradeRequest) -> bool {
        request.confirmed_externally || self.source_of_truth == SourceOfTruth::OnChain
    }

    async fn after_commit(&self, request: &TradeRequest, settled: &SettledTrade) {
        spawn_stats_update(self.store.clone(), settled);

        if let Some(candles) = &self.candles {
            if let Err(e) = candles.on_trade(&settled.trade).await {
                warn!(
                    asset = %settled.trade.asset,
                    signature = %settled.trade.external_ref,
                    error = %e,
                    "Candle update failed"
                );
            }
        }

        if settled.graduated_now {
            info!(
                asset = %settled.trade.asset,
                real_quote = settled.reserves.real_quote,
                "Market graduated"
            );
            if let Some(graduation) = &self.graduation {
                let graduation = graduation.clone();
                let asset = request.asset;
                tokio::spawn(async move {
                    if let Err(e) = graduation.migrate(&asset).await {
                        warn!(
                            asset = %asset,
                            error = %e,
                            "Migration after graduation failed; watcher will retry"
                        );
                    }
                });
            }
        }
    }
}
