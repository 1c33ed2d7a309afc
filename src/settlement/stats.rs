//! Participant statistics
//!
//! Updated best-effort after each commit and rebuilt from the ledger by
//! [`backfill_participant_stats`], which is what heals a partial commit or a
//! dropped update.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MarketError;
use crate::models::{
    FeeDistribution, MarketFilter, ParticipantStats, SettledTrade, StatsDelta, Trade,
};
use crate::store::LedgerStore;

/// Per-participant increments produced by one settled trade.
pub fn deltas_for(settled: &SettledTrade) -> Vec<(String, StatsDelta)> {
    let mut deltas = vec![(
        settled.trade.trader.clone(),
        StatsDelta {
            volume_quote: settled.trade.quote_amount,
            trade_count: 1,
            ..Default::default()
        },
    )];
    for fee in &settled.fees {
        deltas.push((
            fee.recipient.clone(),
            StatsDelta {
                fees_earned: fee.amount,
                ..Default::default()
            },
        ));
    }
    deltas
}

/// Apply a settled trade's deltas on a detached task. Failures are logged
/// and dropped.
pub fn spawn_stats_update(store: Arc<dyn LedgerStore>, settled: &SettledTrade) {
    let deltas = deltas_for(settled);
    let signature = settled.trade.external_ref.clone();
    tokio::spawn(async move {
        for (participant, delta) in deltas {
            if let Err(e) = store.apply_stats_delta(&participant, &delta).await {
                warn!(
                    participant = %participant,
                    signature = %signature,
                    error = %e,
                    "Participant stats update failed; backfill will repair"
                );
            }
        }
    });
}

fn entry<'a>(
    stats: &'a mut HashMap<String, ParticipantStats>,
    participant: &str,
) -> &'a mut ParticipantStats {
    stats
        .entry(participant.to_string())
        .or_insert_with(|| ParticipantStats {
            participant: participant.to_string(),
            ..Default::default()
        })
}

/// Aggregate stats from ledger rows.
pub fn aggregate(
    trades: &[Trade],
    fees: &[FeeDistribution],
    creators: &[String],
) -> Vec<ParticipantStats> {
    let mut stats: HashMap<String, ParticipantStats> = HashMap::new();
    for trade in trades {
        let s = entry(&mut stats, &trade.trader);
        s.volume_quote += trade.quote_amount;
        s.trade_count += 1;
    }
    for fee in fees {
        entry(&mut stats, &fee.recipient).fees_earned += fee.amount;
    }
    for creator in creators {
        entry(&mut stats, creator).assets_created += 1;
    }
    let mut rows: Vec<ParticipantStats> = stats.into_values().collect();
    rows.sort_by(|a, b| a.participant.cmp(&b.participant));
    rows
}

/// Recompute every participant's aggregates from the Trade, FeeDistribution
/// and Market tables and replace the stored values. Returns the number of
/// participants written.
pub async fn backfill_participant_stats(store: &dyn LedgerStore) -> Result<usize, MarketError> {
    let trades = store.all_trades().await?;
    let fees = store.all_fee_distributions().await?;
    let creators: Vec<String> = store
        .list_markets(MarketFilter::All)
        .await?
        .iter()
        .map(|m| m.creator.to_string())
        .collect();

    let rows = aggregate(&trades, &fees, &creators);
    store.replace_participant_stats(&rows).await?;

    info!(
        participants = rows.len(),
        trades = trades.len(),
        "Participant stats rebuilt from ledger"
    );
    Ok(rows.len())
}
