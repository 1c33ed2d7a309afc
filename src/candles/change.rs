//! 24-hour percent change
//!
//! Two paths exist. The snapshot path reads `Market::price_24h_ago_usd`,
//! refreshed on each heartbeat, and is O(1). The history path
//! (`CandleAggregator::percent_change_from_history`) looks up the 1-minute
//! series directly. They can differ by up to one heartbeat interval of
//! price movement.

use rust_decimal::Decimal;

use crate::models::Market;

pub const DAY_SECONDS: i64 = 24 * 60 * 60;

/// `(current − reference) / reference × 100`, or `None` for a zero reference.
pub fn percent_change(reference: Decimal, current: Decimal) -> Option<Decimal> {
    if reference.is_zero() {
        return None;
    }
    (current - reference)
        .checked_div(reference)
        .map(|ratio| ratio * Decimal::ONE_HUNDRED)
}

/// Percent change against the stored 24h reference.
pub fn percent_change_from_snapshot(market: &Market, current_usd: Decimal) -> Option<Decimal> {
    market
        .price_24h_ago_usd
        .and_then(|reference| percent_change(reference, current_usd))
}

/// USD spot price of the market at `rate`.
pub fn current_price_usd(market: &Market, rate: Decimal) -> Option<Decimal> {
    market.last_price.map(|price| price * rate)
}
