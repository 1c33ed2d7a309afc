//! Constant-Product Bonding Curve
//!
//! Pure pricing functions. No I/O, no clocks, no shared state.
//!
//! ```text
//! k = virtual_quote × virtual_asset
//!
//! buy:  quote_after_fee = quote_in − fee(quote_in)
//!       virtual_quote'  = virtual_quote + quote_after_fee
//!       virtual_asset'  = ⌈k / virtual_quote'⌉
//!       asset_out       = virtual_asset − virtual_asset'
//!
//! sell: virtual_asset'  = virtual_asset + asset_in
//!       virtual_quote'  = ⌈k / virtual_asset'⌉
//!       gross           = min(virtual_quote − virtual_quote', real_quote)
//!       quote_out       = gross − fee(gross)
//! ```
//!
//! Every division rounds in the curve's favour, so `k` never shrinks and a
//! buy followed by an immediate sell never returns more than was paid.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{AssetUnits, Lamports};
use crate::fee::calculate_fee;
use crate::money::unit_price;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CurveError {
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Amount too small to move the curve: {0}")]
    DustAmount(String),

    #[error("Curve reserves are empty")]
    EmptyReserves,

    #[error("Arithmetic overflow")]
    Overflow,
}

/// Reserve state of one market's curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserves {
    pub virtual_quote: Lamports,
    pub virtual_asset: AssetUnits,
    pub real_quote: Lamports,
    pub real_asset: AssetUnits,
}

impl Reserves {
    #[inline]
    pub fn invariant(&self) -> u128 {
        self.virtual_quote as u128 * self.virtual_asset as u128
    }

    /// Marginal price in whole quote units per whole token.
    pub fn spot_price(&self) -> Decimal {
        unit_price(self.virtual_quote, self.virtual_asset)
    }

    fn ensure_live(&self) -> Result<(), CurveError> {
        if self.virtual_quote == 0 || self.virtual_asset == 0 {
            return Err(CurveError::EmptyReserves);
        }
        Ok(())
    }
}

/// Whether a sell was filled in full or capped at the real quote reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fill {
    Full,
    Partial {
        requested: AssetUnits,
        filled: AssetUnits,
    },
}

impl Fill {
    pub fn is_partial(&self) -> bool {
        matches!(self, Fill::Partial { .. })
    }
}

/// Result of pricing a buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyQuote {
    pub quote_in: Lamports,
    pub fee: Lamports,
    pub quote_after_fee: Lamports,
    pub asset_out: AssetUnits,
    pub new_virtual_quote: Lamports,
    pub new_virtual_asset: AssetUnits,
    /// `(execution price − spot) / spot`
    pub price_impact: Decimal,
}

/// Result of pricing a sell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellQuote {
    /// Asset units actually consumed (less than requested on a partial fill)
    pub asset_in: AssetUnits,
    pub quote_out_gross: Lamports,
    pub fee: Lamports,
    pub quote_out: Lamports,
    pub new_virtual_quote: Lamports,
    pub new_virtual_asset: AssetUnits,
    /// `(spot − execution price) / spot`
    pub price_impact: Decimal,
    pub fill: Fill,
}

#[inline]
fn div_ceil(numerator: u128, denominator: u128) -> u128 {
    numerator.div_ceil(denominator)
}

fn impact(execution: Decimal, spot: Decimal) -> Decimal {
    if spot.is_zero() {
        return Decimal::ZERO;
    }
    (execution - spot).checked_div(spot).unwrap_or(Decimal::ZERO)
}

/// Price a buy of `quote_in` lamports.
///
/// Does not look at real reserves: whether the curve actually holds
/// `asset_out` units is a settlement concern.
pub fn quote_buy(
    quote_in: Lamports,
    reserves: &Reserves,
    fee_rate: u64,
) -> Result<BuyQuote, CurveError> {
    if quote_in == 0 {
        return Err(CurveError::ZeroAmount);
    }
    reserves.ensure_live()?;

    let fee = calculate_fee(quote_in, fee_rate);
    let quote_after_fee = quote_in.checked_sub(fee).ok_or(CurveError::Overflow)?;
    if quote_after_fee == 0 {
        return Err(CurveError::DustAmount(format!(
            "{} lamports is consumed entirely by the fee",
            quote_in
        )));
    }

    let k = reserves.invariant();
    let new_virtual_quote = reserves
        .virtual_quote
        .checked_add(quote_after_fee)
        .ok_or(CurveError::Overflow)?;
    let new_virtual_asset = div_ceil(k, new_virtual_quote as u128) as u64;
    let asset_out = reserves.virtual_asset - new_virtual_asset;
    if asset_out == 0 {
        return Err(CurveError::DustAmount(format!(
            "{} lamports buys zero asset units",
            quote_in
        )));
    }

    let execution = unit_price(quote_after_fee, asset_out);
    Ok(BuyQuote {
        quote_in,
        fee,
        quote_after_fee,
        asset_out,
        new_virtual_quote,
        new_virtual_asset,
        price_impact: impact(execution, reserves.spot_price()),
    })
}

/// Price a sell of `asset_in` units.
///
/// The gross payout is capped at `reserves.real_quote`; a capped quote
/// consumes only the asset units needed to release that much and reports
/// [`Fill::Partial`].
pub fn quote_sell(
    asset_in: AssetUnits,
    reserves: &Reserves,
    fee_rate: u64,
) -> Result<SellQuote, CurveError> {
    if asset_in == 0 {
        return Err(CurveError::ZeroAmount);
    }
    reserves.ensure_live()?;

    let k = reserves.invariant();
    let new_virtual_asset = reserves
        .virtual_asset
        .checked_add(asset_in)
        .ok_or(CurveError::Overflow)?;
    let new_virtual_quote = div_ceil(k, new_virtual_asset as u128) as u64;
    let uncapped_gross = reserves.virtual_quote - new_virtual_quote;
    if uncapped_gross == 0 {
        return Err(CurveError::DustAmount(format!(
            "{} asset units release zero lamports",
            asset_in
        )));
    }

    let (asset_used, gross, new_virtual_quote, new_virtual_asset, fill) =
        if uncapped_gross > reserves.real_quote {
            let gross = reserves.real_quote;
            let capped_quote = reserves.virtual_quote - gross;
            if capped_quote == 0 {
                return Err(CurveError::EmptyReserves);
            }
            let capped_asset = div_ceil(k, capped_quote as u128);
            let capped_asset = u64::try_from(capped_asset).map_err(|_| CurveError::Overflow)?;
            let asset_used = capped_asset
                .saturating_sub(reserves.virtual_asset)
                .min(asset_in);
            (
                asset_used,
                gross,
                capped_quote,
                reserves.virtual_asset + asset_used,
                Fill::Partial {
                    requested: asset_in,
                    filled: asset_used,
                },
            )
        } else {
            (asset_in, uncapped_gross, new_virtual_quote, new_virtual_asset, Fill::Full)
        };

    let fee = calculate_fee(gross, fee_rate);
    let quote_out = gross - fee;

    let spot = reserves.spot_price();
    let execution = unit_price(gross, asset_used);
    Ok(SellQuote {
        asset_in: asset_used,
        quote_out_gross: gross,
        fee,
        quote_out,
        new_virtual_quote,
        new_virtual_asset,
        price_impact: -impact(execution, spot),
        fill,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_SOL: u64 = 1_000_000_000;

    fn launch_reserves() -> Reserves {
        Reserves {
            virtual_quote: 30 * ONE_SOL,
            virtual_asset: 1_073_000_000_000_000,
            real_quote: 0,
            real_asset: 793_100_000_000_000,
        }
    }

    #[test]
    fn test_buy_one_sol_at_launch() {
        let quote = quote_buy(ONE_SOL, &launch_reserves(), 10_000).unwrap();
        assert_eq!(quote.fee, 10_000_000);
        assert_eq!(quote.quote_after_fee, 990_000_000);
        assert_eq!(quote.new_virtual_quote, 30_990_000_000);
        assert_eq!(quote.new_virtual_asset, 1_038_722_168_441_433);
        assert_eq!(quote.asset_out, 34_277_831_558_567);
        // Average execution price is always worse than spot on a buy
        assert!(quote.price_impact > Decimal::ZERO);
    }

    #[test]
    fn test_buy_preserves_invariant_within_rounding() {
        let reserves = launch_reserves();
        let quote = quote_buy(3 * ONE_SOL, &reserves, 10_000).unwrap();
        let before = reserves.invariant();
        let after = quote.new_virtual_quote as u128 * quote.new_virtual_asset as u128;
        assert!(after >= before);
        assert!(after - before < quote.new_virtual_quote as u128);
    }

    #[test]
    fn test_sell_preserves_invariant_within_rounding() {
        let mut reserves = launch_reserves();
        reserves.real_quote = 50 * ONE_SOL;
        let quote = quote_sell(10_000_000_000_000, &reserves, 10_000).unwrap();
        let before = reserves.invariant();
        let after = quote.new_virtual_quote as u128 * quote.new_virtual_asset as u128;
        assert!(after >= before);
        assert!(after - before < quote.new_virtual_asset as u128);
        assert_eq!(quote.fill, Fill::Full);
    }

    #[test]
    fn test_round_trip_never_profits() {
        for fee_rate in [0u64, 2_500, 10_000] {
            for quote_in in [1_000u64, 12_345_678, ONE_SOL, 17 * ONE_SOL] {
                let reserves = launch_reserves();
                let buy = quote_buy(quote_in, &reserves, fee_rate).unwrap();
                let after_buy = Reserves {
                    virtual_quote: buy.new_virtual_quote,
                    virtual_asset: buy.new_virtual_asset,
                    real_quote: reserves.real_quote + buy.quote_after_fee,
                    real_asset: reserves.real_asset - buy.asset_out,
                };
                let sell = quote_sell(buy.asset_out, &after_buy, fee_rate).unwrap();
                assert!(
                    sell.quote_out <= quote_in,
                    "fee {} quote_in {}: got back {}",
                    fee_rate,
                    quote_in,
                    sell.quote_out
                );
                if fee_rate > 0 {
                    assert!(sell.quote_out < quote_in);
                }
            }
        }
    }

    #[test]
    fn test_sell_capped_at_real_quote() {
        let mut reserves = launch_reserves();
        reserves.real_quote = ONE_SOL;
        // Selling 100M tokens would release far more than 1 SOL
        let quote = quote_sell(100_000_000_000_000, &reserves, 10_000).unwrap();
        assert_eq!(quote.quote_out_gross, ONE_SOL);
        assert_eq!(quote.new_virtual_quote, 29 * ONE_SOL);
        match quote.fill {
            Fill::Partial { requested, filled } => {
                assert_eq!(requested, 100_000_000_000_000);
                assert_eq!(filled, quote.asset_in);
                assert!(filled < requested);
            }
            Fill::Full => panic!("expected a partial fill"),
        }
        // The consumed units still respect the invariant
        let after = quote.new_virtual_quote as u128 * quote.new_virtual_asset as u128;
        assert!(after >= reserves.invariant());
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let reserves = launch_reserves();
        assert_eq!(quote_buy(0, &reserves, 10_000), Err(CurveError::ZeroAmount));
        assert_eq!(quote_sell(0, &reserves, 10_000), Err(CurveError::ZeroAmount));
    }

    #[test]
    fn test_fee_swallowing_dust_rejected() {
        // 1 lamport pays the 1 lamport minimum fee
        assert!(matches!(
            quote_buy(1, &launch_reserves(), 10_000),
            Err(CurveError::DustAmount(_))
        ));
    }

    #[test]
    fn test_empty_reserves_rejected() {
        let reserves = Reserves {
            virtual_quote: 0,
            virtual_asset: 1,
            real_quote: 0,
            real_asset: 0,
        };
        assert_eq!(quote_buy(ONE_SOL, &reserves, 0), Err(CurveError::EmptyReserves));
    }

    #[test]
    fn test_spot_price_rises_after_buy() {
        let reserves = launch_reserves();
        let buy = quote_buy(5 * ONE_SOL, &reserves, 10_000).unwrap();
        let after = Reserves {
            virtual_quote: buy.new_virtual_quote,
            virtual_asset: buy.new_virtual_asset,
            ..reserves
        };
        assert!(after.spot_price() > reserves.spot_price());
    }
}
