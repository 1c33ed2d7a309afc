//! Money Conversion Module
//!
//! Conversion between the internal `u64` representation (lamports, raw asset
//! units) and `Decimal` values used for prices, candles and USD figures.
//!
//! ## Internal Representation
//! - Reserves and trade amounts are `u64` scaled by `10^decimals`
//! - Prices are `Decimal` in whole quote units per whole asset token
//! - USD values are `Decimal` (price × quote/USD exchange rate)

use rust_decimal::prelude::*;
use thiserror::Error;

use crate::core_types::{ASSET_DECIMALS, AssetUnits, Lamports, QUOTE_DECIMALS};

/// Money conversion errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,
}

/// Scale a raw integer amount down to a `Decimal` of whole units.
///
/// ```
/// use curve_market::money::to_decimal;
/// use rust_decimal::Decimal;
/// assert_eq!(to_decimal(1_500_000_000, 9), Decimal::new(15, 1));
/// ```
pub fn to_decimal(value: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(value as i128, decimals).normalize()
}

/// Convert a positive `Decimal` of whole units into its raw `u64` form.
///
/// Rejects values carrying more fractional digits than `decimals` instead of
/// truncating them silently.
pub fn parse_decimal(decimal: Decimal, decimals: u32) -> Result<u64, MoneyError> {
    if decimal.is_sign_negative() || decimal.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = decimal.normalize();
    if normalized.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: decimals,
        });
    }

    let multiplier = Decimal::from(10u64.pow(decimals));
    normalized
        .checked_mul(multiplier)
        .and_then(|v| v.to_u64())
        .ok_or(MoneyError::Overflow)
}

/// Lamports as whole quote units.
#[inline]
pub fn lamports_to_quote(lamports: Lamports) -> Decimal {
    to_decimal(lamports, QUOTE_DECIMALS)
}

/// Raw asset units as whole tokens.
#[inline]
pub fn units_to_tokens(units: AssetUnits) -> Decimal {
    to_decimal(units, ASSET_DECIMALS)
}

/// Price in whole quote units per whole token for an exchange of
/// `lamports` against `units`. Returns zero when `units` is zero.
pub fn unit_price(lamports: Lamports, units: AssetUnits) -> Decimal {
    if units == 0 {
        return Decimal::ZERO;
    }
    lamports_to_quote(lamports)
        .checked_div(units_to_tokens(units))
        .unwrap_or(Decimal::ZERO)
}

/// Format a raw amount for logs and messages.
pub fn format_amount(value: u64, decimals: u32, display_decimals: u32) -> String {
    let decimal_value = to_decimal(value, decimals);
    format!("{:.prec$}", decimal_value, prec = display_decimals as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_to_decimal_scales_down() {
        assert_eq!(to_decimal(1, 9), Decimal::from_str("0.000000001").unwrap());
        assert_eq!(lamports_to_quote(30_000_000_000), Decimal::from(30));
        assert_eq!(units_to_tokens(1_000_000), Decimal::ONE);
    }

    #[test]
    fn test_parse_decimal_rejects_excess_precision() {
        let d = Decimal::from_str("1.0000000001").unwrap();
        assert_eq!(
            parse_decimal(d, 9),
            Err(MoneyError::PrecisionOverflow {
                provided: 10,
                max: 9
            })
        );
        // Trailing zeros do not count as precision
        let d = Decimal::from_str("1.500000000000").unwrap();
        assert_eq!(parse_decimal(d, 9).unwrap(), 1_500_000_000);
    }

    #[test]
    fn test_parse_decimal_rejects_non_positive() {
        assert_eq!(parse_decimal(Decimal::ZERO, 9), Err(MoneyError::InvalidAmount));
        assert_eq!(
            parse_decimal(Decimal::from(-1), 9),
            Err(MoneyError::InvalidAmount)
        );
    }

    #[test]
    fn test_unit_price() {
        // 30 quote against 1,073,000,000 tokens
        let price = unit_price(30_000_000_000, 1_073_000_000_000_000);
        let expected = Decimal::from(30) / Decimal::from(1_073_000_000u64);
        assert_eq!(price, expected);
        assert_eq!(unit_price(1, 0), Decimal::ZERO);
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1_990_000_000, 9, 2), "1.99");
        assert_eq!(format_amount(1, 6, 6), "0.000001");
    }
}
