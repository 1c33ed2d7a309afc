//! Fee calculation utilities
//!
//! All fee rates and shares use 10^6 precision: 10_000 = 1.00%

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::Lamports;

/// Fee rate precision (10^6 = 1,000,000)
pub const FEE_PRECISION: u64 = 1_000_000;

/// Default trade fee rate (10_000 = 1.00%)
pub const DEFAULT_TRADE_FEE: u64 = 10_000;

/// Calculate fee from amount and rate.
///
/// Uses u128 intermediate to prevent overflow.
///
/// # Arguments
/// * `amount` - Amount in lamports
/// * `rate` - Fee rate in 10^6 precision (10_000 = 1.00%)
///
/// # Example
/// ```
/// use curve_market::fee::calculate_fee;
/// // 1 SOL * 1.00% = 10_000_000 lamports
/// assert_eq!(calculate_fee(1_000_000_000, 10_000), 10_000_000);
/// ```
#[inline]
pub fn calculate_fee(amount: Lamports, rate: u64) -> Lamports {
    let fee = (amount as u128 * rate as u128) / FEE_PRECISION as u128;
    // Minimum fee is 1 if amount > 0 and rate > 0
    if fee == 0 && amount > 0 && rate > 0 {
        1
    } else {
        fee as u64
    }
}

/// Stakeholder receiving part of a trade fee.
///
/// IDs are stored as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum FeeRole {
    Protocol = 1,
    Creator = 2,
    Referrer = 3,
}

impl FeeRole {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(FeeRole::Protocol),
            2 => Some(FeeRole::Creator),
            3 => Some(FeeRole::Referrer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeeRole::Protocol => "PROTOCOL",
            FeeRole::Creator => "CREATOR",
            FeeRole::Referrer => "REFERRER",
        }
    }
}

impl fmt::Display for FeeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a trade fee is divided, in 10^6 precision of the fee itself.
///
/// `protocol + creator + referrer` must equal [`FEE_PRECISION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub protocol: u64,
    pub creator: u64,
    pub referrer: u64,
}

impl Default for FeeSplit {
    fn default() -> Self {
        Self {
            protocol: 500_000,
            creator: 300_000,
            referrer: 200_000,
        }
    }
}

impl FeeSplit {
    /// Shares add up to exactly 100%.
    pub fn is_valid(&self) -> bool {
        self.protocol
            .checked_add(self.creator)
            .and_then(|s| s.checked_add(self.referrer))
            == Some(FEE_PRECISION)
    }

    /// Split `total_fee` between stakeholders.
    ///
    /// Without a referrer the referrer share is redistributed half to the
    /// creator and the rest to the protocol. Rounding dust always lands on
    /// the protocol, so the parts sum to exactly `total_fee`. Zero-amount
    /// parts are omitted.
    pub fn split(&self, total_fee: Lamports, has_referrer: bool) -> Vec<(FeeRole, Lamports)> {
        let share = |rate: u64| ((total_fee as u128 * rate as u128) / FEE_PRECISION as u128) as u64;

        let (creator, referrer) = if has_referrer {
            (share(self.creator), share(self.referrer))
        } else {
            (share(self.creator + self.referrer / 2), 0)
        };
        let protocol = total_fee.saturating_sub(creator).saturating_sub(referrer);

        [
            (FeeRole::Protocol, protocol),
            (FeeRole::Creator, creator),
            (FeeRole::Referrer, referrer),
        ]
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .collect()
    }
}
