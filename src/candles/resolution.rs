//! Candle resolutions and bucket alignment

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::UnixSeconds;

/// Supported candle resolutions, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

/// Every resolution, 1-minute first. The heartbeat relies on this order.
pub const RESOLUTIONS: [Resolution; 5] = [
    Resolution::M1,
    Resolution::M5,
    Resolution::M15,
    Resolution::H1,
    Resolution::D1,
];

impl Resolution {
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::M1 => 60,
            Resolution::M5 => 5 * 60,
            Resolution::M15 => 15 * 60,
            Resolution::H1 => 60 * 60,
            Resolution::D1 => 24 * 60 * 60,
        }
    }

    /// Start of the bucket containing `ts`, aligned to a multiple of the
    /// resolution since the Unix epoch (UTC).
    pub fn bucket_start(&self, ts: UnixSeconds) -> UnixSeconds {
        ts - ts.rem_euclid(self.seconds())
    }

    /// Exclusive end of the bucket starting at `bucket_start`.
    pub fn bucket_end(&self, bucket_start: UnixSeconds) -> UnixSeconds {
        bucket_start + self.seconds()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::M1 => "1m",
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::H1 => "1h",
            Resolution::D1 => "1d",
        }
    }

    pub fn is_finest(&self) -> bool {
        *self == Resolution::M1
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RESOLUTIONS
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown resolution: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_alignment() {
        // 2024-01-01T00:07:30Z
        let ts = 1_704_067_650;
        assert_eq!(Resolution::M1.bucket_start(ts), 1_704_067_620);
        assert_eq!(Resolution::M5.bucket_start(ts), 1_704_067_500);
        assert_eq!(Resolution::M15.bucket_start(ts), 1_704_067_200);
        assert_eq!(Resolution::H1.bucket_start(ts), 1_704_067_200);
        assert_eq!(Resolution::D1.bucket_start(ts), 1_704_067_200);
    }

    #[test]
    fn test_bucket_start_on_boundary_is_identity() {
        for r in RESOLUTIONS {
            let start = r.bucket_start(1_704_067_650);
            assert_eq!(r.bucket_start(start), start);
            assert_eq!(start % r.seconds(), 0);
            assert_eq!(r.bucket_start(r.bucket_end(start) - 1), start);
        }
    }

    #[test]
    fn test_names_round_trip() {
        for r in RESOLUTIONS {
            assert_eq!(r.as_str().parse::<Resolution>(), Ok(r));
        }
        assert!("30m".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_finest_first() {
        assert!(RESOLUTIONS[0].is_finest());
        assert!(RESOLUTIONS.windows(2).all(|w| w[0].seconds() < w[1].seconds()));
    }
}
