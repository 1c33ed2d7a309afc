//! Lifecycle and Migration State Definitions
//!
//! State IDs are stored as SMALLINT. Both machines only move forward; every
//! persisted transition is a compare-and-swap on the expected prior state.
//!
//! ```text
//! Lifecycle:  ACTIVE → GRADUATED → MIGRATED
//!
//! Migration:  CLAIMED → RELEASED → POOLED
//!                ↓
//!          RELEASE_FAILED (reclaimable)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Market lifecycle. Never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum Lifecycle {
    /// Trading on the bonding curve
    Active = 0,

    /// Real quote reserve crossed the threshold; curve trading has ended
    Graduated = 10,

    /// Terminal: reserves live in an external pool
    Migrated = 20,
}

impl Lifecycle {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Lifecycle::Active),
            10 => Some(Lifecycle::Graduated),
            20 => Some(Lifecycle::Migrated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "ACTIVE",
            Lifecycle::Graduated => "GRADUATED",
            Lifecycle::Migrated => "MIGRATED",
        }
    }

    /// Only strictly forward moves are allowed.
    #[inline]
    pub fn can_advance_to(&self, next: Lifecycle) -> bool {
        next > *self
    }

    #[inline]
    pub fn accepts_curve_trades(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of one asset's migration to an external pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum MigrationState {
    /// Claimed by one controller; release not yet confirmed
    Claimed = 0,

    /// Reserves sit in migration custody, pool not yet created.
    /// Only pool creation may be retried from here, never the release.
    Released = 10,

    /// Terminal: pool created and recorded
    Pooled = 20,

    /// Release failed, nothing moved; the next claim may take it over
    ReleaseFailed = -10,
}

impl MigrationState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(MigrationState::Claimed),
            10 => Some(MigrationState::Released),
            20 => Some(MigrationState::Pooled),
            -10 => Some(MigrationState::ReleaseFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Claimed => "CLAIMED",
            MigrationState::Released => "RELEASED",
            MigrationState::Pooled => "POOLED",
            MigrationState::ReleaseFailed => "RELEASE_FAILED",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Pooled)
    }

    /// Reserves have left curve custody
    #[inline]
    pub fn funds_released(&self) -> bool {
        matches!(self, MigrationState::Released | MigrationState::Pooled)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
