//! Core types used throughout the system
//!
//! Amounts never travel as floats. Quote currency is held in lamports and
//! asset units in their raw on-chain base units; both are `u64` so they map
//! one-to-one onto the external curve account layout.

/// Address of a bonding-curve asset (its mint) or of a participant wallet.
pub use solana_pubkey::Pubkey as Address;

/// Quote-currency amount in lamports (10^-9 of the native currency).
///
/// # Range:
/// The graduation threshold sits around 10^11 lamports, so every real
/// reserve fits comfortably in `i64` when persisted as `BIGINT`.
pub type Lamports = u64;

/// Asset amount in raw base units (10^-6 of a whole token).
pub type AssetUnits = u64;

/// Unix timestamp in seconds.
pub type UnixSeconds = i64;

/// External settlement reference (transaction signature).
///
/// Unique across the trade ledger; a second settlement carrying the same
/// reference is rejected as a duplicate.
pub type SettlementRef = String;

/// Decimal places of the quote currency.
pub const QUOTE_DECIMALS: u32 = 9;

/// Decimal places of every curve asset.
pub const ASSET_DECIMALS: u32 = 6;

/// Lamports in one whole unit of the quote currency.
pub const LAMPORTS_PER_QUOTE: u64 = 1_000_000_000;

/// Raw units in one whole asset token.
pub const UNITS_PER_ASSET: u64 = 1_000_000;
