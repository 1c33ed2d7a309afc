//! On-chain curve account decoder
//!
//! Fixed little-endian layout of the authoritative curve account:
//!
//! ```text
//! ┌────────────────┬──────────┬────────┐
//! │ discriminator  │ 8 bytes  │ 0      │
//! │ creator        │ 32 bytes │ 8      │
//! │ asset          │ 32 bytes │ 40     │
//! │ virtual_quote  │ u64      │ 72     │
//! │ virtual_asset  │ u64      │ 80     │
//! │ real_quote     │ u64      │ 88     │
//! │ real_asset     │ u64      │ 96     │
//! │ total_supply   │ u64      │ 104    │
//! │ graduated      │ u8       │ 112    │
//! │ migrated       │ u8       │ 113    │
//! │ created_at     │ i64      │ 114    │
//! └────────────────┴──────────┴────────┘
//! ```
//!
//! Accounts may carry trailing padding; only the first [`CURVE_ACCOUNT_LEN`]
//! bytes are read.

use thiserror::Error;

use crate::core_types::{Address, AssetUnits, Lamports, UnixSeconds};
use crate::curve::Reserves;

pub const DISCRIMINATOR_OFFSET: usize = 0;
pub const CREATOR_OFFSET: usize = DISCRIMINATOR_OFFSET + 8;
pub const ASSET_OFFSET: usize = CREATOR_OFFSET + 32;
pub const VIRTUAL_QUOTE_OFFSET: usize = ASSET_OFFSET + 32;
pub const VIRTUAL_ASSET_OFFSET: usize = VIRTUAL_QUOTE_OFFSET + 8;
pub const REAL_QUOTE_OFFSET: usize = VIRTUAL_ASSET_OFFSET + 8;
pub const REAL_ASSET_OFFSET: usize = REAL_QUOTE_OFFSET + 8;
pub const TOTAL_SUPPLY_OFFSET: usize = REAL_ASSET_OFFSET + 8;
pub const GRADUATED_OFFSET: usize = TOTAL_SUPPLY_OFFSET + 8;
pub const MIGRATED_OFFSET: usize = GRADUATED_OFFSET + 1;
pub const CREATED_AT_OFFSET: usize = MIGRATED_OFFSET + 1;
pub const CURVE_ACCOUNT_LEN: usize = CREATED_AT_OFFSET + 8;

const _: () = assert!(GRADUATED_OFFSET == 112);
const _: () = assert!(CURVE_ACCOUNT_LEN == 122);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Account data too short: {actual} bytes, need {expected}")]
    TooShort { expected: usize, actual: usize },

    #[error("Unexpected discriminator {0:?}")]
    Discriminator([u8; 8]),

    #[error("Invalid {field} flag byte {value}")]
    InvalidFlag { field: &'static str, value: u8 },
}

/// Decoded curve account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveAccount {
    pub discriminator: [u8; 8],
    pub creator: Address,
    pub asset: Address,
    pub reserves: Reserves,
    pub total_supply: AssetUnits,
    pub graduated: bool,
    pub migrated: bool,
    pub created_at: UnixSeconds,
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_array(data, offset))
}

fn read_flag(data: &[u8], offset: usize, field: &'static str) -> Result<bool, LayoutError> {
    match data[offset] {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(LayoutError::InvalidFlag { field, value }),
    }
}

impl CurveAccount {
    /// Decode `data`, validating its length before any field is read.
    pub fn decode(data: &[u8]) -> Result<Self, LayoutError> {
        if data.len() < CURVE_ACCOUNT_LEN {
            return Err(LayoutError::TooShort {
                expected: CURVE_ACCOUNT_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            discriminator: read_array(data, DISCRIMINATOR_OFFSET),
            creator: Address::new_from_array(read_array(data, CREATOR_OFFSET)),
            asset: Address::new_from_array(read_array(data, ASSET_OFFSET)),
            reserves: Reserves {
                virtual_quote: read_u64(data, VIRTUAL_QUOTE_OFFSET),
                virtual_asset: read_u64(data, VIRTUAL_ASSET_OFFSET),
                real_quote: read_u64(data, REAL_QUOTE_OFFSET),
                real_asset: read_u64(data, REAL_ASSET_OFFSET),
            },
            total_supply: read_u64(data, TOTAL_SUPPLY_OFFSET),
            graduated: read_flag(data, GRADUATED_OFFSET, "graduated")?,
            migrated: read_flag(data, MIGRATED_OFFSET, "migrated")?,
            created_at: i64::from_le_bytes(read_array(data, CREATED_AT_OFFSET)),
        })
    }

    /// Decode and require a specific discriminator.
    pub fn decode_checked(data: &[u8], expected: &[u8; 8]) -> Result<Self, LayoutError> {
        let account = Self::decode(data)?;
        if &account.discriminator != expected {
            return Err(LayoutError::Discriminator(account.discriminator));
        }
        Ok(account)
    }

    pub fn real_quote(&self) -> Lamports {
        self.reserves.real_quote
    }

    /// Serialize back into the fixed layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CURVE_ACCOUNT_LEN];
        buf[DISCRIMINATOR_OFFSET..CREATOR_OFFSET].copy_from_slice(&self.discriminator);
        buf[CREATOR_OFFSET..ASSET_OFFSET].copy_from_slice(self.creator.as_ref());
        buf[ASSET_OFFSET..VIRTUAL_QUOTE_OFFSET].copy_from_slice(self.asset.as_ref());
        for (offset, value) in [
            (VIRTUAL_QUOTE_OFFSET, self.reserves.virtual_quote),
            (VIRTUAL_ASSET_OFFSET, self.reserves.virtual_asset),
            (REAL_QUOTE_OFFSET, self.reserves.real_quote),
            (REAL_ASSET_OFFSET, self.reserves.real_asset),
            (TOTAL_SUPPLY_OFFSET, self.total_supply),
        ] {
            buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
        buf[GRADUATED_OFFSET] = self.graduated as u8;
        buf[MIGRATED_OFFSET] = self.migrated as u8;
        buf[CREATED_AT_OFFSET..CURVE_ACCOUNT_LEN].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }
}
