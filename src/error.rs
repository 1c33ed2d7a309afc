//! Market Error Types
//!
//! One taxonomy for every fallible entry point. Rejections happen before any
//! state mutation; I/O failures carry the asset and operation they hit.

use thiserror::Error;

use crate::core_types::Address;
use crate::curve::CurveError;
use crate::graduation::state::Lifecycle;

#[derive(Error, Debug, Clone)]
pub enum MarketError {
    // === Rejections (no mutation) ===
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Market not found: {0}")]
    NotFound(Address),

    #[error("Market {asset} is {lifecycle}; curve trading has ended")]
    AlreadyGraduated { asset: Address, lifecycle: Lifecycle },

    #[error("Settlement {0} was already recorded")]
    DuplicateSettlement(String),

    #[error("Insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: u64, available: u64 },

    #[error("Slippage exceeded: output {actual} below minimum {minimum}")]
    SlippageExceeded { minimum: u64, actual: u64 },

    // === Collaborator / system failures ===
    #[error("External service {service} failed: {reason}")]
    ExternalService {
        service: &'static str,
        reason: String,
    },

    #[error("Invalid state for {operation} on {asset}: {reason}")]
    InvalidState {
        asset: Address,
        operation: &'static str,
        reason: String,
    },

    #[error("Store error during {operation}: {reason}")]
    Store {
        operation: &'static str,
        reason: String,
    },
}

impl MarketError {
    pub fn store(operation: &'static str, err: impl std::fmt::Display) -> Self {
        MarketError::Store {
            operation,
            reason: err.to_string(),
        }
    }

    pub fn external(service: &'static str, err: impl std::fmt::Display) -> Self {
        MarketError::ExternalService {
            service,
            reason: err.to_string(),
        }
    }

    /// Stable error code for API responses and log queries
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::InvalidInput(_) => "INVALID_INPUT",
            MarketError::NotFound(_) => "NOT_FOUND",
            MarketError::AlreadyGraduated { .. } => "ALREADY_GRADUATED",
            MarketError::DuplicateSettlement(_) => "DUPLICATE_SETTLEMENT",
            MarketError::InsufficientLiquidity { .. } => "INSUFFICIENT_LIQUIDITY",
            MarketError::SlippageExceeded { .. } => "SLIPPAGE_EXCEEDED",
            MarketError::ExternalService { .. } => "EXTERNAL_SERVICE_FAILURE",
            MarketError::InvalidState { .. } => "INVALID_STATE",
            MarketError::Store { .. } => "STORE_FAILURE",
        }
    }

    /// The request was rejected outright and nothing changed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MarketError::InvalidInput(_)
                | MarketError::NotFound(_)
                | MarketError::AlreadyGraduated { .. }
                | MarketError::DuplicateSettlement(_)
                | MarketError::InsufficientLiquidity { .. }
                | MarketError::SlippageExceeded { .. }
        )
    }

    /// Worth another attempt on the next scheduled run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::ExternalService { .. } | MarketError::Store { .. }
        )
    }

    /// Message suitable for end users.
    pub fn user_message(&self) -> String {
        match self {
            MarketError::InvalidInput(reason) => format!("Request rejected: {}", reason),
            MarketError::NotFound(asset) => format!("Unknown asset {}", asset),
            MarketError::AlreadyGraduated { .. } => {
                "This token has graduated; trade it on its pool instead".to_string()
            }
            MarketError::DuplicateSettlement(_) => {
                "This transaction has already been processed".to_string()
            }
            MarketError::InsufficientLiquidity { .. } => {
                "Not enough liquidity on the curve; try a smaller amount".to_string()
            }
            MarketError::SlippageExceeded { .. } => {
                "Price moved beyond your slippage tolerance".to_string()
            }
            MarketError::ExternalService { .. }
            | MarketError::InvalidState { .. }
            | MarketError::Store { .. } => "Accepted, confirming".to_string(),
        }
    }
}

impl From<CurveError> for MarketError {
    fn from(err: CurveError) -> Self {
        MarketError::InvalidInput(err.to_string())
    }
}

impl From<sqlx::Error> for MarketError {
    fn from(err: sqlx::Error) -> Self {
        MarketError::store("database", err)
    }
}
