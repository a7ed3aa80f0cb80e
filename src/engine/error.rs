use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Share count must be positive")]
    InvalidQuantity,
    #[error("Invalid price: {0}")]
    InvalidPrice(String),
    #[error("Stock not found: {0}")]
    StockNotFound(Uuid),
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),
    #[error("Account is banned")]
    UserBanned,
    #[error("Only {available} shares available, {requested} requested")]
    InsufficientLiquidity { available: u64, requested: u64 },
    #[error("Holding {held} shares, {requested} requested")]
    InsufficientShares { held: u64, requested: u64 },
    #[error("Balance {balance} does not cover {required}")]
    InsufficientFunds {
        balance: rust_decimal::Decimal,
        required: rust_decimal::Decimal,
    },
    #[error("No position in stock {0}")]
    PositionNotFound(Uuid),
    #[error("Offer not found: {0}")]
    OfferNotFound(Uuid),
    #[error("Offer is {0}")]
    OfferNotActive(&'static str),
    #[error("Offer expired")]
    OfferExpired,
    #[error("Offer is not open to this account")]
    NotTargeted,
    #[error("Offer has no shares left to fill")]
    OfferFilled,
    #[error("Returning {returned} shares would exceed total supply")]
    FloatOverflow { returned: u64 },
    #[error("Amount out of range: {0}")]
    OutOfRange(&'static str),
    #[error("Insufficient permissions: {0}")]
    Unauthorized(String),
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl TradeError {
    /// Rejected before any state was touched.
    pub fn is_validation(&self) -> bool {
        !matches!(self, TradeError::Persistence(_) | TradeError::Unauthorized(_))
    }

    /// Short machine-readable code for metrics and replies.
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::InvalidQuantity => "invalid_quantity",
            TradeError::InvalidPrice(_) => "invalid_price",
            TradeError::StockNotFound(_) => "stock_not_found",
            TradeError::AccountNotFound(_) => "account_not_found",
            TradeError::UserBanned => "user_banned",
            TradeError::InsufficientLiquidity { .. } => "insufficient_liquidity",
            TradeError::InsufficientShares { .. } => "insufficient_shares",
            TradeError::InsufficientFunds { .. } => "insufficient_funds",
            TradeError::PositionNotFound(_) => "position_not_found",
            TradeError::OfferNotFound(_) => "offer_not_found",
            TradeError::OfferNotActive(_) => "offer_not_active",
            TradeError::OfferExpired => "offer_expired",
            TradeError::NotTargeted => "not_targeted",
            TradeError::OfferFilled => "offer_filled",
            TradeError::FloatOverflow { .. } => "float_overflow",
            TradeError::OutOfRange(_) => "out_of_range",
            TradeError::Unauthorized(_) => "unauthorized",
            TradeError::Persistence(_) => "persistence",
        }
    }
}
