//! Market Entities
//! Stocks, positions, ledger entries, accounts and buyback offers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =====================================================
// STOCK
// =====================================================

/// A tradable character listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub id: Uuid,
    pub name: String,
    pub total_shares: u64,
    pub available_shares: u64,
    pub current_price: Decimal,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Stock {
    /// Shares currently held by users.
    pub fn held_shares(&self) -> u64 {
        self.total_shares - self.available_shares
    }
}

// =====================================================
// POSITION
// =====================================================

/// Ownership of one stock by one user. Never stored with zero shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub user_id: Uuid,
    pub stock_id: Uuid,
    pub shares: u64,
    pub avg_buy_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// A position marked at the stock's current price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holding {
    #[serde(flatten)]
    pub position: Position,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
}

// =====================================================
// LEDGER
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stock_id: Uuid,
    pub side: Side,
    pub shares: u64,
    pub price_per_share: Decimal,
    pub total_amount: Decimal,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub id: Uuid,
    pub stock_id: Uuid,
    pub price: Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl PricePoint {
    pub fn new(stock_id: Uuid, price: Decimal, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stock_id,
            price,
            recorded_at,
        }
    }
}

// =====================================================
// ACCOUNT
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub username: String,
    pub balance: Decimal,
    pub banned_until: Option<DateTime<Utc>>,
}

impl UserAccount {
    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        matches!(self.banned_until, Some(until) if until > now)
    }
}

// =====================================================
// BUYBACK OFFER
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Active,
    Accepted,
    Declined,
    Expired,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Active => "active",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Declined => "declined",
            OfferStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OfferStatus::Active),
            "accepted" => Ok(OfferStatus::Accepted),
            "declined" => Ok(OfferStatus::Declined),
            "expired" => Ok(OfferStatus::Expired),
            other => Err(format!("unknown offer status: {}", other)),
        }
    }
}

/// Fixed-price tender to repurchase shares from holders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuybackOffer {
    pub id: Uuid,
    pub stock_id: Uuid,
    pub created_by: Uuid,
    pub offered_price: Decimal,
    pub target_users: Option<Vec<Uuid>>,
    pub target_shares: Option<u64>,
    pub accepted_shares: u64,
    pub accepted_by_users: Vec<Uuid>,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BuybackOffer {
    pub fn is_targeted_at(&self, user_id: &Uuid) -> bool {
        match &self.target_users {
            Some(users) => users.contains(user_id),
            None => true,
        }
    }

    /// Shares still open for acceptance, `None` when uncapped.
    pub fn remaining_shares(&self) -> Option<u64> {
        self.target_shares
            .map(|cap| cap.saturating_sub(self.accepted_shares))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// =====================================================
// REQUESTS
// =====================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStock {
    pub name: String,
    pub total_shares: u64,
    pub initial_price: Decimal,
}

fn default_expiry_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuybackRequest {
    pub stock_id: Uuid,
    pub offered_price: Decimal,
    #[serde(default)]
    pub target_users: Option<Vec<Uuid>>,
    #[serde(default = "default_expiry_hours")]
    pub expires_in_hours: u32,
    #[serde(default)]
    pub target_shares: Option<u64>,
}

/// Outcome of accepting a buyback offer.
#[derive(Debug, Clone, Serialize)]
pub struct BuybackFill {
    pub offer: BuybackOffer,
    pub accepted_shares: u64,
    pub transaction: Transaction,
}

// =====================================================
// AWARDS
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardKind {
    FirstTrade,
    EarlyBird,
    HighRoller,
    Diversified,
    ProfitTaker,
    DilutionSurvivor,
}

impl AwardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwardKind::FirstTrade => "first_trade",
            AwardKind::EarlyBird => "early_bird",
            AwardKind::HighRoller => "high_roller",
            AwardKind::Diversified => "diversified",
            AwardKind::ProfitTaker => "profit_taker",
            AwardKind::DilutionSurvivor => "dilution_survivor",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AwardKind::FirstTrade => "First Trade",
            AwardKind::EarlyBird => "Early Bird",
            AwardKind::HighRoller => "High Roller",
            AwardKind::Diversified => "Diversified",
            AwardKind::ProfitTaker => "Profit Taker",
            AwardKind::DilutionSurvivor => "Dilution Survivor",
        }
    }
}

impl std::str::FromStr for AwardKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_trade" => Ok(AwardKind::FirstTrade),
            "early_bird" => Ok(AwardKind::EarlyBird),
            "high_roller" => Ok(AwardKind::HighRoller),
            "diversified" => Ok(AwardKind::Diversified),
            "profit_taker" => Ok(AwardKind::ProfitTaker),
            "dilution_survivor" => Ok(AwardKind::DilutionSurvivor),
            other => Err(format!("unknown award: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Award {
    pub user_id: Uuid,
    pub kind: AwardKind,
    pub granted_at: DateTime<Utc>,
}
