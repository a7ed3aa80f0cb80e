//! Post-commit Market Events
//! The engine emits these only after a successful commit; subscribers run
//! award checks and notifications without any path back to the trade result.

pub mod awards;
pub mod dispatcher;

pub use awards::AwardService;
pub use dispatcher::EventDispatcher;

use crate::engine::models::{BuybackOffer, Transaction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type EventSender = mpsc::UnboundedSender<MarketEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MarketEvent>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    TradeExecuted {
        transaction: Transaction,
        stock_created_at: DateTime<Utc>,
        /// Cost basis of the position involved (after a buy, before a sell).
        avg_buy_price: Decimal,
        /// Trades the user had executed before this one.
        prior_trades: usize,
        /// Distinct stocks held after the trade.
        holdings: usize,
    },
    TradeFailed {
        user_id: Uuid,
        stock_id: Uuid,
        operation: &'static str,
        reason: String,
    },
    LiquidityRequested {
        stock_id: Uuid,
        stock_name: String,
        requester: Uuid,
        holders: Vec<Uuid>,
        shares: u64,
        offered_price: Decimal,
    },
    SharesIssued {
        stock_id: Uuid,
        stock_name: String,
        new_shares: u64,
        new_price: Decimal,
        holders: Vec<Uuid>,
    },
    BuybackOffered {
        offer: BuybackOffer,
        stock_name: String,
        recipients: Vec<Uuid>,
    },
    BuybackFilled {
        offer: BuybackOffer,
        seller: Uuid,
        shares: u64,
    },
}

impl MarketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MarketEvent::TradeExecuted { .. } => "trade_executed",
            MarketEvent::TradeFailed { .. } => "trade_failed",
            MarketEvent::LiquidityRequested { .. } => "liquidity_requested",
            MarketEvent::SharesIssued { .. } => "shares_issued",
            MarketEvent::BuybackOffered { .. } => "buyback_offered",
            MarketEvent::BuybackFilled { .. } => "buyback_filled",
        }
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
