//! Position Management with Weighted Average Cost Basis
//! Long-only holdings: buys blend the average, sells only reduce quantity

use crate::engine::models::Position;
use crate::engine::pricing::blended_average;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A fill against one (user, stock) holding.
#[derive(Debug, Clone)]
pub struct Fill {
    pub user_id: Uuid,
    pub stock_id: Uuid,
    pub shares: u64,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// What a fill does to the stored position.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionChange {
    Upsert(Position),
    Delete { user_id: Uuid, stock_id: Uuid },
}

pub struct PositionKeeper;

impl PositionKeeper {
    /// Apply a buy fill using weighted average rules
    pub fn apply_buy(current: Option<&Position>, fill: &Fill) -> Position {
        match current {
            Some(pos) => Position {
                shares: pos.shares + fill.shares,
                avg_buy_price: blended_average(
                    pos.avg_buy_price,
                    pos.shares,
                    fill.price,
                    fill.shares,
                ),
                updated_at: fill.executed_at,
                ..pos.clone()
            },
            None => Position {
                user_id: fill.user_id,
                stock_id: fill.stock_id,
                shares: fill.shares,
                avg_buy_price: fill.price,
                updated_at: fill.executed_at,
            },
        }
    }

    /// Apply a sell fill. The caller guarantees `fill.shares <= pos.shares`.
    /// Average cost is left untouched; the position is deleted at zero.
    pub fn apply_sell(pos: &Position, fill: &Fill) -> PositionChange {
        let remaining = pos.shares.saturating_sub(fill.shares);
        if remaining == 0 {
            return PositionChange::Delete {
                user_id: pos.user_id,
                stock_id: pos.stock_id,
            };
        }
        PositionChange::Upsert(Position {
            shares: remaining,
            updated_at: fill.executed_at,
            ..pos.clone()
        })
    }

    /// Mark-to-market value of a holding.
    pub fn market_value(pos: &Position, price: Decimal) -> Decimal {
        Decimal::from(pos.shares) * price
    }

    /// Gain over cost basis at `price`.
    pub fn unrealized_pnl(pos: &Position, price: Decimal) -> Decimal {
        Decimal::from(pos.shares) * (price - pos.avg_buy_price)
    }
}
