//! Price Impact and Dilution Model
//! Liquidity-scaled impact without an order book

use crate::engine::models::Stock;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

pub const MIN_PRICE: Decimal = dec!(0.01);
/// Price ceiling. Any price times `MAX_SHARES` stays inside `Decimal` range.
pub const MAX_PRICE: Decimal = dec!(1000000000);
/// Largest share count a stock, position or offer may carry.
pub const MAX_SHARES: u64 = i64::MAX as u64;
pub const MIN_LIQUIDITY_FACTOR: Decimal = dec!(0.05);
pub const MAX_LIQUIDITY_FACTOR: Decimal = dec!(0.5);
pub const IMPACT_SCALE: Decimal = dec!(0.5);

/// Round to cents, half away from zero.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to cents and hold the result inside `[MIN_PRICE, MAX_PRICE]`.
pub fn bounded(value: Decimal) -> Decimal {
    round2(value).clamp(MIN_PRICE, MAX_PRICE)
}

/// `price * shares`, or `None` when the amount leaves `Decimal` range.
pub fn notional(price: Decimal, shares: u64) -> Option<Decimal> {
    price.checked_mul(Decimal::from(shares))
}

/// Trade size relative to total supply, clamped to [0.05, 0.5].
pub fn liquidity_factor(total_shares: u64, shares: u64) -> Decimal {
    if total_shares == 0 {
        return MAX_LIQUIDITY_FACTOR;
    }
    let ratio = Decimal::from(shares) / Decimal::from(total_shares);
    ratio.clamp(MIN_LIQUIDITY_FACTOR, MAX_LIQUIDITY_FACTOR)
}

/// Price after a trade of `shares_delta` shares (negative for sells).
///
/// The factor is computed on the absolute trade size and the sign applied
/// afterwards, so a sell moves the price down by the same magnitude a buy of
/// equal size moves it up. One trade moves price by at most 25%.
pub fn apply_price_impact(stock: &Stock, shares_delta: i64) -> Decimal {
    let factor = liquidity_factor(stock.total_shares, shares_delta.unsigned_abs());
    let impact = if shares_delta < 0 {
        -factor * IMPACT_SCALE
    } else {
        factor * IMPACT_SCALE
    };
    stock
        .current_price
        .checked_mul(Decimal::ONE + impact)
        .map_or(MAX_PRICE, bounded)
}

/// Price after issuing `new_shares` on top of the current supply.
pub fn diluted_price(stock: &Stock, new_shares: u64) -> Decimal {
    if stock.total_shares == 0 {
        return stock.current_price;
    }
    let dilution = Decimal::from(new_shares) / Decimal::from(stock.total_shares);
    bounded(stock.current_price / (Decimal::ONE + dilution))
}

/// Price after a market-wide percentage adjustment. Saturates at `MAX_PRICE`.
pub fn inflated_price(price: Decimal, percentage: Decimal) -> Decimal {
    (Decimal::ONE + percentage / dec!(100))
        .checked_mul(price)
        .map_or(MAX_PRICE, bounded)
}

/// Shares-weighted blend of an existing cost basis with a new purchase.
pub fn blended_average(
    old_avg: Decimal,
    old_shares: u64,
    price: Decimal,
    new_shares: u64,
) -> Decimal {
    let total = Decimal::from(old_shares) + Decimal::from(new_shares);
    if total.is_zero() {
        return Decimal::ZERO;
    }
    (old_avg * Decimal::from(old_shares) + price * Decimal::from(new_shares)) / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn stock(total: u64, price: Decimal) -> Stock {
        Stock {
            id: Uuid::new_v4(),
            name: "Spike Spiegel".to_string(),
            total_shares: total,
            available_shares: total,
            current_price: price,
            creator_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_small_buy_uses_minimum_factor() {
        let s = stock(1000, dec!(10.00));
        assert_eq!(liquidity_factor(1000, 10), dec!(0.05));
        assert_eq!(apply_price_impact(&s, 10), dec!(10.25));
    }

    #[test]
    fn test_full_float_trade_moves_price_by_quarter() {
        let s = stock(1000, dec!(10.00));
        assert_eq!(apply_price_impact(&s, 1000), dec!(12.50));
        assert_eq!(apply_price_impact(&s, -1000), dec!(7.50));
    }

    #[test]
    fn test_factor_clamps_above_half() {
        assert_eq!(liquidity_factor(100, 500), dec!(0.5));
    }

    #[test]
    fn test_sell_is_symmetric_to_buy() {
        let s = stock(1000, dec!(20.00));
        assert_eq!(apply_price_impact(&s, -10), dec!(19.50));
        assert_eq!(apply_price_impact(&s, -200), dec!(18.00));
    }

    #[test]
    fn test_price_never_below_floor() {
        let mut s = stock(10, dec!(0.01));
        for _ in 0..20 {
            s.current_price = apply_price_impact(&s, -10);
            assert!(s.current_price >= MIN_PRICE);
        }
        assert_eq!(s.current_price, MIN_PRICE);
    }

    #[test]
    fn test_dilution_doubling_halves_price() {
        let s = stock(1000, dec!(10.00));
        assert_eq!(diluted_price(&s, 1000), dec!(5.00));
    }

    #[test]
    fn test_blended_average() {
        assert_eq!(blended_average(dec!(5), 10, dec!(7), 10), dec!(6));
        assert_eq!(blended_average(Decimal::ZERO, 0, dec!(9.5), 3), dec!(9.5));
    }

    #[test]
    fn test_inflated_price_rounds_to_cents() {
        assert_eq!(inflated_price(dec!(10.00), dec!(10)), dec!(11.00));
        assert_eq!(inflated_price(dec!(3.33), dec!(5)), dec!(3.50));
        assert_eq!(inflated_price(dec!(0.01), dec!(-90)), MIN_PRICE);
    }

    #[test]
    fn test_prices_saturate_at_ceiling() {
        assert_eq!(inflated_price(MAX_PRICE, dec!(50)), MAX_PRICE);
        assert_eq!(inflated_price(dec!(500), Decimal::MAX), MAX_PRICE);

        let s = stock(1000, MAX_PRICE);
        assert_eq!(apply_price_impact(&s, 1000), MAX_PRICE);
        assert_eq!(apply_price_impact(&s, -1000), dec!(750000000));
    }

    #[test]
    fn test_notional_at_limits_fits_decimal() {
        assert!(notional(MAX_PRICE, MAX_SHARES).is_some());
        assert_eq!(notional(Decimal::MAX, 2), None);
        assert_eq!(notional(dec!(12.5), 4), Some(dec!(50)));
    }
}
