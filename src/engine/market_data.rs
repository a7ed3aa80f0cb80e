//! Market chart aggregation

use crate::engine::models::{PricePoint, Stock};
use crate::engine::pricing::notional;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketDataPoint {
    pub timestamp: DateTime<Utc>,
    /// Sum of every price point recorded that day, across all stocks.
    pub total_market_cap: Decimal,
    pub average_price: Decimal,
}

/// One point per UTC calendar day, oldest first.
pub fn build_market_data(price_history: &[PricePoint]) -> Vec<MarketDataPoint> {
    let mut days: BTreeMap<NaiveDate, (Decimal, u64)> = BTreeMap::new();
    for point in price_history {
        let entry = days
            .entry(point.recorded_at.date_naive())
            .or_insert((Decimal::ZERO, 0));
        entry.0 += point.price;
        entry.1 += 1;
    }

    days.into_iter()
        .filter_map(|(day, (sum, count))| {
            let midnight = day.and_hms_opt(0, 0, 0)?.and_utc();
            Some(MarketDataPoint {
                timestamp: midnight,
                total_market_cap: sum,
                average_price: sum / Decimal::from(count),
            })
        })
        .collect()
}

/// Price times shares outstanding, summed over the given stocks.
/// Saturates at `Decimal::MAX`.
pub fn market_capitalization<'a>(stocks: impl IntoIterator<Item = &'a Stock>) -> Decimal {
    stocks
        .into_iter()
        .map(|s| notional(s.current_price, s.total_shares).unwrap_or(Decimal::MAX))
        .fold(Decimal::ZERO, Decimal::saturating_add)
}
