//! Achievement Awards
//! Each (user, award) pair is granted at most once.

use crate::engine::models::{Award, AwardKind, Side, Transaction};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::observability::metrics;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const HIGH_ROLLER_THRESHOLD: Decimal = dec!(1000);
pub const DIVERSIFIED_HOLDINGS: usize = 5;

pub fn early_bird_window() -> Duration {
    Duration::hours(1)
}

/// Awards earned by one executed trade.
pub fn awards_for_trade(
    transaction: &Transaction,
    stock_created_at: DateTime<Utc>,
    avg_buy_price: Decimal,
    prior_trades: usize,
    holdings: usize,
) -> Vec<AwardKind> {
    let mut earned = Vec::new();

    if prior_trades == 0 {
        earned.push(AwardKind::FirstTrade);
    }
    if transaction.total_amount >= HIGH_ROLLER_THRESHOLD {
        earned.push(AwardKind::HighRoller);
    }

    match transaction.side {
        Side::Buy => {
            if transaction.executed_at - stock_created_at <= early_bird_window() {
                earned.push(AwardKind::EarlyBird);
            }
            if holdings >= DIVERSIFIED_HOLDINGS {
                earned.push(AwardKind::Diversified);
            }
        }
        Side::Sell => {
            if transaction.price_per_share > avg_buy_price {
                earned.push(AwardKind::ProfitTaker);
            }
        }
    }

    earned
}

pub struct AwardService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    granted: Mutex<HashSet<(Uuid, AwardKind)>>,
}

impl AwardService {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        existing: impl IntoIterator<Item = Award>,
    ) -> Self {
        Self {
            store,
            notifier,
            granted: Mutex::new(existing.into_iter().map(|a| (a.user_id, a.kind)).collect()),
        }
    }

    pub async fn has(&self, user_id: Uuid, kind: AwardKind) -> bool {
        self.granted.lock().await.contains(&(user_id, kind))
    }

    /// Grant an award unless already held. Returns whether it was new.
    pub async fn grant(&self, user_id: Uuid, kind: AwardKind) -> anyhow::Result<bool> {
        {
            let mut granted = self.granted.lock().await;
            if !granted.insert((user_id, kind)) {
                return Ok(false);
            }
        }

        let award = Award {
            user_id,
            kind,
            granted_at: Utc::now(),
        };
        if let Err(e) = self.store.record_award(&award).await {
            // Not recorded; leave it grantable on the next trigger.
            self.granted.lock().await.remove(&(user_id, kind));
            return Err(e.into());
        }

        tracing::info!(user_id = %user_id, award = kind.as_str(), "Award granted");
        if let Some(m) = metrics::get() {
            m.awards_granted_total.with_label_values(&[kind.as_str()]).inc();
        }

        let note = Notification::new(
            user_id,
            NotificationKind::Award,
            "Award unlocked",
            format!("You earned the {} award", kind.title()),
        )
        .with_data(serde_json::json!({ "award": kind }));
        if let Err(e) = self.notifier.send(note).await {
            tracing::warn!(user_id = %user_id, error = %e, "Award notification failed");
        }

        Ok(true)
    }

    /// Run achievement checks for an executed trade. A failed grant is logged
    /// and the remaining awards are still attempted.
    pub async fn check_trade(
        &self,
        transaction: &Transaction,
        stock_created_at: DateTime<Utc>,
        avg_buy_price: Decimal,
        prior_trades: usize,
        holdings: usize,
    ) -> Vec<AwardKind> {
        let mut newly = Vec::new();
        for kind in awards_for_trade(
            transaction,
            stock_created_at,
            avg_buy_price,
            prior_trades,
            holdings,
        ) {
            match self.grant(transaction.user_id, kind).await {
                Ok(true) => newly.push(kind),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    user_id = %transaction.user_id,
                    award = kind.as_str(),
                    error = %e,
                    "Award grant failed"
                ),
            }
        }
        newly
    }
}
