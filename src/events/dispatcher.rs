//! Event Dispatcher
//! Consumes committed market events and runs best-effort side effects

use super::{AwardService, EventReceiver, MarketEvent};
use crate::engine::models::AwardKind;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::observability::metrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct EventDispatcher {
    awards: Arc<AwardService>,
    notifier: Arc<dyn Notifier>,
}

impl EventDispatcher {
    pub fn new(awards: Arc<AwardService>, notifier: Arc<dyn Notifier>) -> Self {
        Self { awards, notifier }
    }

    /// Drain events until every sender is dropped.
    pub async fn run(self, mut rx: EventReceiver) {
        info!("Event dispatcher running");
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!("Event dispatcher stopped");
    }

    /// Handle one event. Failures are logged and counted, never returned.
    pub async fn handle(&self, event: MarketEvent) {
        let kind = event.kind();
        debug!(event = kind, "Dispatching market event");
        if let Err(e) = self.dispatch(event).await {
            warn!(event = kind, error = %e, "Side effect failed");
            if let Some(m) = metrics::get() {
                m.side_effect_failures_total.with_label_values(&[kind]).inc();
            }
        }
    }

    async fn notify(&self, note: Notification) {
        let user_id = note.user_id;
        if let Err(e) = self.notifier.send(note).await {
            warn!(user_id = %user_id, error = %e, "Notification delivery failed");
            if let Some(m) = metrics::get() {
                m.side_effect_failures_total.with_label_values(&["notification"]).inc();
            }
        }
    }

    async fn dispatch(&self, event: MarketEvent) -> anyhow::Result<()> {
        match event {
            MarketEvent::TradeExecuted {
                transaction,
                stock_created_at,
                avg_buy_price,
                prior_trades,
                holdings,
            } => {
                self.awards
                    .check_trade(
                        &transaction,
                        stock_created_at,
                        avg_buy_price,
                        prior_trades,
                        holdings,
                    )
                    .await;
            }
            MarketEvent::TradeFailed {
                user_id,
                stock_id,
                operation,
                reason,
            } => {
                let note = Notification::new(
                    user_id,
                    NotificationKind::TradeFailed,
                    "Trade failed",
                    format!("Your {} could not be completed. Please try again.", operation),
                )
                .with_data(serde_json::json!({ "stock_id": stock_id, "reason": reason }));
                self.notify(note).await;
            }
            MarketEvent::LiquidityRequested {
                stock_id,
                stock_name,
                requester,
                holders,
                shares,
                offered_price,
            } => {
                for holder in holders {
                    let note = Notification::new(
                        holder,
                        NotificationKind::LiquidityRequest,
                        "Buyer looking for shares",
                        format!(
                            "A trader wants {} shares of {} and offers ${} per share",
                            shares, stock_name, offered_price
                        ),
                    )
                    .with_data(serde_json::json!({
                        "stock_id": stock_id,
                        "requester": requester,
                        "offered_price": offered_price,
                    }));
                    self.notify(note).await;
                }
            }
            MarketEvent::SharesIssued {
                stock_id,
                stock_name,
                new_shares,
                new_price,
                holders,
            } => {
                for holder in holders {
                    let note = Notification::new(
                        holder,
                        NotificationKind::Dilution,
                        "New shares issued",
                        format!(
                            "{} new shares of {} were issued; price is now ${}",
                            new_shares, stock_name, new_price
                        ),
                    )
                    .with_data(serde_json::json!({ "stock_id": stock_id }));
                    self.notify(note).await;

                    if let Err(e) = self.awards.grant(holder, AwardKind::DilutionSurvivor).await {
                        warn!(user_id = %holder, error = %e, "Dilution award failed");
                    }
                }
            }
            MarketEvent::BuybackOffered {
                offer,
                stock_name,
                recipients,
            } => {
                for user_id in recipients {
                    let note = Notification::new(
                        user_id,
                        NotificationKind::BuybackOffer,
                        "Buyback offer",
                        format!(
                            "Offer to buy back {} shares at ${} until {}",
                            stock_name,
                            offer.offered_price,
                            offer.expires_at.format("%Y-%m-%d %H:%M UTC")
                        ),
                    )
                    .with_data(serde_json::json!({ "offer_id": offer.id }));
                    self.notify(note).await;
                }
            }
            MarketEvent::BuybackFilled {
                offer,
                seller,
                shares,
            } => {
                let note = Notification::new(
                    offer.created_by,
                    NotificationKind::BuybackFilled,
                    "Buyback filled",
                    format!(
                        "{} shares tendered at ${} ({} accepted so far)",
                        shares, offer.offered_price, offer.accepted_shares
                    ),
                )
                .with_data(serde_json::json!({ "offer_id": offer.id, "seller": seller }));
                self.notify(note).await;
            }
        }
        Ok(())
    }
}
