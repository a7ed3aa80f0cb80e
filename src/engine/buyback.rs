//! Buyback Offers
//! Fixed-price tenders that holders fill in part or in full, outside the
//! continuous market. Fills never move the market price.

use super::error::TradeError;
use super::market_state::ChangeSet;
use super::models::{
    BuybackFill, BuybackOffer, BuybackRequest, OfferStatus, Side, Stock, Transaction,
    UserAccount,
};
use super::position_keeper::{Fill, PositionChange, PositionKeeper};
use super::pricing::{MAX_PRICE, MAX_SHARES};
use super::trading_engine::{credit, notional, require, TradingEngine};
use crate::auth::{permissions, AuthContext};
use crate::events::MarketEvent;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

impl TradingEngine {
    pub async fn create_buyback_offer(
        &self,
        auth: &AuthContext,
        request: BuybackRequest,
    ) -> Result<BuybackOffer, TradeError> {
        let started = Instant::now();
        let result = self.execute_create_offer(auth, request).await;
        self.observe("buyback_create", started, &result);
        result
    }

    async fn execute_create_offer(
        &self,
        auth: &AuthContext,
        request: BuybackRequest,
    ) -> Result<BuybackOffer, TradeError> {
        require(auth, permissions::BUYBACK_CREATE)?;
        if request.offered_price <= Decimal::ZERO || request.offered_price > MAX_PRICE {
            return Err(TradeError::InvalidPrice(format!(
                "offered price must be positive and at most {}",
                MAX_PRICE
            )));
        }
        if matches!(request.target_shares, Some(n) if n == 0 || n > MAX_SHARES) {
            return Err(TradeError::InvalidQuantity);
        }
        let now = Utc::now();
        let expires_at = expiry(now, request.expires_in_hours)?;

        self.ensure_listed(request.stock_id).await?;
        let _stock = self.stock_locks.acquire(request.stock_id).await;

        let (offer, stock_name, recipients, undo, batch) = {
            let mut state = self.state.write().await;
            let stock = state
                .stocks
                .get(&request.stock_id)
                .ok_or(TradeError::StockNotFound(request.stock_id))?;
            let stock_name = stock.name.clone();

            let offer = BuybackOffer {
                id: Uuid::new_v4(),
                stock_id: request.stock_id,
                created_by: auth.account_id,
                offered_price: request.offered_price,
                target_users: request.target_users,
                target_shares: request.target_shares,
                accepted_shares: 0,
                accepted_by_users: Vec::new(),
                status: OfferStatus::Active,
                created_at: now,
                expires_at,
            };

            let recipients: Vec<Uuid> = match &offer.target_users {
                Some(users) => users.clone(),
                None => {
                    let mut all: Vec<Uuid> = state
                        .accounts
                        .keys()
                        .copied()
                        .filter(|id| *id != auth.account_id)
                        .collect();
                    all.sort();
                    all
                }
            };

            let mut changes = ChangeSet::new(&mut state);
            changes.put_offer(offer.clone());
            let (undo, batch) = changes.finish();
            (offer, stock_name, recipients, undo, batch)
        };

        self.commit_or_revert("buyback_create", undo, batch, None).await?;

        info!(
            offer_id = %offer.id,
            stock_id = %offer.stock_id,
            price = %offer.offered_price,
            target_shares = ?offer.target_shares,
            recipients = recipients.len(),
            "Buyback offer created"
        );
        self.emit(MarketEvent::BuybackOffered {
            offer: offer.clone(),
            stock_name,
            recipients,
        });
        Ok(offer)
    }

    /// Tender shares into an offer. Requests above the remaining cap are
    /// filled up to the cap.
    pub async fn accept_buyback_offer(
        &self,
        auth: &AuthContext,
        offer_id: Uuid,
        shares: u64,
    ) -> Result<BuybackFill, TradeError> {
        let started = Instant::now();
        let result = self.execute_accept_offer(auth, offer_id, shares).await;
        self.observe("buyback_accept", started, &result);
        result
    }

    async fn execute_accept_offer(
        &self,
        auth: &AuthContext,
        offer_id: Uuid,
        shares: u64,
    ) -> Result<BuybackFill, TradeError> {
        require(auth, permissions::TRADES_EXECUTE)?;
        if shares == 0 {
            return Err(TradeError::InvalidQuantity);
        }
        let user_id = auth.account_id;
        let stock_id = self.offer_stock(offer_id).await?;

        let _stock = self.stock_locks.acquire(stock_id).await;
        let _user = self.user_locks.acquire(user_id).await;
        let now = Utc::now();

        let (fill, undo, batch) = {
            let mut state = self.state.write().await;
            let offer = state
                .offers
                .get(&offer_id)
                .cloned()
                .ok_or(TradeError::OfferNotFound(offer_id))?;
            if offer.status != OfferStatus::Active {
                return Err(TradeError::OfferNotActive(offer.status.as_str()));
            }
            if offer.is_expired_at(now) {
                drop(state);
                self.expire_offer(offer).await;
                return Err(TradeError::OfferExpired);
            }
            if !offer.is_targeted_at(&user_id) {
                return Err(TradeError::NotTargeted);
            }

            let accepted = match offer.remaining_shares() {
                Some(0) => return Err(TradeError::OfferFilled),
                Some(remaining) => shares.min(remaining),
                None => shares,
            };

            let account = state
                .accounts
                .get(&user_id)
                .cloned()
                .ok_or(TradeError::AccountNotFound(user_id))?;
            if account.is_banned(now) {
                return Err(TradeError::UserBanned);
            }
            let position = state
                .position(user_id, stock_id)
                .cloned()
                .ok_or(TradeError::PositionNotFound(stock_id))?;
            if accepted > position.shares {
                return Err(TradeError::InsufficientShares {
                    held: position.shares,
                    requested: accepted,
                });
            }
            let stock = state
                .stocks
                .get(&stock_id)
                .cloned()
                .ok_or(TradeError::StockNotFound(stock_id))?;
            let returned = stock.available_shares + accepted;
            if returned > stock.total_shares {
                return Err(TradeError::FloatOverflow { returned: accepted });
            }

            let proceeds = notional(offer.offered_price, accepted)?;
            let balance = credit(account.balance, proceeds)?;
            let total_accepted = offer
                .accepted_shares
                .checked_add(accepted)
                .filter(|n| *n <= MAX_SHARES)
                .ok_or(TradeError::OutOfRange("accepted shares"))?;
            let transaction = Transaction {
                id: Uuid::new_v4(),
                user_id,
                stock_id,
                side: Side::Sell,
                shares: accepted,
                price_per_share: offer.offered_price,
                total_amount: proceeds,
                executed_at: now,
            };

            let mut filled = offer;
            filled.accepted_shares = total_accepted;
            if !filled.accepted_by_users.contains(&user_id) {
                filled.accepted_by_users.push(user_id);
            }
            if filled.target_shares == Some(filled.accepted_shares) {
                filled.status = OfferStatus::Accepted;
            }

            let sell = Fill {
                user_id,
                stock_id,
                shares: accepted,
                price: filled.offered_price,
                executed_at: now,
            };

            let mut changes = ChangeSet::new(&mut state);
            changes.put_account(UserAccount {
                balance,
                ..account
            });
            changes.put_stock(Stock {
                available_shares: returned,
                ..stock
            });
            match PositionKeeper::apply_sell(&position, &sell) {
                PositionChange::Upsert(p) => changes.put_position(p),
                PositionChange::Delete { user_id, stock_id } => {
                    changes.remove_position(user_id, stock_id)
                }
            }
            changes.append_transaction(transaction.clone());
            changes.put_offer(filled.clone());
            let (undo, batch) = changes.finish();

            (
                BuybackFill {
                    offer: filled,
                    accepted_shares: accepted,
                    transaction,
                },
                undo,
                batch,
            )
        };

        self.commit_or_revert("buyback_accept", undo, batch, Some((user_id, stock_id)))
            .await?;

        info!(
            offer_id = %offer_id,
            user_id = %user_id,
            requested = shares,
            accepted = fill.accepted_shares,
            total_accepted = fill.offer.accepted_shares,
            status = fill.offer.status.as_str(),
            "Buyback offer filled"
        );
        self.emit(MarketEvent::BuybackFilled {
            offer: fill.offer.clone(),
            seller: user_id,
            shares: fill.accepted_shares,
        });
        Ok(fill)
    }

    /// Decline an offer. Open to a targeted user, the creator, or an admin.
    pub async fn decline_buyback_offer(
        &self,
        auth: &AuthContext,
        offer_id: Uuid,
    ) -> Result<BuybackOffer, TradeError> {
        self.close_offer(auth, offer_id, OfferStatus::Declined, |offer, auth| {
            let targeted = offer
                .target_users
                .as_ref()
                .map_or(false, |users| users.contains(&auth.account_id));
            targeted || offer.created_by == auth.account_id || auth.is_admin()
        })
        .await
    }

    /// Withdraw an offer. Open to the creator or an admin.
    pub async fn cancel_buyback_offer(
        &self,
        auth: &AuthContext,
        offer_id: Uuid,
    ) -> Result<BuybackOffer, TradeError> {
        self.close_offer(auth, offer_id, OfferStatus::Expired, |offer, auth| {
            offer.created_by == auth.account_id || auth.is_admin()
        })
        .await
    }

    async fn close_offer(
        &self,
        auth: &AuthContext,
        offer_id: Uuid,
        status: OfferStatus,
        allowed: impl Fn(&BuybackOffer, &AuthContext) -> bool,
    ) -> Result<BuybackOffer, TradeError> {
        let stock_id = self.offer_stock(offer_id).await?;
        let _stock = self.stock_locks.acquire(stock_id).await;

        let (offer, undo, batch) = {
            let mut state = self.state.write().await;
            let offer = state
                .offers
                .get(&offer_id)
                .cloned()
                .ok_or(TradeError::OfferNotFound(offer_id))?;
            if !allowed(&offer, auth) {
                return Err(TradeError::Unauthorized(format!(
                    "cannot mark offer {}",
                    status.as_str()
                )));
            }
            if offer.status != OfferStatus::Active {
                return Err(TradeError::OfferNotActive(offer.status.as_str()));
            }
            let offer = BuybackOffer { status, ..offer };
            let mut changes = ChangeSet::new(&mut state);
            changes.put_offer(offer.clone());
            let (undo, batch) = changes.finish();
            (offer, undo, batch)
        };

        self.commit_or_revert("buyback_close", undo, batch, None).await?;
        info!(
            offer_id = %offer_id,
            by = %auth.account_id,
            status = status.as_str(),
            "Buyback offer closed"
        );
        Ok(offer)
    }

    /// Mark every active offer past its expiry as expired.
    pub async fn expire_buyback_offers(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<BuybackOffer> = self
            .state
            .read()
            .await
            .offers
            .values()
            .filter(|o| o.status == OfferStatus::Active && o.is_expired_at(now))
            .cloned()
            .collect();

        let mut expired = 0;
        for offer in stale {
            let _stock = self.stock_locks.acquire(offer.stock_id).await;
            let current = self.state.read().await.offers.get(&offer.id).cloned();
            if let Some(current) = current {
                if current.status == OfferStatus::Active {
                    self.expire_offer(current).await;
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            info!(expired = expired, "Expired stale buyback offers");
        }
        expired
    }

    /// Caller holds the stock lock.
    async fn expire_offer(&self, offer: BuybackOffer) {
        let offer_id = offer.id;
        let batch = {
            let mut state = self.state.write().await;
            let mut changes = ChangeSet::new(&mut state);
            changes.put_offer(BuybackOffer {
                status: OfferStatus::Expired,
                ..offer
            });
            let (_, batch) = changes.finish();
            batch
        };
        if let Err(e) = self.store.commit(&batch).await {
            warn!(offer_id = %offer_id, error = %e, "Failed to persist offer expiry");
        }
    }

    async fn offer_stock(&self, offer_id: Uuid) -> Result<Uuid, TradeError> {
        self.state
            .read()
            .await
            .offers
            .get(&offer_id)
            .map(|o| o.stock_id)
            .ok_or(TradeError::OfferNotFound(offer_id))
    }
}

/// Offer deadline `hours` after `now`, rejected when it leaves the calendar range.
fn expiry(now: DateTime<Utc>, hours: u32) -> Result<DateTime<Utc>, TradeError> {
    Duration::try_hours(i64::from(hours))
        .and_then(|d| now.checked_add_signed(d))
        .ok_or(TradeError::OutOfRange("offer expiry"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_adds_whole_hours() {
        let now = Utc::now();
        assert_eq!(expiry(now, 24).unwrap() - now, Duration::hours(24));
        assert_eq!(expiry(now, 0).unwrap(), now);
    }

    #[test]
    fn test_expiry_past_calendar_range_is_rejected() {
        assert!(matches!(
            expiry(Utc::now(), u32::MAX),
            Err(TradeError::OutOfRange(_))
        ));
    }
}
