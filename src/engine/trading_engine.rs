//! Trading Engine
//! Buy/sell execution, listings, dilution and market-wide adjustments.
//!
//! Each mutating operation follows the same shape: validate under the entity
//! locks, apply the change optimistically through a `ChangeSet`, release the
//! state lock, commit the resulting batch, and revert from the undo log when
//! the commit fails. Side effects are emitted as events only after commit.

use crate::auth::{permissions, AuthContext};
use crate::engine::error::TradeError;
use crate::engine::locks::KeyedLocks;
use crate::engine::market_data::{self, MarketDataPoint};
use crate::engine::market_state::{ChangeSet, MarketState, UndoLog};
use crate::engine::models::{
    BuybackOffer, Holding, NewStock, Position, PricePoint, Side, Stock, Transaction,
    UserAccount,
};
use crate::engine::position_keeper::{Fill, PositionChange, PositionKeeper};
use crate::engine::pricing::{self, MAX_PRICE, MAX_SHARES, MIN_PRICE};
use crate::events::{self, EventReceiver, EventSender, MarketEvent};
use crate::observability::metrics;
use crate::store::{MarketSnapshot, Store, WriteBatch};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Holders solicited when a buyer finds no float.
pub const LIQUIDITY_REQUEST_RECIPIENTS: usize = 3;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Cash credited to a newly opened account.
    pub starting_balance: Decimal,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            starting_balance: dec!(10000),
        }
    }
}

// =====================================================
// TRADING ENGINE
// =====================================================

pub struct TradingEngine {
    pub(super) store: Arc<dyn Store>,
    pub(super) state: RwLock<MarketState>,
    pub(super) stock_locks: KeyedLocks,
    pub(super) user_locks: KeyedLocks,
    pub(super) events: EventSender,
    settings: EngineSettings,
}

pub(super) fn require(auth: &AuthContext, permission: &str) -> Result<(), TradeError> {
    if auth.has_permission(permission) {
        Ok(())
    } else {
        Err(TradeError::Unauthorized(format!("{} required", permission)))
    }
}

pub(super) fn require_admin(auth: &AuthContext) -> Result<(), TradeError> {
    require(auth, permissions::ADMIN_FULL)
}

fn signed(shares: u64) -> Result<i64, TradeError> {
    i64::try_from(shares).map_err(|_| TradeError::InvalidQuantity)
}

pub(super) fn notional(price: Decimal, shares: u64) -> Result<Decimal, TradeError> {
    pricing::notional(price, shares).ok_or(TradeError::OutOfRange("trade value"))
}

pub(super) fn credit(balance: Decimal, amount: Decimal) -> Result<Decimal, TradeError> {
    balance
        .checked_add(amount)
        .ok_or(TradeError::OutOfRange("account balance"))
}

impl TradingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        snapshot: MarketSnapshot,
        settings: EngineSettings,
    ) -> (Self, EventReceiver) {
        let (tx, rx) = events::channel();
        let state = MarketState::from_snapshot(snapshot);
        info!(
            stocks = state.stocks.len(),
            accounts = state.accounts.len(),
            positions = state.positions.len(),
            "Trading engine initialized"
        );
        let engine = Self {
            store,
            state: RwLock::new(state),
            stock_locks: KeyedLocks::new(),
            user_locks: KeyedLocks::new(),
            events: tx,
            settings,
        };
        (engine, rx)
    }

    /// Hydrate from the store.
    pub async fn load(
        store: Arc<dyn Store>,
        settings: EngineSettings,
    ) -> anyhow::Result<(Self, EventReceiver)> {
        let snapshot = store.load().await?;
        Ok(Self::new(store, snapshot, settings))
    }

    pub(super) fn emit(&self, event: MarketEvent) {
        let kind = event.kind();
        if self.events.send(event).is_err() {
            debug!(event = kind, "No event subscriber, dropping event");
        }
    }

    /// Commit a batch; on failure revert the optimistic changes.
    pub(super) async fn commit_or_revert(
        &self,
        operation: &'static str,
        undo: UndoLog,
        batch: WriteBatch,
        affected: Option<(Uuid, Uuid)>,
    ) -> Result<(), TradeError> {
        match self.store.commit(&batch).await {
            Ok(()) => {
                self.refresh_gauges().await;
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.state.write().await;
                    undo.revert(&mut state);
                }
                warn!(
                    operation = operation,
                    writes = batch.len(),
                    error = %e,
                    "Commit failed, optimistic changes rolled back"
                );
                if let Some(m) = metrics::get() {
                    m.trade_rollbacks_total.with_label_values(&[operation]).inc();
                }
                if let Some((user_id, stock_id)) = affected {
                    self.emit(MarketEvent::TradeFailed {
                        user_id,
                        stock_id,
                        operation,
                        reason: e.to_string(),
                    });
                }
                Err(TradeError::Persistence(e))
            }
        }
    }

    /// Commit without rollback; used by administrative bulk updates.
    async fn commit_best_effort(&self, operation: &'static str, batch: WriteBatch) {
        if let Err(e) = self.store.commit(&batch).await {
            warn!(
                operation = operation,
                writes = batch.len(),
                error = %e,
                "Commit failed, local state kept"
            );
        }
        self.refresh_gauges().await;
    }

    async fn refresh_gauges(&self) {
        if let Some(m) = metrics::get() {
            let state = self.state.read().await;
            m.active_positions.set(state.positions.len() as f64);
            m.listed_stocks.set(state.stocks.len() as f64);
        }
    }

    pub(super) fn observe<T>(
        &self,
        operation: &'static str,
        started: Instant,
        result: &Result<T, TradeError>,
    ) {
        if let Some(m) = metrics::get() {
            let outcome = match result {
                Ok(_) => "ok",
                Err(e) => e.code(),
            };
            m.trades_total.with_label_values(&[operation, outcome]).inc();
            m.operation_duration
                .with_label_values(&[operation])
                .observe(started.elapsed().as_secs_f64());
        }
        if let Err(e) = result {
            if e.is_validation() {
                debug!(operation = operation, reason = %e, "Operation rejected");
            } else {
                warn!(operation = operation, error = %e, "Operation failed");
            }
        }
    }

    // =====================================================
    // ACCOUNTS
    // =====================================================

    /// Open a cash account for the caller, or return the existing one.
    pub async fn open_account(&self, auth: &AuthContext) -> Result<UserAccount, TradeError> {
        let _user = self.user_locks.acquire(auth.account_id).await;

        let (undo, batch, account) = {
            let mut state = self.state.write().await;
            if let Some(existing) = state.accounts.get(&auth.account_id) {
                return Ok(existing.clone());
            }
            let account = UserAccount {
                id: auth.account_id,
                username: auth.username.clone(),
                balance: self.settings.starting_balance,
                banned_until: None,
            };
            let mut changes = ChangeSet::new(&mut state);
            changes.put_account(account.clone());
            let (undo, batch) = changes.finish();
            (undo, batch, account)
        };

        self.commit_or_revert("open_account", undo, batch, None).await?;
        info!(user_id = %account.id, balance = %account.balance, "Account opened");
        Ok(account)
    }

    /// Ban a user until `until`, or lift the ban with `None`.
    pub async fn set_ban(
        &self,
        auth: &AuthContext,
        user_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<UserAccount, TradeError> {
        require_admin(auth)?;
        let _user = self.user_locks.acquire(user_id).await;

        let (undo, batch, account) = {
            let mut state = self.state.write().await;
            let account = state
                .accounts
                .get(&user_id)
                .cloned()
                .ok_or(TradeError::AccountNotFound(user_id))?;
            let account = UserAccount {
                banned_until: until,
                ..account
            };
            let mut changes = ChangeSet::new(&mut state);
            changes.put_account(account.clone());
            let (undo, batch) = changes.finish();
            (undo, batch, account)
        };

        self.commit_or_revert("set_ban", undo, batch, None).await?;
        info!(user_id = %user_id, until = ?until, "Ban updated");
        Ok(account)
    }

    // =====================================================
    // LISTING
    // =====================================================

    /// List a new character stock with its full supply available.
    pub async fn create_stock(
        &self,
        auth: &AuthContext,
        request: NewStock,
    ) -> Result<Stock, TradeError> {
        let started = Instant::now();
        let result = self.execute_create_stock(auth, request).await;
        self.observe("create_stock", started, &result);
        result
    }

    async fn execute_create_stock(
        &self,
        auth: &AuthContext,
        request: NewStock,
    ) -> Result<Stock, TradeError> {
        require(auth, permissions::STOCKS_CREATE)?;
        if request.total_shares == 0 || request.total_shares > MAX_SHARES {
            return Err(TradeError::InvalidQuantity);
        }
        if request.initial_price < MIN_PRICE || request.initial_price > MAX_PRICE {
            return Err(TradeError::InvalidPrice(format!(
                "initial price must be between {} and {}",
                MIN_PRICE, MAX_PRICE
            )));
        }

        let now = Utc::now();
        let stock = Stock {
            id: Uuid::new_v4(),
            name: request.name,
            total_shares: request.total_shares,
            available_shares: request.total_shares,
            current_price: pricing::round2(request.initial_price),
            creator_id: auth.account_id,
            created_at: now,
        };

        let (undo, batch) = {
            let mut state = self.state.write().await;
            let mut changes = ChangeSet::new(&mut state);
            changes.put_stock(stock.clone());
            changes.append_price_point(PricePoint::new(stock.id, stock.current_price, now));
            changes.finish()
        };

        self.commit_or_revert("create_stock", undo, batch, None).await?;
        info!(
            stock_id = %stock.id,
            name = %stock.name,
            total_shares = stock.total_shares,
            price = %stock.current_price,
            "Stock listed"
        );
        Ok(stock)
    }

    // =====================================================
    // BUY
    // =====================================================

    pub async fn buy_stock(
        &self,
        auth: &AuthContext,
        stock_id: Uuid,
        shares: u64,
    ) -> Result<Transaction, TradeError> {
        let started = Instant::now();
        let result = self.execute_buy(auth, stock_id, shares).await;
        self.observe("buy", started, &result);
        result
    }

    async fn execute_buy(
        &self,
        auth: &AuthContext,
        stock_id: Uuid,
        shares: u64,
    ) -> Result<Transaction, TradeError> {
        require(auth, permissions::TRADES_EXECUTE)?;
        if shares == 0 {
            return Err(TradeError::InvalidQuantity);
        }
        let delta = signed(shares)?;
        let user_id = auth.account_id;

        self.ensure_listed(stock_id).await?;
        let _stock = self.stock_locks.acquire(stock_id).await;
        let _user = self.user_locks.acquire(user_id).await;
        let now = Utc::now();

        let (transaction, stock, avg_buy_price, prior_trades, holdings, undo, batch) = {
            let mut state = self.state.write().await;
            let stock = state
                .stocks
                .get(&stock_id)
                .cloned()
                .ok_or(TradeError::StockNotFound(stock_id))?;
            let account = state
                .accounts
                .get(&user_id)
                .cloned()
                .ok_or(TradeError::AccountNotFound(user_id))?;
            if account.is_banned(now) {
                return Err(TradeError::UserBanned);
            }

            if shares > stock.available_shares {
                if stock.available_shares == 0 {
                    self.request_liquidity(&state, &stock, user_id, shares);
                }
                return Err(TradeError::InsufficientLiquidity {
                    available: stock.available_shares,
                    requested: shares,
                });
            }

            let price = stock.current_price;
            let cost = notional(price, shares)?;
            if cost > account.balance {
                return Err(TradeError::InsufficientFunds {
                    balance: account.balance,
                    required: cost,
                });
            }

            let prior_trades = state.trade_count(user_id);
            let new_price = pricing::apply_price_impact(&stock, delta);
            let fill = Fill {
                user_id,
                stock_id,
                shares,
                price,
                executed_at: now,
            };
            let position = PositionKeeper::apply_buy(state.position(user_id, stock_id), &fill);
            let transaction = Transaction {
                id: Uuid::new_v4(),
                user_id,
                stock_id,
                side: Side::Buy,
                shares,
                price_per_share: price,
                total_amount: cost,
                executed_at: now,
            };

            let mut changes = ChangeSet::new(&mut state);
            changes.put_account(UserAccount {
                balance: account.balance - cost,
                ..account
            });
            changes.put_stock(Stock {
                available_shares: stock.available_shares - shares,
                current_price: new_price,
                ..stock.clone()
            });
            changes.append_price_point(PricePoint::new(stock_id, new_price, now));
            changes.append_transaction(transaction.clone());
            changes.put_position(position.clone());
            let holdings = changes.state().holdings_count(user_id);
            let (undo, batch) = changes.finish();

            (
                transaction,
                stock,
                position.avg_buy_price,
                prior_trades,
                holdings,
                undo,
                batch,
            )
        };

        self.commit_or_revert("buy", undo, batch, Some((user_id, stock_id)))
            .await?;

        info!(
            user_id = %user_id,
            stock_id = %stock_id,
            shares = shares,
            price = %transaction.price_per_share,
            total = %transaction.total_amount,
            "Buy executed"
        );
        self.emit(MarketEvent::TradeExecuted {
            transaction: transaction.clone(),
            stock_created_at: stock.created_at,
            avg_buy_price,
            prior_trades,
            holdings,
        });
        Ok(transaction)
    }

    /// Solicit sellers when the float is exhausted.
    fn request_liquidity(&self, state: &MarketState, stock: &Stock, requester: Uuid, shares: u64) {
        let candidates: Vec<Uuid> = state
            .holders_of(stock.id)
            .into_iter()
            .filter(|h| *h != requester)
            .collect();
        if candidates.is_empty() {
            debug!(stock_id = %stock.id, "No holders to solicit");
            return;
        }

        let mut rng = rand::thread_rng();
        let holders: Vec<Uuid> = candidates
            .choose_multiple(&mut rng, LIQUIDITY_REQUEST_RECIPIENTS)
            .copied()
            .collect();
        let premium = Decimal::from(rng.gen_range(5u32..=15)) / dec!(100);
        let offered_price = pricing::round2(stock.current_price * (Decimal::ONE + premium));

        info!(
            stock_id = %stock.id,
            requester = %requester,
            recipients = holders.len(),
            offered_price = %offered_price,
            "Liquidity request sent"
        );
        self.emit(MarketEvent::LiquidityRequested {
            stock_id: stock.id,
            stock_name: stock.name.clone(),
            requester,
            holders,
            shares,
            offered_price,
        });
    }

    // =====================================================
    // SELL
    // =====================================================

    pub async fn sell_stock(
        &self,
        auth: &AuthContext,
        stock_id: Uuid,
        shares: u64,
    ) -> Result<Transaction, TradeError> {
        let started = Instant::now();
        let result = self.execute_sell(auth, stock_id, shares).await;
        self.observe("sell", started, &result);
        result
    }

    async fn execute_sell(
        &self,
        auth: &AuthContext,
        stock_id: Uuid,
        shares: u64,
    ) -> Result<Transaction, TradeError> {
        require(auth, permissions::TRADES_EXECUTE)?;
        if shares == 0 {
            return Err(TradeError::InvalidQuantity);
        }
        let delta = -signed(shares)?;
        let user_id = auth.account_id;

        self.ensure_listed(stock_id).await?;
        let _stock = self.stock_locks.acquire(stock_id).await;
        let _user = self.user_locks.acquire(user_id).await;
        let now = Utc::now();

        let (transaction, stock, avg_buy_price, prior_trades, holdings, undo, batch) = {
            let mut state = self.state.write().await;
            let stock = state
                .stocks
                .get(&stock_id)
                .cloned()
                .ok_or(TradeError::StockNotFound(stock_id))?;
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
            if shares > position.shares {
                return Err(TradeError::InsufficientShares {
                    held: position.shares,
                    requested: shares,
                });
            }
            let returned = stock.available_shares + shares;
            if returned > stock.total_shares {
                return Err(TradeError::FloatOverflow { returned: shares });
            }

            let price = stock.current_price;
            let proceeds = notional(price, shares)?;
            let balance = credit(account.balance, proceeds)?;
            let prior_trades = state.trade_count(user_id);
            let new_price = pricing::apply_price_impact(&stock, delta);
            let fill = Fill {
                user_id,
                stock_id,
                shares,
                price,
                executed_at: now,
            };
            let transaction = Transaction {
                id: Uuid::new_v4(),
                user_id,
                stock_id,
                side: Side::Sell,
                shares,
                price_per_share: price,
                total_amount: proceeds,
                executed_at: now,
            };

            let mut changes = ChangeSet::new(&mut state);
            changes.put_account(UserAccount {
                balance,
                ..account
            });
            changes.put_stock(Stock {
                available_shares: returned,
                current_price: new_price,
                ..stock.clone()
            });
            match PositionKeeper::apply_sell(&position, &fill) {
                PositionChange::Upsert(p) => changes.put_position(p),
                PositionChange::Delete { user_id, stock_id } => {
                    changes.remove_position(user_id, stock_id)
                }
            }
            changes.append_transaction(transaction.clone());
            changes.append_price_point(PricePoint::new(stock_id, new_price, now));
            let holdings = changes.state().holdings_count(user_id);
            let (undo, batch) = changes.finish();

            (
                transaction,
                stock,
                position.avg_buy_price,
                prior_trades,
                holdings,
                undo,
                batch,
            )
        };

        self.commit_or_revert("sell", undo, batch, Some((user_id, stock_id)))
            .await?;

        info!(
            user_id = %user_id,
            stock_id = %stock_id,
            shares = shares,
            price = %transaction.price_per_share,
            total = %transaction.total_amount,
            "Sell executed"
        );
        self.emit(MarketEvent::TradeExecuted {
            transaction: transaction.clone(),
            stock_created_at: stock.created_at,
            avg_buy_price,
            prior_trades,
            holdings,
        });
        Ok(transaction)
    }

    // =====================================================
    // DILUTION
    // =====================================================

    /// Issue new shares. Price falls in proportion to the supply increase.
    pub async fn create_shares(
        &self,
        auth: &AuthContext,
        stock_id: Uuid,
        new_shares: u64,
    ) -> Result<Stock, TradeError> {
        let started = Instant::now();
        let result = self.execute_create_shares(auth, stock_id, new_shares).await;
        self.observe("create_shares", started, &result);
        result
    }

    async fn execute_create_shares(
        &self,
        auth: &AuthContext,
        stock_id: Uuid,
        new_shares: u64,
    ) -> Result<Stock, TradeError> {
        require_admin(auth)?;
        if new_shares == 0 {
            return Err(TradeError::InvalidQuantity);
        }

        self.ensure_listed(stock_id).await?;
        let _stock = self.stock_locks.acquire(stock_id).await;
        let now = Utc::now();

        let (updated, holders, batch) = {
            let mut state = self.state.write().await;
            let stock = state
                .stocks
                .get(&stock_id)
                .cloned()
                .ok_or(TradeError::StockNotFound(stock_id))?;
            let total = stock
                .total_shares
                .checked_add(new_shares)
                .filter(|total| *total <= MAX_SHARES)
                .ok_or(TradeError::InvalidQuantity)?;
            let updated = Stock {
                total_shares: total,
                available_shares: stock.available_shares + new_shares,
                current_price: pricing::diluted_price(&stock, new_shares),
                ..stock
            };
            let holders = state.holders_of(stock_id);

            let mut changes = ChangeSet::new(&mut state);
            changes.put_stock(updated.clone());
            changes.append_price_point(PricePoint::new(stock_id, updated.current_price, now));
            let (_, batch) = changes.finish();
            (updated, holders, batch)
        };

        self.commit_best_effort("create_shares", batch).await;

        info!(
            stock_id = %stock_id,
            new_shares = new_shares,
            total_shares = updated.total_shares,
            price = %updated.current_price,
            holders = holders.len(),
            "Shares issued"
        );
        self.emit(MarketEvent::SharesIssued {
            stock_id,
            stock_name: updated.name.clone(),
            new_shares,
            new_price: updated.current_price,
            holders,
        });
        Ok(updated)
    }

    // =====================================================
    // MARKET-WIDE
    // =====================================================

    /// Multiply every stock price by `1 + percentage/100`. Returns stocks touched.
    pub async fn inflate_market(
        &self,
        auth: &AuthContext,
        percentage: Decimal,
    ) -> Result<usize, TradeError> {
        require_admin(auth)?;
        if percentage <= dec!(-100) {
            return Err(TradeError::InvalidPrice(format!(
                "cannot adjust prices by {}%",
                percentage
            )));
        }

        let ids: Vec<Uuid> = self.state.read().await.stocks.keys().copied().collect();
        let now = Utc::now();
        let mut batch = WriteBatch::new();

        for id in &ids {
            let _stock = self.stock_locks.acquire(*id).await;
            let mut state = self.state.write().await;
            let Some(stock) = state.stocks.get(id).cloned() else {
                continue;
            };
            let price = pricing::inflated_price(stock.current_price, percentage);
            let mut changes = ChangeSet::new(&mut state);
            changes.put_stock(Stock {
                current_price: price,
                ..stock
            });
            changes.append_price_point(PricePoint::new(*id, price, now));
            let (_, ops) = changes.finish();
            batch.ops.extend(ops.ops);
        }

        self.commit_best_effort("inflate_market", batch).await;
        info!(percentage = %percentage, stocks = ids.len(), "Market prices adjusted");
        Ok(ids.len())
    }

    /// Reject unknown stocks before a keyed lock is taken for them.
    pub(super) async fn ensure_listed(&self, stock_id: Uuid) -> Result<(), TradeError> {
        if self.state.read().await.stocks.contains_key(&stock_id) {
            Ok(())
        } else {
            Err(TradeError::StockNotFound(stock_id))
        }
    }

    // =====================================================
    // READS
    // =====================================================

    pub async fn stock(&self, stock_id: Uuid) -> Option<Stock> {
        self.state.read().await.stocks.get(&stock_id).cloned()
    }

    pub async fn stocks(&self) -> Vec<Stock> {
        let mut stocks: Vec<Stock> = self.state.read().await.stocks.values().cloned().collect();
        stocks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stocks
    }

    pub async fn account(&self, user_id: Uuid) -> Option<UserAccount> {
        self.state.read().await.accounts.get(&user_id).cloned()
    }

    pub async fn position(&self, user_id: Uuid, stock_id: Uuid) -> Option<Position> {
        self.state.read().await.position(user_id, stock_id).cloned()
    }

    pub async fn positions_for(&self, user_id: Uuid) -> Vec<Position> {
        self.state.read().await.positions_for(user_id).cloned().collect()
    }

    pub async fn holders_of(&self, stock_id: Uuid) -> Vec<Uuid> {
        self.state.read().await.holders_of(stock_id)
    }

    pub async fn transactions_for(&self, user_id: Uuid) -> Vec<Transaction> {
        self.state
            .read()
            .await
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn price_history(&self, stock_id: Uuid) -> Vec<PricePoint> {
        self.state
            .read()
            .await
            .price_history
            .iter()
            .filter(|p| p.stock_id == stock_id)
            .cloned()
            .collect()
    }

    pub async fn offer(&self, offer_id: Uuid) -> Option<BuybackOffer> {
        self.state.read().await.offers.get(&offer_id).cloned()
    }

    /// Holdings marked at current prices.
    pub async fn portfolio_value(&self, user_id: Uuid) -> Decimal {
        let state = self.state.read().await;
        state
            .positions_for(user_id)
            .filter_map(|p| {
                state
                    .stocks
                    .get(&p.stock_id)
                    .map(|s| PositionKeeper::market_value(p, s.current_price))
            })
            .fold(Decimal::ZERO, Decimal::saturating_add)
    }

    /// Each holding with its mark and gain over cost basis.
    pub async fn holdings(&self, user_id: Uuid) -> Vec<Holding> {
        let state = self.state.read().await;
        state
            .positions_for(user_id)
            .filter_map(|p| {
                let stock = state.stocks.get(&p.stock_id)?;
                Some(Holding {
                    position: p.clone(),
                    current_price: stock.current_price,
                    market_value: PositionKeeper::market_value(p, stock.current_price),
                    unrealized_pnl: PositionKeeper::unrealized_pnl(p, stock.current_price),
                })
            })
            .collect()
    }

    /// Daily chart over the full price history.
    pub async fn market_data(&self) -> Vec<MarketDataPoint> {
        market_data::build_market_data(&self.state.read().await.price_history)
    }

    pub async fn market_capitalization(&self) -> Decimal {
        market_data::market_capitalization(self.state.read().await.stocks.values())
    }

    /// Copy of the full in-memory state.
    pub async fn snapshot(&self) -> MarketState {
        self.state.read().await.clone()
    }
}
