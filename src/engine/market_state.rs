//! In-memory Market State with Undo Log
//! Every mutation goes through a `ChangeSet`, which records the prior value of
//! each touched entity and the matching store write.

use crate::engine::models::{
    BuybackOffer, Position, PricePoint, Stock, Transaction, UserAccount,
};
use crate::store::{MarketSnapshot, WriteBatch, WriteOp};
use std::collections::HashMap;
use uuid::Uuid;

type PositionKey = (Uuid, Uuid);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketState {
    pub stocks: HashMap<Uuid, Stock>,
    pub accounts: HashMap<Uuid, UserAccount>,
    pub positions: HashMap<PositionKey, Position>,
    pub transactions: Vec<Transaction>,
    pub price_history: Vec<PricePoint>,
    pub offers: HashMap<Uuid, BuybackOffer>,
}

impl MarketState {
    pub fn from_snapshot(snapshot: MarketSnapshot) -> Self {
        Self {
            stocks: snapshot.stocks.into_iter().map(|s| (s.id, s)).collect(),
            accounts: snapshot.accounts.into_iter().map(|a| (a.id, a)).collect(),
            positions: snapshot
                .positions
                .into_iter()
                .filter(|p| p.shares > 0)
                .map(|p| ((p.user_id, p.stock_id), p))
                .collect(),
            transactions: snapshot.transactions,
            price_history: snapshot.price_history,
            offers: snapshot.offers.into_iter().map(|o| (o.id, o)).collect(),
        }
    }

    pub fn position(&self, user_id: Uuid, stock_id: Uuid) -> Option<&Position> {
        self.positions.get(&(user_id, stock_id))
    }

    pub fn positions_for(&self, user_id: Uuid) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(move |p| p.user_id == user_id)
    }

    /// Users currently holding the stock.
    pub fn holders_of(&self, stock_id: Uuid) -> Vec<Uuid> {
        let mut holders: Vec<Uuid> = self
            .positions
            .values()
            .filter(|p| p.stock_id == stock_id)
            .map(|p| p.user_id)
            .collect();
        holders.sort();
        holders
    }

    pub fn trade_count(&self, user_id: Uuid) -> usize {
        self.transactions.iter().filter(|t| t.user_id == user_id).count()
    }

    pub fn holdings_count(&self, user_id: Uuid) -> usize {
        self.positions_for(user_id).count()
    }
}

// =====================================================
// UNDO LOG
// =====================================================

#[derive(Debug)]
enum Undo {
    Stock(Uuid, Option<Stock>),
    Account(Uuid, Option<UserAccount>),
    Position(PositionKey, Option<Position>),
    Transaction(Uuid),
    PricePoint(Uuid),
    Offer(Uuid, Option<BuybackOffer>),
}

fn restore<K: std::hash::Hash + Eq, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

/// Prior values of everything one operation touched.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<Undo>,
}

impl UndoLog {
    /// Put every touched entity back, newest change first.
    pub fn revert(self, state: &mut MarketState) {
        for entry in self.entries.into_iter().rev() {
            match entry {
                Undo::Stock(id, prior) => restore(&mut state.stocks, id, prior),
                Undo::Account(id, prior) => restore(&mut state.accounts, id, prior),
                Undo::Position(key, prior) => restore(&mut state.positions, key, prior),
                Undo::Offer(id, prior) => restore(&mut state.offers, id, prior),
                Undo::Transaction(id) => state.transactions.retain(|t| t.id != id),
                Undo::PricePoint(id) => state.price_history.retain(|p| p.id != id),
            }
        }
    }
}

// =====================================================
// CHANGE SET
// =====================================================

pub struct ChangeSet<'a> {
    state: &'a mut MarketState,
    undo: UndoLog,
    batch: WriteBatch,
}

impl<'a> ChangeSet<'a> {
    pub fn new(state: &'a mut MarketState) -> Self {
        Self {
            state,
            undo: UndoLog::default(),
            batch: WriteBatch::new(),
        }
    }

    pub fn put_stock(&mut self, stock: Stock) {
        let prior = self.state.stocks.insert(stock.id, stock.clone());
        self.undo.entries.push(Undo::Stock(stock.id, prior));
        self.batch.push(WriteOp::UpsertStock(stock));
    }

    pub fn put_account(&mut self, account: UserAccount) {
        let prior = self.state.accounts.insert(account.id, account.clone());
        self.undo.entries.push(Undo::Account(account.id, prior));
        self.batch.push(WriteOp::UpsertAccount(account));
    }

    pub fn put_position(&mut self, position: Position) {
        let key = (position.user_id, position.stock_id);
        let prior = self.state.positions.insert(key, position.clone());
        self.undo.entries.push(Undo::Position(key, prior));
        self.batch.push(WriteOp::UpsertPosition(position));
    }

    pub fn remove_position(&mut self, user_id: Uuid, stock_id: Uuid) {
        let key = (user_id, stock_id);
        let prior = self.state.positions.remove(&key);
        self.undo.entries.push(Undo::Position(key, prior));
        self.batch.push(WriteOp::DeletePosition { user_id, stock_id });
    }

    pub fn append_transaction(&mut self, transaction: Transaction) {
        self.undo.entries.push(Undo::Transaction(transaction.id));
        self.state.transactions.push(transaction.clone());
        self.batch.push(WriteOp::InsertTransaction(transaction));
    }

    pub fn append_price_point(&mut self, point: PricePoint) {
        self.undo.entries.push(Undo::PricePoint(point.id));
        self.state.price_history.push(point.clone());
        self.batch.push(WriteOp::InsertPricePoint(point));
    }

    pub fn put_offer(&mut self, offer: BuybackOffer) {
        let prior = self.state.offers.insert(offer.id, offer.clone());
        self.undo.entries.push(Undo::Offer(offer.id, prior));
        self.batch.push(WriteOp::UpsertOffer(offer));
    }

    /// Read access to the state as modified so far.
    pub fn state(&self) -> &MarketState {
        self.state
    }

    pub fn finish(self) -> (UndoLog, WriteBatch) {
        (self.undo, self.batch)
    }
}
