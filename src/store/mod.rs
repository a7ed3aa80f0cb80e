//! Persistence Layer
//! Batched writes for the trading engine plus startup hydration

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::engine::models::{
    Award, BuybackOffer, Position, PricePoint, Stock, Transaction, UserAccount,
};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Value out of column range: {0}")]
    OutOfRange(String),
}

/// One write against the backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpsertStock(Stock),
    UpsertAccount(UserAccount),
    UpsertPosition(Position),
    DeletePosition { user_id: Uuid, stock_id: Uuid },
    InsertTransaction(Transaction),
    InsertPricePoint(PricePoint),
    UpsertOffer(BuybackOffer),
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::UpsertStock(_) => "upsert_stock",
            WriteOp::UpsertAccount(_) => "upsert_account",
            WriteOp::UpsertPosition(_) => "upsert_position",
            WriteOp::DeletePosition { .. } => "delete_position",
            WriteOp::InsertTransaction(_) => "insert_transaction",
            WriteOp::InsertPricePoint(_) => "insert_price_point",
            WriteOp::UpsertOffer(_) => "upsert_offer",
        }
    }
}

/// The set of writes produced by one engine operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Everything needed to rebuild engine state on startup.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub stocks: Vec<Stock>,
    pub accounts: Vec<UserAccount>,
    pub positions: Vec<Position>,
    pub transactions: Vec<Transaction>,
    pub price_history: Vec<PricePoint>,
    pub offers: Vec<BuybackOffer>,
    pub awards: Vec<Award>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self) -> Result<MarketSnapshot, StoreError>;

    /// Apply every op in the batch. Transactional stores apply all or none.
    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    async fn record_award(&self, award: &Award) -> Result<(), StoreError>;
}
