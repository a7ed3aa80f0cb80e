//! In-process store used for local runs and tests

use super::{MarketSnapshot, Store, StoreError, WriteBatch, WriteOp};
use crate::engine::models::Award;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<MarketSnapshot>,
    fail_commits: AtomicBool,
    fail_awards: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: MarketSnapshot) -> Self {
        Self {
            data: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    /// Make every subsequent commit fail until switched off.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_awards(&self, fail: bool) {
        self.fail_awards.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> MarketSnapshot {
        self.data.lock().await.clone()
    }
}

fn upsert_by<T, K: PartialEq>(rows: &mut Vec<T>, row: T, key: impl Fn(&T) -> K) {
    let k = key(&row);
    match rows.iter_mut().find(|r| key(r) == k) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self) -> Result<MarketSnapshot, StoreError> {
        Ok(self.data.lock().await.clone())
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit rejected".into()));
        }

        let mut data = self.data.lock().await;
        for op in &batch.ops {
            match op.clone() {
                WriteOp::UpsertStock(s) => upsert_by(&mut data.stocks, s, |s| s.id),
                WriteOp::UpsertAccount(a) => upsert_by(&mut data.accounts, a, |a| a.id),
                WriteOp::UpsertPosition(p) => {
                    upsert_by(&mut data.positions, p, |p| (p.user_id, p.stock_id))
                }
                WriteOp::DeletePosition { user_id, stock_id } => data
                    .positions
                    .retain(|p| !(p.user_id == user_id && p.stock_id == stock_id)),
                WriteOp::InsertTransaction(t) => data.transactions.push(t),
                WriteOp::InsertPricePoint(p) => data.price_history.push(p),
                WriteOp::UpsertOffer(o) => upsert_by(&mut data.offers, o, |o| o.id),
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn record_award(&self, award: &Award) -> Result<(), StoreError> {
        if self.fail_awards.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("award write rejected".into()));
        }
        let mut data = self.data.lock().await;
        let exists = data
            .awards
            .iter()
            .any(|a| a.user_id == award.user_id && a.kind == award.kind);
        if !exists {
            data.awards.push(award.clone());
        }
        Ok(())
    }
}
