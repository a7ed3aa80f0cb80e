//! PostgreSQL store
//! Every batch runs inside one database transaction

use super::{MarketSnapshot, Store, StoreError, WriteBatch, WriteOp};
use crate::engine::models::{
    Award, BuybackOffer, Position, PricePoint, Side, Stock, Transaction, UserAccount,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Executor, FromRow, PgPool, Postgres};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stocks (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    total_shares BIGINT NOT NULL,
    available_shares BIGINT NOT NULL,
    current_price NUMERIC NOT NULL,
    creator_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS accounts (
    id UUID PRIMARY KEY,
    username TEXT NOT NULL,
    balance NUMERIC NOT NULL,
    banned_until TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS positions (
    user_id UUID NOT NULL,
    stock_id UUID NOT NULL,
    shares BIGINT NOT NULL,
    avg_buy_price NUMERIC NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, stock_id)
);
CREATE TABLE IF NOT EXISTS transactions (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    stock_id UUID NOT NULL,
    side TEXT NOT NULL,
    shares BIGINT NOT NULL,
    price_per_share NUMERIC NOT NULL,
    total_amount NUMERIC NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS price_history (
    id UUID PRIMARY KEY,
    stock_id UUID NOT NULL,
    price NUMERIC NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS buyback_offers (
    id UUID PRIMARY KEY,
    stock_id UUID NOT NULL,
    created_by UUID NOT NULL,
    offered_price NUMERIC NOT NULL,
    target_users UUID[],
    target_shares BIGINT,
    accepted_shares BIGINT NOT NULL,
    accepted_by_users UUID[] NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS awards (
    user_id UUID NOT NULL,
    kind TEXT NOT NULL,
    granted_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, kind)
);
"#;

// =====================================================
// ROW TYPES
// =====================================================

fn to_count(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::CorruptRow(format!("negative {}", column)))
}

fn to_db(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{} = {}", column, value)))
}

#[derive(FromRow)]
struct StockRow {
    id: Uuid,
    name: String,
    total_shares: i64,
    available_shares: i64,
    current_price: Decimal,
    creator_id: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<StockRow> for Stock {
    type Error = StoreError;

    fn try_from(r: StockRow) -> Result<Self, Self::Error> {
        Ok(Stock {
            id: r.id,
            name: r.name,
            total_shares: to_count(r.total_shares, "total_shares")?,
            available_shares: to_count(r.available_shares, "available_shares")?,
            current_price: r.current_price,
            creator_id: r.creator_id,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
struct PositionRow {
    user_id: Uuid,
    stock_id: Uuid,
    shares: i64,
    avg_buy_price: Decimal,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = StoreError;

    fn try_from(r: PositionRow) -> Result<Self, Self::Error> {
        Ok(Position {
            user_id: r.user_id,
            stock_id: r.stock_id,
            shares: to_count(r.shares, "shares")?,
            avg_buy_price: r.avg_buy_price,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    stock_id: Uuid,
    side: String,
    shares: i64,
    price_per_share: Decimal,
    total_amount: Decimal,
    executed_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(r: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: r.id,
            user_id: r.user_id,
            stock_id: r.stock_id,
            side: r.side.parse::<Side>().map_err(StoreError::CorruptRow)?,
            shares: to_count(r.shares, "shares")?,
            price_per_share: r.price_per_share,
            total_amount: r.total_amount,
            executed_at: r.executed_at,
        })
    }
}

#[derive(FromRow)]
struct OfferRow {
    id: Uuid,
    stock_id: Uuid,
    created_by: Uuid,
    offered_price: Decimal,
    target_users: Option<Vec<Uuid>>,
    target_shares: Option<i64>,
    accepted_shares: i64,
    accepted_by_users: Vec<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<OfferRow> for BuybackOffer {
    type Error = StoreError;

    fn try_from(r: OfferRow) -> Result<Self, Self::Error> {
        Ok(BuybackOffer {
            id: r.id,
            stock_id: r.stock_id,
            created_by: r.created_by,
            offered_price: r.offered_price,
            target_users: r.target_users,
            target_shares: r
                .target_shares
                .map(|v| to_count(v, "target_shares"))
                .transpose()?,
            accepted_shares: to_count(r.accepted_shares, "accepted_shares")?,
            accepted_by_users: r.accepted_by_users,
            status: r.status.parse().map_err(StoreError::CorruptRow)?,
            created_at: r.created_at,
            expires_at: r.expires_at,
        })
    }
}

#[derive(FromRow)]
struct AwardRow {
    user_id: Uuid,
    kind: String,
    granted_at: DateTime<Utc>,
}

// =====================================================
// STORE
// =====================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        (&self.pool).execute(SCHEMA).await?;
        tracing::info!("Database schema ready");
        Ok(())
    }

    async fn apply(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        op: &WriteOp,
    ) -> Result<(), StoreError> {
        match op {
            WriteOp::UpsertStock(s) => {
                sqlx::query(
                    r#"INSERT INTO stocks (id, name, total_shares, available_shares,
                                          current_price, creator_id, created_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7)
                       ON CONFLICT (id) DO UPDATE SET
                           name = $2,
                           total_shares = $3,
                           available_shares = $4,
                           current_price = $5"#,
                )
                .bind(s.id)
                .bind(&s.name)
                .bind(to_db(s.total_shares, "total_shares")?)
                .bind(to_db(s.available_shares, "available_shares")?)
                .bind(s.current_price)
                .bind(s.creator_id)
                .bind(s.created_at)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::UpsertAccount(a) => {
                sqlx::query(
                    r#"INSERT INTO accounts (id, username, balance, banned_until)
                       VALUES ($1, $2, $3, $4)
                       ON CONFLICT (id) DO UPDATE SET
                           username = $2, balance = $3, banned_until = $4"#,
                )
                .bind(a.id)
                .bind(&a.username)
                .bind(a.balance)
                .bind(a.banned_until)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::UpsertPosition(p) => {
                sqlx::query(
                    r#"INSERT INTO positions (user_id, stock_id, shares, avg_buy_price, updated_at)
                       VALUES ($1, $2, $3, $4, $5)
                       ON CONFLICT (user_id, stock_id) DO UPDATE SET
                           shares = $3, avg_buy_price = $4, updated_at = $5"#,
                )
                .bind(p.user_id)
                .bind(p.stock_id)
                .bind(to_db(p.shares, "shares")?)
                .bind(p.avg_buy_price)
                .bind(p.updated_at)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::DeletePosition { user_id, stock_id } => {
                sqlx::query("DELETE FROM positions WHERE user_id = $1 AND stock_id = $2")
                    .bind(user_id)
                    .bind(stock_id)
                    .execute(&mut **tx)
                    .await?;
            }
            WriteOp::InsertTransaction(t) => {
                sqlx::query(
                    r#"INSERT INTO transactions (id, user_id, stock_id, side, shares,
                                                price_per_share, total_amount, executed_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
                )
                .bind(t.id)
                .bind(t.user_id)
                .bind(t.stock_id)
                .bind(t.side.as_str())
                .bind(to_db(t.shares, "shares")?)
                .bind(t.price_per_share)
                .bind(t.total_amount)
                .bind(t.executed_at)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::InsertPricePoint(p) => {
                sqlx::query(
                    "INSERT INTO price_history (id, stock_id, price, recorded_at) VALUES ($1, $2, $3, $4)",
                )
                .bind(p.id)
                .bind(p.stock_id)
                .bind(p.price)
                .bind(p.recorded_at)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::UpsertOffer(o) => {
                sqlx::query(
                    r#"INSERT INTO buyback_offers (id, stock_id, created_by, offered_price,
                                                  target_users, target_shares, accepted_shares,
                                                  accepted_by_users, status, created_at, expires_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                       ON CONFLICT (id) DO UPDATE SET
                           accepted_shares = $7,
                           accepted_by_users = $8,
                           status = $9"#,
                )
                .bind(o.id)
                .bind(o.stock_id)
                .bind(o.created_by)
                .bind(o.offered_price)
                .bind(o.target_users.clone())
                .bind(o.target_shares.map(|n| to_db(n, "target_shares")).transpose()?)
                .bind(to_db(o.accepted_shares, "accepted_shares")?)
                .bind(o.accepted_by_users.clone())
                .bind(o.status.as_str())
                .bind(o.created_at)
                .bind(o.expires_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load(&self) -> Result<MarketSnapshot, StoreError> {
        let stocks: Vec<StockRow> = sqlx::query_as(
            "SELECT id, name, total_shares, available_shares, current_price, creator_id, created_at FROM stocks",
        )
        .fetch_all(&self.pool)
        .await?;

        let accounts: Vec<(Uuid, String, Decimal, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT id, username, balance, banned_until FROM accounts")
                .fetch_all(&self.pool)
                .await?;

        let positions: Vec<PositionRow> = sqlx::query_as(
            "SELECT user_id, stock_id, shares, avg_buy_price, updated_at FROM positions WHERE shares > 0",
        )
        .fetch_all(&self.pool)
        .await?;

        let transactions: Vec<TransactionRow> = sqlx::query_as(
            r#"SELECT id, user_id, stock_id, side, shares, price_per_share, total_amount, executed_at
               FROM transactions ORDER BY executed_at"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let price_history: Vec<(Uuid, Uuid, Decimal, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, stock_id, price, recorded_at FROM price_history ORDER BY recorded_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let offers: Vec<OfferRow> = sqlx::query_as(
            r#"SELECT id, stock_id, created_by, offered_price, target_users, target_shares,
                      accepted_shares, accepted_by_users, status, created_at, expires_at
               FROM buyback_offers"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let awards: Vec<AwardRow> =
            sqlx::query_as("SELECT user_id, kind, granted_at FROM awards")
                .fetch_all(&self.pool)
                .await?;

        let snapshot = MarketSnapshot {
            stocks: stocks.into_iter().map(Stock::try_from).collect::<Result<_, _>>()?,
            accounts: accounts
                .into_iter()
                .map(|(id, username, balance, banned_until)| UserAccount {
                    id,
                    username,
                    balance,
                    banned_until,
                })
                .collect(),
            positions: positions
                .into_iter()
                .map(Position::try_from)
                .collect::<Result<_, _>>()?,
            transactions: transactions
                .into_iter()
                .map(Transaction::try_from)
                .collect::<Result<_, _>>()?,
            price_history: price_history
                .into_iter()
                .map(|(id, stock_id, price, recorded_at)| PricePoint {
                    id,
                    stock_id,
                    price,
                    recorded_at,
                })
                .collect(),
            offers: offers
                .into_iter()
                .map(BuybackOffer::try_from)
                .collect::<Result<_, _>>()?,
            awards: awards
                .into_iter()
                .map(|r| {
                    Ok(Award {
                        user_id: r.user_id,
                        kind: r.kind.parse().map_err(StoreError::CorruptRow)?,
                        granted_at: r.granted_at,
                    })
                })
                .collect::<Result<_, StoreError>>()?,
        };

        tracing::info!(
            stocks = snapshot.stocks.len(),
            accounts = snapshot.accounts.len(),
            positions = snapshot.positions.len(),
            offers = snapshot.offers.len(),
            "Loaded market snapshot from database"
        );
        Ok(snapshot)
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in &batch.ops {
            if let Err(e) = Self::apply(&mut tx, op).await {
                tracing::warn!(op = op.kind(), error = %e, "Batch write failed, rolling back");
                tx.rollback().await?;
                return Err(e);
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_award(&self, award: &Award) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO awards (user_id, kind, granted_at) VALUES ($1, $2, $3)
               ON CONFLICT (user_id, kind) DO NOTHING"#,
        )
        .bind(award.user_id)
        .bind(award.kind.as_str())
        .bind(award.granted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_above_bigint_are_refused() {
        assert_eq!(to_db(42, "shares").unwrap(), 42);
        assert_eq!(to_db(i64::MAX as u64, "shares").unwrap(), i64::MAX);
        assert!(matches!(
            to_db(u64::MAX, "total_shares"),
            Err(StoreError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_negative_counts_are_corrupt() {
        assert_eq!(to_count(7, "shares").unwrap(), 7);
        assert!(matches!(to_count(-1, "shares"), Err(StoreError::CorruptRow(_))));
    }
}
