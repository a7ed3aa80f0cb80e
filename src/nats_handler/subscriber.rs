//! NATS Message Handler with Authentication
//! Request/reply front door for listing, trading, dilution, buybacks and queries

use crate::auth::{AuthContext, AuthService};
use crate::engine::models::{BuybackRequest, NewStock};
use crate::engine::{TradeError, TradingEngine};

use async_nats::Client;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const SUBJECT_PREFIX: &str = "exchange";

// =====================================================
// WIRE TYPES
// =====================================================

#[derive(Debug, Deserialize)]
struct AuthenticatedMessage<T> {
    token: String,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct TradeRequest {
    stock_id: Uuid,
    shares: u64,
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    stock_id: Uuid,
    new_shares: u64,
}

#[derive(Debug, Deserialize)]
struct AcceptRequest {
    offer_id: Uuid,
    shares: u64,
}

#[derive(Debug, Deserialize)]
struct OfferRef {
    offer_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct InflateRequest {
    percentage: Decimal,
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    user_id: Uuid,
    #[serde(default)]
    until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct Reply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl Reply {
    fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                error: None,
                code: None,
            },
            Err(e) => Self::error(format!("Failed to encode reply: {}", e)),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: None,
        }
    }

    fn rejected(e: &TradeError) -> Self {
        Self {
            code: Some(e.code()),
            ..Self::error(e.to_string())
        }
    }

    fn from_result<T: Serialize>(result: Result<T, TradeError>) -> Self {
        match result {
            Ok(data) => Self::ok(&data),
            Err(e) => Self::rejected(&e),
        }
    }
}

// =====================================================
// NATS SUBSCRIBER
// =====================================================

pub struct NatsSubscriber {
    client: Client,
    engine: Arc<TradingEngine>,
    auth_service: Arc<AuthService>,
}

impl NatsSubscriber {
    pub fn new(client: Client, engine: Arc<TradingEngine>, auth_service: Arc<AuthService>) -> Self {
        Self {
            client,
            engine,
            auth_service,
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut requests = self
            .client
            .subscribe(format!("{}.>", SUBJECT_PREFIX))
            .await?;

        tracing::info!(prefix = SUBJECT_PREFIX, "NATS subscriber running");

        while let Some(msg) = requests.next().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_message(msg).await;
            });
        }

        warn!("NATS subscription closed");
        Ok(())
    }

    async fn handle_message(&self, msg: async_nats::Message) {
        let subject: &str = &msg.subject;
        let action = subject
            .strip_prefix(SUBJECT_PREFIX)
            .and_then(|s| s.strip_prefix('.'))
            .unwrap_or_default();
        debug!(subject = subject, "Request received");

        let reply = self.route(action, &msg.payload).await;

        if let Some(reply_to) = msg.reply {
            match serde_json::to_vec(&reply) {
                Ok(body) => {
                    if let Err(e) = self.client.publish(reply_to, body.into()).await {
                        error!(subject = subject, error = %e, "Failed to publish reply");
                    }
                }
                Err(e) => error!(subject = subject, error = %e, "Failed to encode reply"),
            }
        }
    }

    /// Dispatch a request by the subject suffix after `exchange.`.
    pub async fn route(&self, action: &str, payload: &[u8]) -> Reply {
        let engine = &self.engine;
        match action {
            "account.open" => match self.parse::<Empty>(payload) {
                Ok((auth, _)) => Reply::from_result(engine.open_account(&auth).await),
                Err(reply) => reply,
            },
            "account.ban" => match self.parse::<BanRequest>(payload) {
                Ok((auth, req)) => {
                    Reply::from_result(engine.set_ban(&auth, req.user_id, req.until).await)
                }
                Err(reply) => reply,
            },
            "stock.create" => match self.parse::<NewStock>(payload) {
                Ok((auth, req)) => Reply::from_result(engine.create_stock(&auth, req).await),
                Err(reply) => reply,
            },
            "trade.buy" => match self.parse::<TradeRequest>(payload) {
                Ok((auth, req)) => {
                    Reply::from_result(engine.buy_stock(&auth, req.stock_id, req.shares).await)
                }
                Err(reply) => reply,
            },
            "trade.sell" => match self.parse::<TradeRequest>(payload) {
                Ok((auth, req)) => {
                    Reply::from_result(engine.sell_stock(&auth, req.stock_id, req.shares).await)
                }
                Err(reply) => reply,
            },
            "shares.create" => match self.parse::<IssueRequest>(payload) {
                Ok((auth, req)) => Reply::from_result(
                    engine
                        .create_shares(&auth, req.stock_id, req.new_shares)
                        .await,
                ),
                Err(reply) => reply,
            },
            "buyback.create" => match self.parse::<BuybackRequest>(payload) {
                Ok((auth, req)) => {
                    Reply::from_result(engine.create_buyback_offer(&auth, req).await)
                }
                Err(reply) => reply,
            },
            "buyback.accept" => match self.parse::<AcceptRequest>(payload) {
                Ok((auth, req)) => Reply::from_result(
                    engine
                        .accept_buyback_offer(&auth, req.offer_id, req.shares)
                        .await,
                ),
                Err(reply) => reply,
            },
            "buyback.decline" => match self.parse::<OfferRef>(payload) {
                Ok((auth, req)) => {
                    Reply::from_result(engine.decline_buyback_offer(&auth, req.offer_id).await)
                }
                Err(reply) => reply,
            },
            "buyback.cancel" => match self.parse::<OfferRef>(payload) {
                Ok((auth, req)) => {
                    Reply::from_result(engine.cancel_buyback_offer(&auth, req.offer_id).await)
                }
                Err(reply) => reply,
            },
            "market.inflate" => match self.parse::<InflateRequest>(payload) {
                Ok((auth, req)) => Reply::from_result(
                    engine
                        .inflate_market(&auth, req.percentage)
                        .await
                        .map(|stocks| serde_json::json!({ "stocks_adjusted": stocks })),
                ),
                Err(reply) => reply,
            },
            "market.data" => match self.parse::<Empty>(payload) {
                Ok(_) => Reply::ok(&serde_json::json!({
                    "points": engine.market_data().await,
                    "market_cap": engine.market_capitalization().await,
                    "stocks": engine.stocks().await,
                })),
                Err(reply) => reply,
            },
            "portfolio.query" => match self.parse::<Empty>(payload) {
                Ok((auth, _)) => self.portfolio(&auth).await,
                Err(reply) => reply,
            },
            other => {
                warn!(action = other, "Unknown request subject");
                Reply::error(format!("Unknown action: {}", other))
            }
        }
    }

    async fn portfolio(&self, auth: &AuthContext) -> Reply {
        let Some(account) = self.engine.account(auth.account_id).await else {
            return Reply::rejected(&TradeError::AccountNotFound(auth.account_id));
        };
        Reply::ok(&serde_json::json!({
            "account": account,
            "positions": self.engine.holdings(auth.account_id).await,
            "portfolio_value": self.engine.portfolio_value(auth.account_id).await,
            "transactions": self.engine.transactions_for(auth.account_id).await,
        }))
    }

    fn parse<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<(AuthContext, T), Reply> {
        let msg: AuthenticatedMessage<T> = serde_json::from_slice(payload)
            .map_err(|e| Reply::error(format!("Invalid payload: {}", e)))?;
        let auth = self
            .auth_service
            .authenticate(&msg.token)
            .map_err(|e| Reply::error(e.to_string()))?;
        Ok((auth, msg.data))
    }
}
