//! Exchange status endpoints
//! Liveness, readiness against Postgres and NATS, a market summary and Prometheus scrape

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

use super::metrics::encode_metrics;
use crate::engine::TradingEngine;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: PgPool,
    pub nats_connected: Arc<AtomicBool>,
    pub ready: Arc<AtomicBool>,
    pub engine: Arc<TradingEngine>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Probe {
    Up {
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },
    Down {
        reason: String,
    },
}

impl Probe {
    fn is_up(&self) -> bool {
        matches!(self, Probe::Up { .. })
    }
}

#[derive(Serialize)]
struct MarketSummary {
    listed_stocks: usize,
    market_cap: Decimal,
}

#[derive(Serialize)]
struct StatusReport {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    market: MarketSummary,
    database: Probe,
    nats: Probe,
}

static STARTED: OnceLock<Instant> = OnceLock::new();

#[instrument(skip(state))]
pub async fn start_health_server(port: u16, state: HealthState) -> anyhow::Result<()> {
    STARTED.get_or_init(Instant::now);

    let app = Router::new()
        .route("/health", get(status))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(scrape))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port = port, "Status server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn probe_database(pool: &PgPool) -> Probe {
    let start = Instant::now();
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => Probe::Up {
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            warn!(error = %e, "Database probe failed");
            Probe::Down {
                reason: e.to_string(),
            }
        }
    }
}

fn probe_nats(connected: &AtomicBool) -> Probe {
    if connected.load(Ordering::Relaxed) {
        Probe::Up { latency_ms: None }
    } else {
        Probe::Down {
            reason: "disconnected".to_string(),
        }
    }
}

async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    let database = probe_database(&state.db_pool).await;
    let nats = probe_nats(&state.nats_connected);
    let up = database.is_up() && nats.is_up();

    let report = StatusReport {
        status: if up { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: STARTED.get().map_or(0, |t| t.elapsed().as_secs()),
        market: MarketSummary {
            listed_stocks: state.engine.stocks().await.len(),
            market_cap: state.engine.market_capitalization().await,
        },
        database,
        nats,
    };

    let code = if up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Ready once startup has loaded the market and both backends answer.
async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "starting" })),
        );
    }

    let database = probe_database(&state.db_pool).await.is_up();
    let nats = probe_nats(&state.nats_connected).is_up();
    let (code, label) = if database && nats {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        code,
        Json(serde_json::json!({
            "status": label,
            "database": database,
            "nats": nats,
        })),
    )
}

async fn scrape() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
