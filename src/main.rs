//! Exchange Core - character stock market service
//! Postgres persistence | NATS request/reply | Health & metrics

use exchange_core::auth::AuthService;
use exchange_core::config::Config;
use exchange_core::engine::{EngineSettings, TradingEngine};
use exchange_core::events::{AwardService, EventDispatcher};
use exchange_core::nats_handler::NatsSubscriber;
use exchange_core::notify::{NatsNotifier, Notifier};
use exchange_core::observability::{
    self,
    health::{start_health_server, HealthState},
};
use exchange_core::resilience::{with_retry_async, RetryConfig};
use exchange_core::store::{PgStore, Store};

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    observability::init_observability("exchange-core")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Exchange Core..."
    );

    let nats_connected = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicBool::new(false));

    // Database pool with retry
    let pool = with_retry_async("database_connect", &RetryConfig::default(), || async {
        PgPoolOptions::new()
            .min_connections(config.pool_min_connections)
            .max_connections(config.pool_max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.database_url)
            .await
    })
    .await?;
    info!("Connected to PostgreSQL");

    let pg_store = PgStore::new(pool.clone());
    pg_store.ensure_schema().await?;
    let store: Arc<dyn Store> = Arc::new(pg_store);

    let snapshot = store.load().await?;
    let existing_awards = snapshot.awards.clone();
    let (engine, events) = TradingEngine::new(
        store.clone(),
        snapshot,
        EngineSettings {
            starting_balance: config.starting_balance,
        },
    );
    let engine = Arc::new(engine);
    info!("Market state loaded from database");

    let auth_service = Arc::new(AuthService::new(&config.jwt_secret));

    // NATS with retry
    let nats_client = with_retry_async("nats_connect", &RetryConfig::default(), || async {
        async_nats::connect(&config.nats_url).await
    })
    .await?;
    nats_connected.store(true, Ordering::Relaxed);
    info!(url = %config.nats_url, "Connected to NATS");

    // Side effects run off the request path
    let notifier: Arc<dyn Notifier> = Arc::new(NatsNotifier::new(
        nats_client.clone(),
        config.notification_subject.clone(),
    ));
    let awards = Arc::new(AwardService::new(
        store.clone(),
        notifier.clone(),
        existing_awards,
    ));
    let dispatcher = tokio::spawn(EventDispatcher::new(awards, notifier).run(events));

    // Periodic offer expiry
    let sweeper_engine = engine.clone();
    let sweep_every = Duration::from_secs(config.offer_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            sweeper_engine.expire_buyback_offers(Utc::now()).await;
        }
    });

    let health_state = HealthState {
        db_pool: pool.clone(),
        nats_connected: nats_connected.clone(),
        ready: ready.clone(),
        engine: engine.clone(),
    };
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(metrics_port, health_state).await {
            error!(error = %e, "Health server failed");
        }
    });

    let subscriber = Arc::new(NatsSubscriber::new(nats_client, engine.clone(), auth_service));
    ready.store(true, Ordering::Relaxed);

    tokio::select! {
        result = subscriber.run() => {
            if let Err(e) = result {
                error!(error = %e, "Subscriber error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    ready.store(false, Ordering::Relaxed);
    dispatcher.abort();
    pool.close().await;
    info!("Exchange Core stopped");
    Ok(())
}
