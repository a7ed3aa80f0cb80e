//! Prometheus Metrics for the Exchange
//! Trade outcomes, rollbacks, latency and side-effect health

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub struct Metrics {
    pub trades_total: CounterVec,
    pub trade_rollbacks_total: CounterVec,
    pub operation_duration: HistogramVec,
    pub side_effect_failures_total: CounterVec,
    pub awards_granted_total: CounterVec,
    pub active_positions: Gauge,
    pub listed_stocks: Gauge,
    pub retry_attempts_total: CounterVec,
}

static METRICS: OnceCell<Metrics> = OnceCell::new();

/// Initialize metrics
pub fn init_metrics(service_name: &str) -> anyhow::Result<()> {
    let trades_total = CounterVec::new(
        Opts::new("trades_total", "Trading operations by outcome")
            .namespace("exchange")
            .const_label("service", service_name),
        &["operation", "outcome"],
    )?;

    let trade_rollbacks_total = CounterVec::new(
        Opts::new("trade_rollbacks_total", "Optimistic updates rolled back after a failed commit")
            .namespace("exchange")
            .const_label("service", service_name),
        &["operation"],
    )?;

    let operation_duration = HistogramVec::new(
        HistogramOpts::new(
            "operation_duration_seconds",
            "Engine operation latency in seconds, commit included",
        )
        .namespace("exchange")
        .const_label("service", service_name)
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation"],
    )?;

    let side_effect_failures_total = CounterVec::new(
        Opts::new("side_effect_failures_total", "Best-effort side effects that failed")
            .namespace("exchange"),
        &["event"],
    )?;

    let awards_granted_total = CounterVec::new(
        Opts::new("awards_granted_total", "Awards granted").namespace("exchange"),
        &["award"],
    )?;

    let active_positions = Gauge::with_opts(
        Opts::new("active_positions", "Number of open positions").namespace("exchange"),
    )?;

    let listed_stocks = Gauge::with_opts(
        Opts::new("listed_stocks", "Number of listed stocks").namespace("exchange"),
    )?;

    let retry_attempts_total = CounterVec::new(
        Opts::new("retry_attempts_total", "Total retry attempts").namespace("exchange"),
        &["operation", "outcome"],
    )?;

    REGISTRY.register(Box::new(trades_total.clone()))?;
    REGISTRY.register(Box::new(trade_rollbacks_total.clone()))?;
    REGISTRY.register(Box::new(operation_duration.clone()))?;
    REGISTRY.register(Box::new(side_effect_failures_total.clone()))?;
    REGISTRY.register(Box::new(awards_granted_total.clone()))?;
    REGISTRY.register(Box::new(active_positions.clone()))?;
    REGISTRY.register(Box::new(listed_stocks.clone()))?;
    REGISTRY.register(Box::new(retry_attempts_total.clone()))?;

    let metrics = Metrics {
        trades_total,
        trade_rollbacks_total,
        operation_duration,
        side_effect_failures_total,
        awards_granted_total,
        active_positions,
        listed_stocks,
        retry_attempts_total,
    };

    if METRICS.set(metrics).is_err() {
        anyhow::bail!("metrics already initialized");
    }

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Metrics handle, `None` until `init_metrics` has run.
pub fn get() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
