//! Exchange Core - character stock market engine
//! Pricing, trading, dilution and buybacks over an in-memory market backed by Postgres

pub mod auth;
pub mod config;
pub mod engine;
pub mod events;
pub mod nats_handler;
pub mod notify;
pub mod observability;
pub mod resilience;
pub mod store;
