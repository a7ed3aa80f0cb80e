//! Trading Engine Module
//! Market state, pricing, position accounting and the operations over them

pub mod buyback;
pub mod error;
pub mod locks;
pub mod market_data;
pub mod market_state;
pub mod models;
pub mod position_keeper;
pub mod pricing;
pub mod trading_engine;

pub use error::TradeError;
pub use market_state::MarketState;
pub use position_keeper::PositionKeeper;
pub use trading_engine::{EngineSettings, TradingEngine};
