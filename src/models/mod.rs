//! Data models for signals, risk state, strategies, and trades.

mod account;
mod risk;
mod signal;
mod strategy;
mod trade;

pub use account::UserAccount;
pub use risk::{CoinSettings, RiskSettings, RiskState, StopOrigin, TradingHours};
pub use signal::{OrderType, Side, Signal, SignalSource};
pub use strategy::{StrategyState, INITIAL_CONFIDENCE, MAX_CONFIDENCE, MIN_CONFIDENCE};
pub use trade::{Trade, TradeStatus};

#[cfg(test)]
pub(crate) use trade::fixtures;
