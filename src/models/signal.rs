//! Canonical trading signal produced by the ingestor.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// +1 for BUY, -1 for SELL.
    pub fn multiplier(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Case-insensitive parse of `BUY` / `SELL`.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order type requested by the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

/// Where a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Webhook,
    Ai,
    Manual,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Webhook => "webhook",
            SignalSource::Ai => "ai",
            SignalSource::Manual => "manual",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "webhook" | "tradingview" => Some(SignalSource::Webhook),
            "ai" => Some(SignalSource::Ai),
            "manual" => Some(SignalSource::Manual),
            _ => None,
        }
    }
}

/// A normalized instruction proposing a trade. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Base asset symbol with the quote suffix removed (e.g. `BTC`)
    pub symbol: String,

    pub side: Side,

    pub order_type: OrderType,

    /// Requested price; `None` means "use the current market price"
    pub price: Option<Decimal>,

    /// Explicit quantity; still capped by the sizer
    pub quantity: Option<Decimal>,

    /// Confidence on a 0-100 scale
    pub confidence: Option<Decimal>,

    pub strategy_name: String,

    pub source: SignalSource,
}
