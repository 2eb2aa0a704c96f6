//! Error types for signal ingestion, risk gating, execution, and persistence.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::TradeStatus;

/// Raised by the ingestor when a payload cannot become a `Signal`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("invalid signal format: {0}")]
    InvalidSignalFormat(String),
}

impl SignalError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidSignalFormat(msg.into())
    }
}

/// Why the risk gate refused a signal. One variant per guard, in evaluation order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RiskViolation {
    #[error("coin {symbol} is not enabled for trading")]
    CoinDisabled { symbol: String },

    #[error("emergency stop active: {reason}")]
    EmergencyStopActive { reason: String },

    #[error("daily trade limit reached: {count} >= {limit}")]
    DailyTradeLimitExceeded { count: u32, limit: u32 },

    #[error("{losses} consecutive losses, trading paused")]
    ConsecutiveLossCutoff { losses: u32 },

    #[error("daily loss cap reached: |{daily_pnl}| >= {cap}")]
    DailyLossCapReached { daily_pnl: Decimal, cap: Decimal },

    #[error("outside configured trading hours")]
    TradingHoursClosed,

    #[error("confidence {} below threshold {threshold}", display_confidence(.confidence))]
    ConfidenceBelowThreshold {
        confidence: Option<Decimal>,
        threshold: Decimal,
    },
}

fn display_confidence(confidence: &Option<Decimal>) -> String {
    confidence.map_or_else(|| "missing".to_string(), |c| c.to_string())
}

impl RiskViolation {
    /// Stable machine-readable code for callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            RiskViolation::CoinDisabled { .. } => "COIN_DISABLED",
            RiskViolation::EmergencyStopActive { .. } => "EMERGENCY_STOP_ACTIVE",
            RiskViolation::DailyTradeLimitExceeded { .. } => "DAILY_TRADE_LIMIT_EXCEEDED",
            RiskViolation::ConsecutiveLossCutoff { .. } => "CONSECUTIVE_LOSS_CUTOFF",
            RiskViolation::DailyLossCapReached { .. } => "DAILY_LOSS_CAP_REACHED",
            RiskViolation::TradingHoursClosed => "TRADING_HOURS_CLOSED",
            RiskViolation::ConfidenceBelowThreshold { .. } => "CONFIDENCE_BELOW_THRESHOLD",
        }
    }
}

/// Failures reported by an exchange connector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {status_code} - {message}")]
    Api { status_code: u16, message: String },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timeout: {0}")]
    Timeout(String),
}

impl ConnectorError {
    /// Transient failures worth retrying on idempotent reads.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Network(_) | ConnectorError::Timeout(_) => true,
            ConnectorError::Api { status_code, .. } => *status_code == 429 || *status_code >= 500,
            _ => false,
        }
    }
}

/// Failures from the persistent store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Errors surfaced by the execution engine to its callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidSignal(#[from] SignalError),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("trade not found: {0}")]
    TradeNotFound(String),

    #[error("trade {trade_id} already {status}")]
    TradeAlreadyFinal { trade_id: String, status: TradeStatus },

    #[error("fill confirmation cannot carry status {0}")]
    InvalidFillStatus(TradeStatus),

    #[error("invalid fill: {0}")]
    InvalidFill(String),

    /// Persistence failed while holding the per-user lock; nothing was applied.
    #[error("internal state error: {0}")]
    InternalState(#[from] StoreError),
}
