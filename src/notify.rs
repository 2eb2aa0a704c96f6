//! Fire-and-forget notifications emitted by the engine.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Domain events published after state has been committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    TradeFilled {
        user_id: String,
        trade_id: String,
        symbol: String,
        strategy_name: String,
        pnl: Decimal,
    },
    TradeCancelled {
        user_id: String,
        trade_id: String,
        reason: String,
    },
    EmergencyStopTriggered {
        user_id: String,
        reason: String,
    },
}

/// Receives engine events. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: EngineEvent);
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: EngineEvent) {
        match &event {
            EngineEvent::TradeFilled { user_id, trade_id, symbol, pnl, .. } => {
                info!(user_id = %user_id, trade_id = %trade_id, symbol = %symbol, pnl = %pnl, "Trade filled");
            }
            EngineEvent::TradeCancelled { user_id, trade_id, reason } => {
                info!(user_id = %user_id, trade_id = %trade_id, reason = %reason, "Trade cancelled");
            }
            EngineEvent::EmergencyStopTriggered { user_id, reason } => {
                warn!(user_id = %user_id, reason = %reason, "Emergency stop triggered");
            }
        }
    }
}

/// Forwards events into an unbounded channel; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: UnboundedSender<EngineEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
