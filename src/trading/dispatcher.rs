//! Execution dispatch: simulated fills for paper accounts, exchange orders otherwise.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{AckStatus, ExchangeConnector, OrderRequest};
use crate::models::Trade;

/// How a dispatched trade resolved at submission time.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// Filled immediately, either simulated or synchronously by the exchange
    Filled {
        executed_price: Decimal,
        fees: Decimal,
        order_id: Option<String>,
    },
    /// Resting on the exchange, fill confirmation pending
    Pending { order_id: String },
    /// Submission failed or was refused
    Rejected { reason: String },
}

pub struct ExecutionDispatcher {
    connector: Arc<dyn ExchangeConnector>,
    paper_fee_rate: Decimal,
}

impl ExecutionDispatcher {
    pub fn new(connector: Arc<dyn ExchangeConnector>, paper_fee_rate: Decimal) -> Self {
        Self {
            connector,
            paper_fee_rate,
        }
    }

    pub async fn dispatch(&self, trade: &Trade, paper_trading: bool) -> DispatchResult {
        if paper_trading {
            self.simulate(trade)
        } else {
            self.submit(trade).await
        }
    }

    /// Fill at the requested price without touching the exchange.
    pub fn simulate(&self, trade: &Trade) -> DispatchResult {
        let fees = trade.notional() * self.paper_fee_rate;

        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            side = trade.side.as_str(),
            quantity = %trade.quantity,
            price = %trade.requested_price,
            "Paper fill"
        );

        DispatchResult::Filled {
            executed_price: trade.requested_price,
            fees,
            order_id: None,
        }
    }

    /// Submit to the exchange connector. Errors become `Rejected`.
    pub async fn submit(&self, trade: &Trade) -> DispatchResult {
        let order = OrderRequest {
            client_order_id: trade.id.clone(),
            user_id: trade.user_id.clone(),
            symbol: trade.symbol.clone(),
            side: trade.side,
            order_type: trade.order_type,
            quantity: trade.quantity,
            price: Some(trade.requested_price),
        };

        match self.connector.submit_order(&order).await {
            Ok(ack) => match ack.status {
                AckStatus::Accepted => {
                    info!(trade_id = %trade.id, order_id = %ack.order_id, "Order accepted");
                    DispatchResult::Pending { order_id: ack.order_id }
                }
                AckStatus::Filled { executed_price, fees } if executed_price <= Decimal::ZERO || fees < Decimal::ZERO => {
                    // Settlement waits for a confirmation carrying a usable price
                    warn!(trade_id = %trade.id, order_id = %ack.order_id, price = %executed_price, fees = %fees, "Ignoring unusable fill on submission");
                    DispatchResult::Pending { order_id: ack.order_id }
                }
                AckStatus::Filled { executed_price, fees } => {
                    info!(trade_id = %trade.id, order_id = %ack.order_id, price = %executed_price, "Order filled on submission");
                    DispatchResult::Filled {
                        executed_price,
                        fees,
                        order_id: Some(ack.order_id),
                    }
                }
                AckStatus::Rejected { reason } => {
                    warn!(trade_id = %trade.id, reason = %reason, "Order rejected by exchange");
                    DispatchResult::Rejected { reason }
                }
            },
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "Order submission failed");
                DispatchResult::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }
}
