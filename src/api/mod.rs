//! Exchange connector interface and an HTTP implementation.

mod http_connector;
mod types;

pub use http_connector::HttpExchangeConnector;
pub use types::{AckStatus, OrderAck, OrderRequest};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ConnectorError;

/// Everything the engine needs from an exchange. Fill confirmations for
/// pending orders come back through `ExecutionEngine::on_fill_confirmed`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Latest traded price for a base symbol.
    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, ConnectorError>;

    /// Capital available to the user for sizing, in quote currency.
    async fn get_account_capital(&self, user_id: &str) -> Result<Decimal, ConnectorError>;

    /// Submit an order. `Ok` with `AckStatus::Rejected` is an exchange-side refusal.
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, ConnectorError>;
}
