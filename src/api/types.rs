//! Order wire types shared by connectors.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{OrderType, Side};

/// Order submitted to the exchange. `client_order_id` is our trade id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub client_order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

/// Outcome of an order submission as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum AckStatus {
    /// Resting; a fill confirmation will follow
    Accepted,
    /// Filled synchronously
    Filled { executed_price: Decimal, fees: Decimal },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: AckStatus,
}

/// Order response body from `POST /orders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderResponse {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub executed_price: Option<Decimal>,
    #[serde(default)]
    pub fees: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl OrderResponse {
    pub fn into_ack(self) -> Result<OrderAck, String> {
        let status = match self.status.to_ascii_lowercase().as_str() {
            "accepted" | "new" | "open" | "pending" => AckStatus::Accepted,
            "filled" => {
                let executed_price = self
                    .executed_price
                    .ok_or_else(|| "filled order without executedPrice".to_string())?;
                AckStatus::Filled {
                    executed_price,
                    fees: self.fees.unwrap_or(Decimal::ZERO),
                }
            }
            "rejected" => AckStatus::Rejected {
                reason: self.reason.unwrap_or_else(|| "rejected by exchange".to_string()),
            },
            other => return Err(format!("unknown order status: {}", other)),
        };

        Ok(OrderAck {
            order_id: self.order_id,
            status,
        })
    }
}

/// Price response from `GET /price/{pair}`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PriceResponse {
    pub price: Decimal,
}

/// Capital response from `GET /accounts/{user}/capital`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CapitalResponse {
    pub capital: Decimal,
}
