//! REST exchange connector.
//!
//! Endpoints:
//! - `GET  {base}/price/{pair}` -> `{"price": "..."}`
//! - `GET  {base}/accounts/{user}/capital` -> `{"capital": "..."}`
//! - `POST {base}/orders` -> `{"orderId": "...", "status": "accepted|filled|rejected", ...}`
//!
//! Reads are retried with exponential backoff; order submission is not.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{CapitalResponse, OrderAck, OrderRequest, OrderResponse, PriceResponse};
use super::ExchangeConnector;
use crate::error::ConnectorError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(10);

/// Connector for an exchange gateway speaking the JSON protocol above.
pub struct HttpExchangeConnector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// Appended to base symbols to form the exchange pair, e.g. `BTC` -> `BTCUSDT`
    quote_currency: String,
}

impl HttpExchangeConnector {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, quote_currency: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            quote_currency: quote_currency.into(),
        })
    }

    fn pair(&self, symbol: &str) -> String {
        format!("{}{}", symbol, self.quote_currency)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn backoff_policy() -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(MAX_RETRY_ELAPSED))
            .build()
    }

    /// GET with retries on transient failures.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ConnectorError> {
        debug!(url = %url, "GET");

        retry(Self::backoff_policy(), || async move {
            match self.send_get(url).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(url = %url, error = %e, "Retrying exchange request");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn send_get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ConnectorError> {
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(map_transport_error)?;

        read_json(response).await
    }
}

fn map_transport_error(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout(e.to_string())
    } else {
        ConnectorError::Network(e.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ConnectorError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ConnectorError::Api {
            status_code: status.as_u16(),
            message,
        });
    }

    response
        .json()
        .await
        .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl ExchangeConnector for HttpExchangeConnector {
    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, ConnectorError> {
        let url = format!("{}/price/{}", self.base_url, self.pair(symbol));
        let body: PriceResponse = self.get_json(&url).await?;
        if body.price <= Decimal::ZERO {
            return Err(ConnectorError::InvalidResponse(format!(
                "non-positive price {} for {}",
                body.price, symbol
            )));
        }
        Ok(body.price)
    }

    async fn get_account_capital(&self, user_id: &str) -> Result<Decimal, ConnectorError> {
        let url = format!("{}/accounts/{}/capital", self.base_url, user_id);
        let body: CapitalResponse = self.get_json(&url).await?;
        Ok(body.capital)
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, ConnectorError> {
        let url = format!("{}/orders", self.base_url);
        let payload = OrderRequest {
            symbol: self.pair(&order.symbol),
            ..order.clone()
        };

        debug!(trade_id = %order.client_order_id, symbol = %payload.symbol, "Submitting order");

        let response = self
            .authorized(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let message = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Rejected(message));
        }

        let body: OrderResponse = read_json(response).await?;
        body.into_ack().map_err(ConnectorError::InvalidResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_and_base_url() {
        let connector =
            HttpExchangeConnector::new("http://localhost:9000/", None, "USDT").unwrap();
        assert_eq!(connector.base_url, "http://localhost:9000");
        assert_eq!(connector.pair("ETH"), "ETHUSDT");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_network_error() {
        let connector = HttpExchangeConnector::new("http://127.0.0.1:1", None, "USDT").unwrap();
        let order = OrderRequest {
            client_order_id: "t-1".to_string(),
            user_id: "u1".to_string(),
            symbol: "BTC".to_string(),
            side: crate::models::Side::Buy,
            order_type: crate::models::OrderType::Market,
            quantity: Decimal::ONE,
            price: None,
        };

        let err = connector.submit_order(&order).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Network(_) | ConnectorError::Timeout(_)));
    }
}
