use crate::broker::adapter::{
    BrokerAck, BrokerError, BrokerOrder, BrokerOrderRequest, BrokerPort, BrokerPosition,
};
use crate::model::{OrderType, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Live REST broker backend (bearer-token JSON API).
///
/// Transport classification only lives here: timeouts and connection errors
/// become `Timeout`/`Network`, 429 becomes `RateLimited`, other 4xx are
/// terminal `Rejected`, 5xx are retryable `Http`. Retry policy itself is the
/// `ResilientBroker`'s job.
pub struct LiveBroker {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ApiOrder {
    id: String,
    client_order_id: Option<String>,
    symbol: String,
    side: String,
    qty: Decimal,
    filled_qty: Decimal,
    filled_avg_price: Option<Decimal>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiPosition {
    symbol: String,
    qty: Decimal,
    avg_entry_price: Decimal,
}

#[derive(Debug, Serialize)]
struct ApiOrderPayload<'a> {
    client_order_id: &'a str,
    symbol: &'a str,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
    time_in_force: &'a str,
}

impl LiveBroker {
    pub fn new(base_url: String, api_token: String, timeout_ms: u64) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| BrokerError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_token,
        })
    }

    fn map_transport_error(e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout
        } else {
            BrokerError::Network(e.to_string())
        }
    }

    async fn map_status_error(response: reqwest::Response) -> BrokerError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match status {
            429 => BrokerError::RateLimited,
            400..=499 => BrokerError::Rejected(format!("HTTP {}: {}", status, body)),
            _ => BrokerError::Http { status, body },
        }
    }

    fn side_str(side: Side) -> &'static str {
        match side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    fn parse_side(raw: &str) -> Side {
        if raw.eq_ignore_ascii_case("sell") {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[async_trait]
impl BrokerPort for LiveBroker {
    async fn open_orders(&self, user_id: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
        let url = format!("{}/v2/orders?status=open&account={}", self.base_url, user_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error(response).await);
        }

        let orders: Vec<ApiOrder> = response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        Ok(orders
            .into_iter()
            .map(|o| BrokerOrder {
                broker_order_id: o.id,
                client_order_id: o.client_order_id,
                symbol: o.symbol,
                side: Self::parse_side(&o.side),
                quantity: o.qty,
                filled_quantity: o.filled_qty,
                average_price: o.filled_avg_price,
                status: o.status,
            })
            .collect())
    }

    async fn open_positions(&self, user_id: &str) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/v2/positions?account={}", self.base_url, user_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error(response).await);
        }

        let positions: Vec<ApiPosition> = response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        Ok(positions
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                quantity: p.qty,
                average_entry_price: p.avg_entry_price,
            })
            .collect())
    }

    async fn place_order(
        &self,
        user_id: &str,
        request: BrokerOrderRequest,
    ) -> Result<BrokerAck, BrokerError> {
        let payload = ApiOrderPayload {
            client_order_id: &request.client_order_id,
            symbol: &request.symbol,
            side: Self::side_str(request.side),
            order_type: match request.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            qty: request.quantity,
            limit_price: request.limit_price,
            time_in_force: "day",
        };

        let url = format!("{}/v2/orders?account={}", self.base_url, user_id);
        info!(
            user_id,
            symbol = %request.symbol,
            client_order_id = %request.client_order_id,
            "Submitting live order"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            let err = Self::map_status_error(response).await;
            warn!(user_id, client_order_id = %request.client_order_id, %err, "Live order failed");
            return Err(err);
        }

        let order: ApiOrder = response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        Ok(BrokerAck {
            broker_order_id: order.id,
            status: order.status,
            filled_quantity: order.filled_qty,
            average_price: order.filled_avg_price,
        })
    }

    async fn cancel_order(
        &self,
        user_id: &str,
        broker_order_id: &str,
    ) -> Result<(), BrokerError> {
        let url = format!(
            "{}/v2/orders/{}?account={}",
            self.base_url, broker_order_id, user_id
        );
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error(response).await);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "live"
    }
}
