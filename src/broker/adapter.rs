use crate::model::{OrderType, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Broker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Rate limited by broker")]
    RateLimited,
    #[error("Order rejected: {0}")]
    Rejected(String),
    #[error("Broker circuit open — backing off")]
    CircuitOpen,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Transient failures worth another attempt. Rejections and client
    /// errors are terminal; a circuit-open is handled by backing off, not
    /// retrying into a known-bad dependency.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Timeout | BrokerError::Network(_) | BrokerError::RateLimited => true,
            BrokerError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// An open order as the broker reports it.
#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    /// Raw venue status string, normalized via `OrderState::from_broker_status`.
    pub status: String,
}

/// A net position as the broker reports it. Quantity is signed: negative
/// means short.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct BrokerOrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct BrokerAck {
    pub broker_order_id: String,
    pub status: String,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
}

/// Uniform interface over broker backends. Implemented once per venue mode
/// (paper simulator, live REST); everything above this trait depends only on
/// the interface.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn open_orders(&self, user_id: &str) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn open_positions(&self, user_id: &str) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn place_order(
        &self,
        user_id: &str,
        request: BrokerOrderRequest,
    ) -> Result<BrokerAck, BrokerError>;

    async fn cancel_order(&self, user_id: &str, broker_order_id: &str)
        -> Result<(), BrokerError>;

    /// Backend name, e.g. "paper" or "live".
    fn name(&self) -> &str;
}
