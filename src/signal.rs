use crate::market_data::Candle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Scoring failed: {0}")]
    Scoring(String),
}

#[derive(Debug, Clone)]
pub struct SignalRequest {
    pub user_id: String,
    pub symbol: String,
    pub candles: Vec<Candle>,
}

/// Opaque strategy verdict. The indicator math behind `score` and
/// `feature_vector` lives outside this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalScore {
    pub tradable: bool,
    pub score: f64,
    pub grade: String,
    pub entry_price: Decimal,
    pub suggested_stop_loss: Decimal,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub feature_vector: HashMap<String, f64>,
}

#[async_trait]
pub trait SignalEngine: Send + Sync {
    async fn score(&self, request: &SignalRequest) -> Result<SignalScore, SignalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "BROKEN")]
    Broken,
}

/// Strategy-health verdict consulted between scoring and risk. A BROKEN
/// strategy short-circuits the pipeline regardless of score.
pub trait StrategyHealth: Send + Sync {
    fn status(&self, user_id: &str, symbol: &str) -> HealthStatus;
}

/// Default health source when none is wired: always healthy.
pub struct AlwaysHealthy;

impl StrategyHealth for AlwaysHealthy {
    fn status(&self, _user_id: &str, _symbol: &str) -> HealthStatus {
        HealthStatus::Healthy
    }
}
