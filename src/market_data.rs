use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("Market data unavailable: {0}")]
    Unavailable(String),
    #[error("Market data stale: {0}")]
    Stale(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAsk {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorporateAction {
    pub symbol: String,
    pub kind: String,
    pub ex_date: NaiveDate,
}

/// Market data source consumed by the pipeline and the correlation service.
/// Implementations live outside this core.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        bars: usize,
    ) -> Result<Vec<Candle>, MarketDataError>;

    async fn get_bid_ask(&self, symbol: &str) -> Result<BidAsk, MarketDataError>;

    async fn get_corporate_actions(
        &self,
        symbol: &str,
    ) -> Result<Vec<CorporateAction>, MarketDataError>;
}

/// Average true range over the trailing `period` bars. Candles are oldest
/// first. Returns None with fewer than two bars.
pub fn average_true_range(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < 2 || period == 0 {
        return None;
    }
    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for window in candles.windows(2) {
        let prev_close = window[0].close;
        let c = &window[1];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        true_ranges.push(tr.to_f64().unwrap_or(0.0));
    }
    let tail = true_ranges.len().min(period);
    let slice = &true_ranges[true_ranges.len() - tail..];
    Some(slice.iter().sum::<f64>() / slice.len() as f64)
}
