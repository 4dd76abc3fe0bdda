use crate::config::CorrelationConfig;
use crate::context::ServiceContext;
use crate::market_data::{MarketDataError, MarketDataProvider};
use crate::model::{CorrelationRegime, CorrelationRegimeState};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RegimeError {
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Measures co-movement across a user's open book and emits the sizing
/// multiplier the hybrid sizer applies. Correlation runs on daily returns,
/// not raw prices — returns are scale-invariant, so a $500 and a $5 stock
/// compare cleanly.
pub struct CorrelationRegimeService {
    config: CorrelationConfig,
    market_data: Arc<dyn MarketDataProvider>,
    store: Arc<PersistenceStore>,
    ctx: Arc<ServiceContext>,
}

impl CorrelationRegimeService {
    pub fn new(
        config: CorrelationConfig,
        market_data: Arc<dyn MarketDataProvider>,
        store: Arc<PersistenceStore>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        Self {
            config,
            market_data,
            store,
            ctx,
        }
    }

    /// Recompute the regime for a user's currently open symbols and persist
    /// the reading (state plus full matrix) for audit.
    pub async fn recompute(&self, user_id: &str) -> Result<CorrelationRegimeState, RegimeError> {
        let symbols: BTreeSet<String> = self
            .store
            .load_open_trades(user_id)?
            .into_iter()
            .map(|t| t.symbol)
            .collect();
        let symbols: Vec<String> = symbols.into_iter().collect();

        if symbols.len() < 2 {
            let state = CorrelationRegimeState {
                user_id: user_id.to_string(),
                regime: CorrelationRegime::Normal,
                avg_off_diagonal: 0.0,
                sizing_multiplier: 1.0,
                symbols,
                matrix: Vec::new(),
                computed_at: self.ctx.time.now(),
            };
            self.store.append_regime_state(&state)?;
            return Ok(state);
        }

        let mut series: Vec<Vec<f64>> = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let candles = self
                .market_data
                .get_candles(symbol, "1d", self.config.lookback_days + 1)
                .await?;
            let closes: Vec<f64> = candles
                .iter()
                .filter_map(|c| c.close.to_f64())
                .collect();
            series.push(daily_returns(&closes));
        }

        // Align to the shortest series, keeping the most recent overlap
        let min_len = series.iter().map(|s| s.len()).min().unwrap_or(0);
        if min_len < 2 {
            warn!(user_id, "Not enough aligned return history, regime NORMAL");
            let state = CorrelationRegimeState {
                user_id: user_id.to_string(),
                regime: CorrelationRegime::Normal,
                avg_off_diagonal: 0.0,
                sizing_multiplier: 1.0,
                symbols,
                matrix: Vec::new(),
                computed_at: self.ctx.time.now(),
            };
            self.store.append_regime_state(&state)?;
            return Ok(state);
        }
        for s in &mut series {
            let cut = s.len() - min_len;
            s.drain(..cut);
        }

        let n = series.len();
        let mut matrix = vec![vec![0.0f64; n]; n];
        let mut off_diagonal_sum = 0.0;
        let mut off_diagonal_count = 0usize;
        for i in 0..n {
            for j in 0..n {
                let corr = if i == j {
                    1.0
                } else {
                    pearson(&series[i], &series[j])
                };
                matrix[i][j] = corr;
                if i != j {
                    off_diagonal_sum += corr;
                    off_diagonal_count += 1;
                }
            }
        }
        let avg_off_diagonal = off_diagonal_sum / off_diagonal_count as f64;

        let (regime, sizing_multiplier) = if avg_off_diagonal >= self.config.spike_threshold {
            warn!(
                user_id,
                avg_off_diagonal, "🚨 Correlation SPIKE — shrinking position sizing"
            );
            (
                CorrelationRegime::Spike,
                self.config.sizing_multiplier_on_spike,
            )
        } else {
            (CorrelationRegime::Normal, 1.0)
        };

        let state = CorrelationRegimeState {
            user_id: user_id.to_string(),
            regime,
            avg_off_diagonal,
            sizing_multiplier,
            symbols,
            matrix,
            computed_at: self.ctx.time.now(),
        };
        self.store.append_regime_state(&state)?;
        info!(
            user_id,
            regime = ?state.regime,
            avg_off_diagonal,
            "Correlation regime recomputed"
        );
        Ok(state)
    }

    /// Multiplier the sizer applies: latest persisted reading, 1.0 when none.
    pub fn sizing_multiplier(&self, user_id: &str) -> f64 {
        match self.store.load_latest_regime(user_id) {
            Ok(Some(state)) => state.sizing_multiplier,
            Ok(None) => 1.0,
            Err(e) => {
                warn!(user_id, "Failed to read regime state: {} — using 1.0", e);
                1.0
            }
        }
    }
}

/// Simple close-to-close returns, oldest first.
pub fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Pearson correlation of two equal-length samples. Zero-variance input
/// yields 0 rather than NaN.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let a = &a[..n];
    let b = &b[..n];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
