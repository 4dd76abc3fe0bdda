use crate::config::SizingConfig;
use crate::model::TradeRecord;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

/// Inputs to one sizing decision. Statistical math runs in f64; the result
/// is a whole-share quantity.
#[derive(Debug, Clone)]
pub struct SizingInputs<'a> {
    pub equity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub history: &'a [TradeRecord],
    pub signal_score: f64,
    pub regime_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct SizingResult {
    pub quantity: u64,
    pub atr_quantity: u64,
    /// None when there is no trade history — Kelly is unconstrained and ATR
    /// sizing governs alone.
    pub kelly_quantity: Option<u64>,
    pub dynamic_multiplier: f64,
    pub regime_multiplier: f64,
    pub capital_capped: bool,
}

/// Hybrid position sizer: the more conservative of stop-distance risk sizing
/// and fractional-Kelly sizing, scaled by signal quality and the correlation
/// regime, hard-capped by per-trade capital share.
pub struct HybridPositionSizer {
    config: SizingConfig,
}

impl HybridPositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Risk-per-trade quantity from the stop distance.
    pub fn atr_quantity(&self, equity: f64, entry_price: f64, stop_price: f64) -> u64 {
        let stop_distance = (entry_price - stop_price).abs();
        if stop_distance <= f64::EPSILON || equity <= 0.0 {
            return 0;
        }
        ((equity * self.config.base_risk_pct) / stop_distance).floor() as u64
    }

    /// Fractional-Kelly quantity from realized history. Returns None with an
    /// empty window (unconstrained).
    pub fn kelly_quantity(
        &self,
        equity: f64,
        entry_price: f64,
        history: &[TradeRecord],
    ) -> Option<u64> {
        let window: Vec<f64> = history
            .iter()
            .rev()
            .take(self.config.kelly_lookback)
            .filter_map(|t| t.pnl.to_f64())
            .collect();
        if window.is_empty() {
            return None;
        }

        let wins: Vec<f64> = window.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = window.iter().copied().filter(|p| *p < 0.0).collect();

        let p = wins.len() as f64 / window.len() as f64;
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().map(|l| l.abs()).sum::<f64>() / losses.len() as f64
        };

        // Kelly fraction: p - (1-p)/b, b = payoff ratio. A history with no
        // losses degenerates to betting the win rate; no wins means zero.
        let edge = if avg_win <= 0.0 {
            0.0
        } else if avg_loss <= 0.0 {
            p
        } else {
            let b = avg_win / avg_loss;
            (p - (1.0 - p) / b).max(0.0)
        };

        let fraction = self.config.kelly_fraction * edge;
        if entry_price <= 0.0 {
            return Some(0);
        }
        Some(((fraction * equity) / entry_price).floor() as u64)
    }

    /// Linear score multiplier between the floor and ceiling, clamped
    /// outside. Identity when dynamic sizing is off.
    pub fn dynamic_multiplier(&self, score: f64) -> f64 {
        if !self.config.dynamic_sizing {
            return 1.0;
        }
        let c = &self.config;
        if c.score_ceil <= c.score_floor {
            return 1.0;
        }
        let t = ((score - c.score_floor) / (c.score_ceil - c.score_floor)).clamp(0.0, 1.0);
        c.min_multiplier + t * (c.max_multiplier - c.min_multiplier)
    }

    pub fn size(&self, inputs: &SizingInputs) -> SizingResult {
        let atr_qty = self.atr_quantity(inputs.equity, inputs.entry_price, inputs.stop_price);
        let kelly_qty = self.kelly_quantity(inputs.equity, inputs.entry_price, inputs.history);

        // The more conservative sizing always wins
        let base_qty = match kelly_qty {
            Some(k) => atr_qty.min(k),
            None => atr_qty,
        };

        let dynamic = self.dynamic_multiplier(inputs.signal_score);
        let scaled = (base_qty as f64 * dynamic * inputs.regime_multiplier).floor() as u64;

        // Notional never exceeds the per-trade capital share
        let cap = if inputs.entry_price > 0.0 {
            ((self.config.max_single_trade_capital_pct * inputs.equity) / inputs.entry_price)
                .floor() as u64
        } else {
            0
        };
        let capital_capped = scaled > cap;
        let quantity = scaled.min(cap);

        debug!(
            atr_qty,
            ?kelly_qty,
            dynamic,
            regime = inputs.regime_multiplier,
            quantity,
            "Sizing computed"
        );

        SizingResult {
            quantity,
            atr_quantity: atr_qty,
            kelly_quantity: kelly_qty,
            dynamic_multiplier: dynamic,
            regime_multiplier: inputs.regime_multiplier,
            capital_capped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn record(pnl: Decimal) -> TradeRecord {
        TradeRecord {
            trade_id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl / dec!(10),
            quantity: dec!(10),
            pnl,
            closed_at: Utc::now(),
            close_reason: "target".to_string(),
        }
    }

    fn sizer() -> HybridPositionSizer {
        HybridPositionSizer::new(SizingConfig::default())
    }

    #[test]
    fn test_atr_quantity_from_stop_distance() {
        // 100k equity, 1% risk, $2 stop distance -> 500 shares
        let qty = sizer().atr_quantity(100_000.0, 50.0, 48.0);
        assert_eq!(qty, 500);
    }

    #[test]
    fn test_atr_quantity_zero_on_degenerate_stop() {
        assert_eq!(sizer().atr_quantity(100_000.0, 50.0, 50.0), 0);
    }

    #[test]
    fn test_kelly_quantity_from_fixture_history() {
        // 6 wins of +200, 4 losses of -100: p=0.6, b=2.0
        // edge = 0.6 - 0.4/2 = 0.4; half-Kelly -> 0.2 of equity
        let mut history = Vec::new();
        for _ in 0..6 {
            history.push(record(dec!(200)));
        }
        for _ in 0..4 {
            history.push(record(dec!(-100)));
        }
        let qty = sizer()
            .kelly_quantity(100_000.0, 100.0, &history)
            .unwrap();
        // 0.2 * 100000 / 100 = 200
        assert_eq!(qty, 200);
    }

    #[test]
    fn test_empty_history_leaves_kelly_unconstrained() {
        let result = sizer().size(&SizingInputs {
            equity: 100_000.0,
            entry_price: 50.0,
            stop_price: 48.0,
            history: &[],
            signal_score: 70.0,
            regime_multiplier: 1.0,
        });
        assert!(result.kelly_quantity.is_none());
        assert_eq!(result.atr_quantity, 500);
    }

    #[test]
    fn test_conservative_leg_wins() {
        // All-losing history -> Kelly edge 0 -> quantity 0 despite ATR sizing
        let history: Vec<TradeRecord> = (0..10).map(|_| record(dec!(-50))).collect();
        let result = sizer().size(&SizingInputs {
            equity: 100_000.0,
            entry_price: 50.0,
            stop_price: 48.0,
            history: &history,
            signal_score: 70.0,
            regime_multiplier: 1.0,
        });
        assert_eq!(result.kelly_quantity, Some(0));
        assert_eq!(result.quantity, 0);
    }

    #[test]
    fn test_dynamic_multiplier_disabled_is_identity() {
        let config = SizingConfig {
            dynamic_sizing: false,
            ..SizingConfig::default()
        };
        let sizer = HybridPositionSizer::new(config);
        for score in [0.0, 55.0, 95.0] {
            assert_eq!(sizer.dynamic_multiplier(score), 1.0);
        }
    }

    #[test]
    fn test_dynamic_multiplier_interpolates_and_clamps() {
        // Defaults: floor 50 -> 0.5, ceil 90 -> 1.5
        let s = sizer();
        assert!((s.dynamic_multiplier(50.0) - 0.5).abs() < 1e-9);
        assert!((s.dynamic_multiplier(70.0) - 1.0).abs() < 1e-9);
        assert!((s.dynamic_multiplier(90.0) - 1.5).abs() < 1e-9);
        // Clamped outside the band
        assert!((s.dynamic_multiplier(10.0) - 0.5).abs() < 1e-9);
        assert!((s.dynamic_multiplier(99.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_notional_never_exceeds_capital_cap() {
        // Huge ATR sizing forced by a tight stop; cap must bind
        let result = sizer().size(&SizingInputs {
            equity: 100_000.0,
            entry_price: 10.0,
            stop_price: 9.99,
            history: &[],
            signal_score: 95.0,
            regime_multiplier: 1.0,
        });
        let cap = (0.25_f64 * 100_000.0 / 10.0).floor() as u64;
        assert!(result.capital_capped);
        assert_eq!(result.quantity, cap);
    }

    #[test]
    fn test_regime_multiplier_shrinks_size() {
        let normal = sizer().size(&SizingInputs {
            equity: 100_000.0,
            entry_price: 50.0,
            stop_price: 48.0,
            history: &[],
            signal_score: 70.0,
            regime_multiplier: 1.0,
        });
        let spiked = sizer().size(&SizingInputs {
            equity: 100_000.0,
            entry_price: 50.0,
            stop_price: 48.0,
            history: &[],
            signal_score: 70.0,
            regime_multiplier: 0.5,
        });
        assert_eq!(spiked.quantity, normal.quantity / 2);
    }
}
