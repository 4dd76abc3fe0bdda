use crate::config::{PipelineConfig, RiskConfig};
use crate::context::ServiceContext;
use crate::correlation::CorrelationRegimeService;
use crate::execution_cost::{CostInputs, ExecutionCostModel, ExecutionPlan};
use crate::guard_state::SystemGuard;
use crate::market_data::{average_true_range, Candle, MarketDataProvider};
use crate::metrics;
use crate::model::{OrderType, Side, TradeAction};
use crate::persistence::store::PersistenceStore;
use crate::risk_guard::TradingGuard;
use crate::signal::{HealthStatus, SignalEngine, SignalRequest, SignalScore, StrategyHealth};
use crate::sizing::{HybridPositionSizer, SizingInputs};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub user_id: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub quantity: u64,
    pub atr: f64,
    pub portfolio_heat: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub action: TradeAction,
    pub score: f64,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub signal: Option<SignalScore>,
    #[serde(default)]
    pub risk: Option<RiskDecision>,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
}

impl DecisionResult {
    fn hold(score: f64, reasons: Vec<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            score,
            reasons,
            signal: None,
            risk: None,
            execution_plan: None,
        }
    }
}

/// The evaluation path for one candidate: data quality → signal → strategy
/// health → risk → execution plan. Stages short-circuit and every rejection
/// carries its reasons so a HOLD is explainable after the fact.
pub struct TradeDecisionPipeline {
    pipeline_config: PipelineConfig,
    risk_config: RiskConfig,
    market_data: Arc<dyn MarketDataProvider>,
    signal_engine: Arc<dyn SignalEngine>,
    strategy_health: Arc<dyn StrategyHealth>,
    sizer: HybridPositionSizer,
    cost_model: Arc<ExecutionCostModel>,
    correlation: Arc<CorrelationRegimeService>,
    trading_guard: Arc<TradingGuard>,
    system_guard: Arc<SystemGuard>,
    store: Arc<PersistenceStore>,
    ctx: Arc<ServiceContext>,
}

impl TradeDecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_config: PipelineConfig,
        risk_config: RiskConfig,
        market_data: Arc<dyn MarketDataProvider>,
        signal_engine: Arc<dyn SignalEngine>,
        strategy_health: Arc<dyn StrategyHealth>,
        sizer: HybridPositionSizer,
        cost_model: Arc<ExecutionCostModel>,
        correlation: Arc<CorrelationRegimeService>,
        trading_guard: Arc<TradingGuard>,
        system_guard: Arc<SystemGuard>,
        store: Arc<PersistenceStore>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        Self {
            pipeline_config,
            risk_config,
            market_data,
            signal_engine,
            strategy_health,
            sizer,
            cost_model,
            correlation,
            trading_guard,
            system_guard,
            store,
            ctx,
        }
    }

    pub async fn evaluate(&self, request: &PipelineRequest) -> DecisionResult {
        // --- Stage 1: data quality gate ---
        let bars_needed = self
            .pipeline_config
            .min_bars
            .max(self.pipeline_config.atr_period + 1);
        let candles = match self
            .market_data
            .get_candles(&request.symbol, "1d", bars_needed)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                return DecisionResult::hold(0.0, vec![format!("market data unavailable: {}", e)]);
            }
        };
        let quality_reasons = self.data_quality_reasons(&candles);
        if !quality_reasons.is_empty() {
            info!(symbol = %request.symbol, ?quality_reasons, "HOLD on data quality");
            return DecisionResult::hold(0.0, quality_reasons);
        }

        // --- Stage 2: signal scoring (external collaborator) ---
        let signal = match self
            .signal_engine
            .score(&SignalRequest {
                user_id: request.user_id.clone(),
                symbol: request.symbol.clone(),
                candles: candles.clone(),
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                return DecisionResult::hold(0.0, vec![format!("signal scoring failed: {}", e)]);
            }
        };

        // --- Stage 3: strategy health ---
        if self.strategy_health.status(&request.user_id, &request.symbol) == HealthStatus::Broken {
            warn!(symbol = %request.symbol, "HOLD — strategy health BROKEN");
            let mut result = DecisionResult::hold(
                signal.score,
                vec!["strategy health is BROKEN".to_string()],
            );
            result.signal = Some(signal);
            return result;
        }

        // --- Stage 4: risk evaluation ---
        let (risk, quantity) = self.evaluate_risk(request, &signal, &candles).await;
        if !risk.allowed {
            metrics::inc_risk_rejections();
            let mut result = DecisionResult::hold(signal.score, risk.reasons.clone());
            result.signal = Some(signal);
            result.risk = Some(risk);
            return result;
        }

        // --- Stage 5: execution plan ---
        let entry = signal.entry_price.to_f64().unwrap_or(0.0);
        let current_price = match self.market_data.get_bid_ask(&request.symbol).await {
            Ok(quote) => ((quote.bid + quote.ask) / Decimal::TWO)
                .to_f64()
                .unwrap_or(entry),
            Err(_) => entry,
        };
        let plan = self.cost_model.estimate(&CostInputs {
            symbol: request.symbol.clone(),
            side: infer_side(&signal),
            order_type: OrderType::Limit,
            quantity: quantity as f64,
            price: entry,
            current_price,
            atr: risk.atr,
        });

        let action = match infer_side(&signal) {
            Side::Buy => TradeAction::Buy,
            Side::Sell => TradeAction::Sell,
        };
        info!(
            symbol = %request.symbol,
            ?action,
            quantity,
            score = signal.score,
            "Decision ready"
        );
        DecisionResult {
            action,
            score: signal.score,
            reasons: Vec::new(),
            signal: Some(signal),
            risk: Some(risk),
            execution_plan: Some(plan),
        }
    }

    fn data_quality_reasons(&self, candles: &[Candle]) -> Vec<String> {
        let mut reasons = Vec::new();
        if candles.len() < self.pipeline_config.min_bars {
            reasons.push(format!(
                "insufficient history: {} bars < {}",
                candles.len(),
                self.pipeline_config.min_bars
            ));
            return reasons;
        }

        let now = self.ctx.time.now();
        if let Some(last) = candles.last() {
            let age = (now - last.ts).num_seconds();
            if age > self.pipeline_config.max_candle_age_secs {
                reasons.push(format!("stale market data: last bar {}s old", age));
            }
        }

        for window in candles.windows(2) {
            let prev = window[0].close.to_f64().unwrap_or(0.0);
            let cur = window[1].close.to_f64().unwrap_or(0.0);
            if prev > 0.0 {
                let gap = ((cur - prev) / prev).abs();
                if gap > self.pipeline_config.max_gap_pct {
                    reasons.push(format!(
                        "data gap: {:.1}% close-to-close jump",
                        gap * 100.0
                    ));
                    break;
                }
            }
        }
        reasons
    }

    /// All sub-checks run and accumulate reasons; the trade is allowed only
    /// when every one of them passes.
    async fn evaluate_risk(
        &self,
        request: &PipelineRequest,
        signal: &SignalScore,
        candles: &[Candle],
    ) -> (RiskDecision, u64) {
        let mut reasons = Vec::new();

        if let Some(reason) = self.system_guard.placement_blocked() {
            reasons.push(reason);
        }
        match self
            .trading_guard
            .can_trade(&request.user_id, self.ctx.time.now())
        {
            Ok(decision) if !decision.allowed => {
                reasons.push(format!(
                    "circuit breaker: {}",
                    decision.reason.unwrap_or_default()
                ));
            }
            Ok(_) => {}
            Err(e) => reasons.push(format!("guard state unavailable: {}", e)),
        }

        if !signal.tradable {
            reasons.push(format!(
                "signal not tradable: {}",
                signal.reason.clone().unwrap_or_default()
            ));
        }

        // Usable portfolio snapshot: positive equity is a hard requirement
        let equity = match self.store.load_user(&request.user_id) {
            Ok(Some(user)) if user.equity > Decimal::ZERO => {
                user.equity.to_f64().unwrap_or(0.0)
            }
            Ok(_) => {
                reasons.push("portfolio snapshot unusable: non-positive equity".to_string());
                0.0
            }
            Err(e) => {
                reasons.push(format!("portfolio snapshot unavailable: {}", e));
                0.0
            }
        };

        let atr = average_true_range(candles, self.pipeline_config.atr_period).unwrap_or(0.0);
        if atr <= 0.0 {
            reasons.push("ATR unavailable".to_string());
        }

        let entry = signal.entry_price.to_f64().unwrap_or(0.0);
        let stop = signal.suggested_stop_loss.to_f64().unwrap_or(0.0);

        let history = self
            .store
            .load_recent_trade_records(&request.user_id, 100)
            .unwrap_or_default();
        let regime_multiplier = self.correlation.sizing_multiplier(&request.user_id);

        let sizing = self.sizer.size(&SizingInputs {
            equity,
            entry_price: entry,
            stop_price: stop,
            history: &history,
            signal_score: signal.score,
            regime_multiplier,
        });
        let mut quantity = sizing.quantity;

        // Liquidity validation: stay under the participation cap of average
        // daily volume, shrinking the order rather than failing outright.
        let avg_volume = candles
            .iter()
            .filter_map(|c| c.volume.to_f64())
            .sum::<f64>()
            / candles.len().max(1) as f64;
        let participation_cap =
            (avg_volume * self.risk_config.max_participation_pct).floor() as u64;
        if quantity > participation_cap {
            quantity = participation_cap;
        }

        if quantity == 0 {
            reasons.push("quantity zero after sizing and liquidity adjustment".to_string());
        }

        // Portfolio heat: open stop-risk plus this trade's risk as a share
        // of equity.
        let open_trades = self
            .store
            .load_open_trades(&request.user_id)
            .unwrap_or_default();
        let open_risk: f64 = open_trades
            .iter()
            .filter_map(|t| {
                let entry = t.entry_price.to_f64()?;
                let stop = t.stop_loss.to_f64()?;
                let qty = t.quantity.to_f64()?;
                Some((entry - stop).abs() * qty)
            })
            .sum();
        let new_risk = (entry - stop).abs() * quantity as f64;
        let heat = if equity > 0.0 {
            (open_risk + new_risk) / equity
        } else {
            0.0
        };
        let max_heat = self
            .risk_config
            .max_portfolio_heat_pct
            .to_f64()
            .unwrap_or(0.06);
        if equity > 0.0 && heat > max_heat {
            reasons.push(format!(
                "portfolio heat {:.1}% exceeds {:.1}%",
                heat * 100.0,
                max_heat * 100.0
            ));
        }

        let allowed = reasons.is_empty();
        (
            RiskDecision {
                allowed,
                quantity,
                atr,
                portfolio_heat: heat,
                reasons,
            },
            quantity,
        )
    }
}

fn infer_side(signal: &SignalScore) -> Side {
    // Stop below entry means a long setup
    if signal.suggested_stop_loss <= signal.entry_price {
        Side::Buy
    } else {
        Side::Sell
    }
}
