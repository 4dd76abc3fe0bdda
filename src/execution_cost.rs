use crate::config::CostConfig;
use crate::model::{OrderType, Side};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Inputs to one cost estimate. `price` is the intended execution price
/// (limit price for LIMIT, market for MARKET); `current_price` is where the
/// market actually is, used for limit fill-probability distance.
#[derive(Debug, Clone)]
pub struct CostInputs {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub current_price: f64,
    pub atr: f64,
}

/// Per-share cost breakdown plus the headline numbers risk consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub spread_cost: f64,
    pub slippage_cost: f64,
    pub market_impact_cost: f64,
    pub latency_cost: f64,
    pub total_per_share: f64,
    pub effective_price: f64,
    pub total_cost: f64,
    pub fill_probability: f64,
}

/// Estimates what a fill will really cost: quoted spread, volatility
/// slippage, square-root market impact, and price drift over submission
/// latency. Keeps a rolling per-symbol average daily notional the way the
/// market-data feed reports it.
pub struct ExecutionCostModel {
    config: CostConfig,
    daily_notionals: DashMap<String, f64>,
}

impl ExecutionCostModel {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            daily_notionals: DashMap::new(),
        }
    }

    pub fn update_avg_daily_notional(&self, symbol: &str, notional: f64) {
        self.daily_notionals.insert(symbol.to_string(), notional);
    }

    fn avg_daily_notional(&self, symbol: &str) -> f64 {
        self.daily_notionals
            .get(symbol)
            .map(|v| *v)
            .unwrap_or(self.config.default_avg_daily_notional)
    }

    pub fn estimate(&self, inputs: &CostInputs) -> ExecutionPlan {
        let c = &self.config;
        let notional = inputs.price * inputs.quantity;
        let avg_daily = self.avg_daily_notional(&inputs.symbol).max(1.0);

        let spread_cost = inputs.price * c.spread_pct;
        let slippage_cost = inputs.atr * c.slippage_atr_pct;
        let market_impact_cost = (notional / avg_daily).sqrt() * c.impact_factor * inputs.price;
        let latency_cost =
            inputs.price * c.latency_move_pct_per_second * (c.latency_millis as f64 / 1000.0);

        let total_per_share = spread_cost + slippage_cost + market_impact_cost + latency_cost;
        let effective_price = match inputs.side {
            Side::Buy => inputs.price + total_per_share,
            Side::Sell => inputs.price - total_per_share,
        };
        let total_cost = total_per_share * inputs.quantity;

        let fill_probability = match inputs.order_type {
            OrderType::Market => 1.0,
            OrderType::Limit => self.limit_fill_probability(inputs, notional, avg_daily),
        };

        ExecutionPlan {
            symbol: inputs.symbol.clone(),
            side: inputs.side,
            order_type: inputs.order_type,
            quantity: inputs.quantity,
            price: inputs.price,
            spread_cost,
            slippage_cost,
            market_impact_cost,
            latency_cost,
            total_per_share,
            effective_price,
            total_cost,
            fill_probability,
        }
    }

    /// Decreasing in the limit's distance from market relative to the
    /// configured max distance, shrunk by how much of the daily volume the
    /// order takes. Always in [0, 1] and strictly below 1 away from market.
    fn limit_fill_probability(&self, inputs: &CostInputs, notional: f64, avg_daily: f64) -> f64 {
        if inputs.current_price <= 0.0 {
            return 0.0;
        }
        let distance = (inputs.price - inputs.current_price).abs() / inputs.current_price;
        let max_distance = self.config.limit_fill_max_distance_pct.max(f64::EPSILON);
        let distance_factor = (1.0 - distance / max_distance).clamp(0.0, 1.0);

        let volume_factor = avg_daily / (avg_daily + notional);
        (distance_factor * volume_factor).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ExecutionCostModel {
        // Matches the documented reference costs
        ExecutionCostModel::new(CostConfig {
            spread_pct: 0.001,
            slippage_atr_pct: 0.1,
            impact_factor: 0.05,
            default_avg_daily_notional: 1_000_000.0,
            latency_millis: 1000,
            latency_move_pct_per_second: 0.0005,
            limit_fill_max_distance_pct: 0.02,
        })
    }

    fn market_buy() -> CostInputs {
        CostInputs {
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 10.0,
            price: 100.0,
            current_price: 100.0,
            atr: 2.0,
        }
    }

    #[test]
    fn test_market_buy_cost_breakdown() {
        let plan = model().estimate(&market_buy());

        assert!((plan.spread_cost - 0.1).abs() < 1e-9);
        assert!((plan.slippage_cost - 0.2).abs() < 1e-9);
        // sqrt(1000/1e6) * 0.05 * 100 = sqrt(0.001) * 5 ≈ 0.1581
        assert!((plan.market_impact_cost - 0.001_f64.sqrt() * 5.0).abs() < 1e-9);
        assert!((plan.latency_cost - 0.05).abs() < 1e-9);

        assert!((plan.effective_price - 100.508).abs() < 1e-2);
        assert!((plan.total_cost - 5.08).abs() < 1e-1);
        assert_eq!(plan.fill_probability, 1.0);
    }

    #[test]
    fn test_sell_side_subtracts_costs() {
        let mut inputs = market_buy();
        inputs.side = Side::Sell;
        let plan = model().estimate(&inputs);
        assert!(plan.effective_price < inputs.price);
    }

    #[test]
    fn test_limit_probability_decreases_with_distance() {
        let model = model();
        let mut near = market_buy();
        near.order_type = OrderType::Limit;
        near.price = 99.8; // 0.2% away
        let mut far = near.clone();
        far.price = 98.5; // 1.5% away

        let p_near = model.estimate(&near).fill_probability;
        let p_far = model.estimate(&far).fill_probability;

        assert!(p_near > p_far);
        assert!(p_near < 1.0, "away from market must be < 1");
        assert!((0.0..=1.0).contains(&p_far));
    }

    #[test]
    fn test_limit_beyond_max_distance_never_fills() {
        let model = model();
        let mut inputs = market_buy();
        inputs.order_type = OrderType::Limit;
        inputs.price = 97.0; // 3% away, beyond the 2% max distance
        assert_eq!(model.estimate(&inputs).fill_probability, 0.0);
    }

    #[test]
    fn test_symbol_notional_overrides_default() {
        let model = model();
        model.update_avg_daily_notional("AAPL", 100_000_000.0);
        let plan = model.estimate(&market_buy());
        // Deeper liquidity -> smaller impact than the 0.158 default
        assert!(plan.market_impact_cost < 0.1);
    }
}
