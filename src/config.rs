use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;

/// Full settings tree. Every section has serde defaults so a bare
/// environment boots with safe values; files and `AEGIS_`-prefixed env vars
/// override per key (e.g. `AEGIS_RISK__MAX_CONSECUTIVE_LOSSES`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    /// Master switch for the per-user circuit breaker.
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    /// Daily loss limit as a fraction of equity (0.02 = 2%).
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    /// Trading day boundary is computed in this timezone, not UTC.
    #[serde(default = "default_exchange_timezone")]
    pub exchange_timezone: String,
    /// Max fraction of equity at risk across all open stops.
    #[serde(default = "default_max_portfolio_heat_pct")]
    pub max_portfolio_heat_pct: Decimal,
    /// Max share of a symbol's average daily volume one order may take.
    #[serde(default = "default_max_participation_pct")]
    pub max_participation_pct: f64,
}

fn default_true() -> bool {
    true
}
fn default_max_daily_loss_pct() -> Decimal {
    dec!(0.02)
}
fn default_max_consecutive_losses() -> u32 {
    3
}
fn default_cooldown_minutes() -> i64 {
    60
}
fn default_exchange_timezone() -> String {
    "America/New_York".to_string()
}
fn default_max_portfolio_heat_pct() -> Decimal {
    dec!(0.06)
}
fn default_max_participation_pct() -> f64 {
    0.05
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_enabled: true,
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            cooldown_minutes: default_cooldown_minutes(),
            exchange_timezone: default_exchange_timezone(),
            max_portfolio_heat_pct: default_max_portfolio_heat_pct(),
            max_participation_pct: default_max_participation_pct(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SizingConfig {
    /// Fraction of equity risked per trade for the ATR leg.
    #[serde(default = "default_base_risk_pct")]
    pub base_risk_pct: f64,
    /// Fraction of full Kelly actually applied (full Kelly is too hot).
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    /// Closed trades considered when estimating win rate and payoff.
    #[serde(default = "default_kelly_lookback")]
    pub kelly_lookback: usize,
    #[serde(default = "default_true")]
    pub dynamic_sizing: bool,
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    #[serde(default = "default_score_ceil")]
    pub score_ceil: f64,
    #[serde(default = "default_min_multiplier")]
    pub min_multiplier: f64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
    /// Hard cap: notional of one trade never exceeds this fraction of equity.
    #[serde(default = "default_max_single_trade_capital_pct")]
    pub max_single_trade_capital_pct: f64,
}

fn default_base_risk_pct() -> f64 {
    0.01
}
fn default_kelly_fraction() -> f64 {
    0.5
}
fn default_kelly_lookback() -> usize {
    30
}
fn default_score_floor() -> f64 {
    50.0
}
fn default_score_ceil() -> f64 {
    90.0
}
fn default_min_multiplier() -> f64 {
    0.5
}
fn default_max_multiplier() -> f64 {
    1.5
}
fn default_max_single_trade_capital_pct() -> f64 {
    0.25
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_risk_pct: default_base_risk_pct(),
            kelly_fraction: default_kelly_fraction(),
            kelly_lookback: default_kelly_lookback(),
            dynamic_sizing: true,
            score_floor: default_score_floor(),
            score_ceil: default_score_ceil(),
            min_multiplier: default_min_multiplier(),
            max_multiplier: default_max_multiplier(),
            max_single_trade_capital_pct: default_max_single_trade_capital_pct(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CostConfig {
    #[serde(default = "default_spread_pct")]
    pub spread_pct: f64,
    #[serde(default = "default_slippage_atr_pct")]
    pub slippage_atr_pct: f64,
    #[serde(default = "default_impact_factor")]
    pub impact_factor: f64,
    /// Fallback when no per-symbol notional has been observed.
    #[serde(default = "default_avg_daily_notional")]
    pub default_avg_daily_notional: f64,
    #[serde(default = "default_latency_millis")]
    pub latency_millis: u64,
    #[serde(default = "default_latency_move_pct")]
    pub latency_move_pct_per_second: f64,
    /// Limit orders further than this fraction from market are assumed
    /// to never fill.
    #[serde(default = "default_limit_fill_max_distance_pct")]
    pub limit_fill_max_distance_pct: f64,
}

fn default_spread_pct() -> f64 {
    0.001
}
fn default_slippage_atr_pct() -> f64 {
    0.1
}
fn default_impact_factor() -> f64 {
    0.05
}
fn default_avg_daily_notional() -> f64 {
    1_000_000.0
}
fn default_latency_millis() -> u64 {
    1000
}
fn default_latency_move_pct() -> f64 {
    0.0005
}
fn default_limit_fill_max_distance_pct() -> f64 {
    0.02
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            spread_pct: default_spread_pct(),
            slippage_atr_pct: default_slippage_atr_pct(),
            impact_factor: default_impact_factor(),
            default_avg_daily_notional: default_avg_daily_notional(),
            latency_millis: default_latency_millis(),
            latency_move_pct_per_second: default_latency_move_pct(),
            limit_fill_max_distance_pct: default_limit_fill_max_distance_pct(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorrelationConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: usize,
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: f64,
    #[serde(default = "default_spike_multiplier")]
    pub sizing_multiplier_on_spike: f64,
}

fn default_lookback_days() -> usize {
    30
}
fn default_spike_threshold() -> f64 {
    0.7
}
fn default_spike_multiplier() -> f64 {
    0.5
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            spike_threshold: default_spike_threshold(),
            sizing_multiplier_on_spike: default_spike_multiplier(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Absolute share tolerance before a quantity difference is a mismatch.
    #[serde(default = "default_quantity_tolerance")]
    pub quantity_tolerance: Decimal,
    /// Relative price tolerance (0.001 = 10 bps).
    #[serde(default = "default_price_tolerance_pct")]
    pub price_tolerance_pct: Decimal,
    #[serde(default = "default_true")]
    pub auto_cancel_on_mismatch: bool,
    /// Read but intentionally not acted on; see DESIGN.md.
    #[serde(default)]
    pub auto_flatten_on_mismatch: bool,
    #[serde(default = "default_true")]
    pub safe_mode_on_mismatch: bool,
}

fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_quantity_tolerance() -> Decimal {
    dec!(0.0001)
}
fn default_price_tolerance_pct() -> Decimal {
    dec!(0.001)
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            quantity_tolerance: default_quantity_tolerance(),
            price_tolerance_pct: default_price_tolerance_pct(),
            auto_cancel_on_mismatch: true,
            auto_flatten_on_mismatch: false,
            safe_mode_on_mismatch: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: usize,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Failure rate over the sliding window that opens the circuit.
    #[serde(default = "default_breaker_failure_rate")]
    pub breaker_failure_rate: f64,
    #[serde(default = "default_breaker_min_samples")]
    pub breaker_min_samples: usize,
    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default)]
    pub live_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_rate_limit_per_sec() -> f64 {
    10.0
}
fn default_rate_limit_burst() -> usize {
    20
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_breaker_failure_rate() -> f64 {
    0.5
}
fn default_breaker_min_samples() -> usize {
    8
}
fn default_breaker_window_secs() -> u64 {
    30
}
fn default_breaker_cooldown_secs() -> u64 {
    20
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            breaker_failure_rate: default_breaker_failure_rate(),
            breaker_min_samples: default_breaker_min_samples(),
            breaker_window_secs: default_breaker_window_secs(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            live_base_url: None,
            api_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExitConfig {
    #[serde(default = "default_exit_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_exit_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_exit_max_attempts")]
    pub max_attempts: u32,
}

fn default_exit_poll_secs() -> u64 {
    5
}
fn default_exit_base_backoff_secs() -> u64 {
    2
}
fn default_exit_max_attempts() -> u32 {
    6
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_exit_poll_secs(),
            base_backoff_secs: default_exit_base_backoff_secs(),
            max_attempts: default_exit_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_workers() -> usize {
    8
}
fn default_queue_depth() -> usize {
    64
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// A candle older than this fails the data-quality gate.
    #[serde(default = "default_max_candle_age_secs")]
    pub max_candle_age_secs: i64,
    /// Close-to-close jump beyond this fraction counts as a data gap.
    #[serde(default = "default_max_gap_pct")]
    pub max_gap_pct: f64,
    #[serde(default = "default_min_bars")]
    pub min_bars: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
}

// Daily bars: anything older than two sessions is stale (covers weekends)
fn default_max_candle_age_secs() -> i64 {
    172_800
}
fn default_max_gap_pct() -> f64 {
    0.1
}
fn default_min_bars() -> usize {
    20
}
fn default_atr_period() -> usize {
    14
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_candle_age_secs: default_max_candle_age_secs(),
            max_gap_pct: default_max_gap_pct(),
            min_bars: default_min_bars(),
            atr_period: default_atr_period(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.aegis/config.json
            .add_source(File::with_name(&format!("{}/.aegis/config", home)).required(false))
            // 2. Project config from config/config.{toml,json}
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment overrides, e.g. AEGIS_RISK__COOLDOWN_MINUTES
            .add_source(Environment::with_prefix("AEGIS").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
