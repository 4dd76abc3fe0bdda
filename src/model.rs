use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::order_fsm::{OrderState, PositionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

/// Final verdict of one pipeline evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "HOLD")]
    Hold,
}

/// One attempted broker order. Never deleted; retained for audit.
///
/// `order_state` only ever moves forward along the transition table in
/// `order_fsm`; `broker_order_id` is assigned exactly once, at or after ACKED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub order_state: OrderState,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    #[serde(default)]
    pub filled_quantity: Decimal,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    pub correlation_id: String,
    #[serde(default)]
    pub signal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn is_open(&self) -> bool {
        !self.order_state.is_terminal()
    }
}

/// One held or planned position, keyed by (user_id, symbol) while open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_state: PositionState,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    pub stop_loss: Decimal,
    pub is_paper_trade: bool,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        !self.position_state.is_terminal()
    }
}

/// Realized outcome of a closed trade, consumed by Kelly sizing and the
/// per-user circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
    pub close_reason: String,
}

/// Per-user loss-limit state. `version` backs the compare-and-swap write path
/// so two concurrent trade closes cannot lose an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingGuardState {
    pub user_id: String,
    pub consecutive_losses: u32,
    pub day_pnl: Decimal,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub trading_day: NaiveDate,
    #[serde(default)]
    pub last_loss_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl TradingGuardState {
    pub fn fresh(user_id: &str, trading_day: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            consecutive_losses: 0,
            day_pnl: Decimal::ZERO,
            cooldown_until: None,
            trading_day,
            last_loss_at: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SystemMode {
    #[default]
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "SAFE_MODE")]
    SafeMode,
    #[serde(rename = "PANIC")]
    Panic,
}

/// Process-wide guard aggregate (singleton row). Safe mode blocks new order
/// placement; panic mode additionally drives the flatten procedure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemGuardState {
    pub safe_mode: bool,
    pub panic_mode: bool,
    #[serde(default)]
    pub safe_mode_reason: Option<String>,
    #[serde(default)]
    pub panic_reason: Option<String>,
    #[serde(default)]
    pub panic_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reconcile_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_mismatch_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_mismatch_reason: Option<String>,
    #[serde(default)]
    pub system_mode: SystemMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationRegime {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "SPIKE")]
    Spike,
}

/// Latest co-movement reading for a user's open book. Appended on every
/// recomputation; the sizer reads the newest row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRegimeState {
    pub user_id: String,
    pub regime: CorrelationRegime,
    pub avg_off_diagonal: f64,
    pub sizing_multiplier: f64,
    pub symbols: Vec<String>,
    pub matrix: Vec<Vec<f64>>,
    pub computed_at: DateTime<Utc>,
}

/// Queued flatten attempt for a trade whose exit order failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRetryRequest {
    pub request_id: String,
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub attempts: u32,
    pub resolved: bool,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub dlq_logged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub autotrade_enabled: bool,
    pub is_paper: bool,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: String,
    pub idempotency_key: String,
    pub request_hash: u64,
    pub status: IdempotencyStatus,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Inbound placement request, as handed over by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Whole-share quantity; fractional shares are not submitted.
    pub quantity: u64,
    pub limit_price_cents: Option<i64>,
    #[serde(default)]
    pub signal_id: Option<String>,
}

impl OrderRequest {
    /// Stable hash used to detect idempotency-key reuse with a different
    /// payload.
    pub fn request_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Result of an idempotent placement/cancel call, also the replayed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub client_order_id: String,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    pub order_state: OrderState,
    pub filled_quantity: Decimal,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Structured outcome of a guard check. A denial is control flow, not an
/// error: callers surface `reason` and `until` to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardDecision {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl GuardDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            until: None,
        }
    }

    pub fn deny(reason: impl Into<String>, until: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            until,
        }
    }
}
