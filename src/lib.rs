pub mod broker;
pub mod config;
pub mod context;
pub mod correlation;
pub mod dispatch;
pub mod execution_cost;
pub mod exit_queue;
pub mod guard_state;
pub mod idempotency;
pub mod market_data;
pub mod metrics;
pub mod model;
pub mod order_fsm;
pub mod order_service;
pub mod panic_service;
pub mod persistence;
pub mod pipeline;
pub mod rate_limiter;
pub mod reconciler;
pub mod risk_guard;
pub mod signal;
pub mod sizing;
