use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

// --- Order placement ---

pub static ORDERS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_orders_submitted_total",
        "Total orders submitted to a broker backend"
    )
    .expect("orders_submitted counter")
});

pub static ORDERS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_orders_rejected_total",
        "Total orders rejected by the broker"
    )
    .expect("orders_rejected counter")
});

pub static ORDERS_UNKNOWN_OUTCOME: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_orders_unknown_outcome_total",
        "Orders whose broker outcome stayed unknown after retries"
    )
    .expect("orders_unknown counter")
});

pub static IDEMPOTENT_REPLAYS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_idempotent_replays_total",
        "Placement calls answered from the idempotency store"
    )
    .expect("idempotent_replays counter")
});

// --- Guards ---

pub static RISK_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_risk_rejections_total",
        "Trade evaluations denied by risk checks"
    )
    .expect("risk_rejections counter")
});

pub static GUARD_TRIPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_guard_trips_total",
        "Circuit-breaker trips (daily loss or loss streak)"
    )
    .expect("guard_trips counter")
});

pub static SAFE_MODE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("aegis_safe_mode", "1 while safe mode blocks new orders")
        .expect("safe_mode gauge")
});

pub static PANIC_MODE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("aegis_panic_mode", "1 while global panic is active")
        .expect("panic_mode gauge")
});

// --- Reconciliation ---

pub static RECONCILE_RUNS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_reconcile_runs_total",
        "Completed reconciliation sweeps"
    )
    .expect("reconcile_runs counter")
});

pub static RECONCILE_MISMATCHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_reconcile_mismatches_total",
        "Mismatches detected across all reconciliation sweeps"
    )
    .expect("reconcile_mismatches counter")
});

pub static RECONCILE_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_reconcile_skipped_total",
        "Sweeps skipped because one was already in flight"
    )
    .expect("reconcile_skipped counter")
});

// --- Exit retry queue ---

pub static EXIT_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("aegis_exit_retries_total", "Flatten exit attempts")
        .expect("exit_retries counter")
});

pub static EXIT_DLQ: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_exit_dlq_total",
        "Exit requests dead-lettered after exhausting retries"
    )
    .expect("exit_dlq counter")
});

// --- Broker resilience ---

pub static BROKER_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_broker_retries_total",
        "Broker calls retried after a transient failure"
    )
    .expect("broker_retries counter")
});

pub static BROKER_CIRCUIT_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "aegis_broker_circuit_open",
        "1 while the broker call circuit is open"
    )
    .expect("broker_circuit gauge")
});

pub static BROKER_CALL_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aegis_broker_call_latency_seconds",
        "Broker round-trip latency",
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("broker_latency histogram")
});

pub static DISPATCH_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aegis_dispatch_rejected_total",
        "Work rejected because the dispatcher queue was full"
    )
    .expect("dispatch_rejected counter")
});

pub fn inc_orders_submitted() {
    ORDERS_SUBMITTED.inc();
}

pub fn inc_orders_rejected() {
    ORDERS_REJECTED.inc();
}

pub fn inc_orders_unknown() {
    ORDERS_UNKNOWN_OUTCOME.inc();
}

pub fn inc_idempotent_replays() {
    IDEMPOTENT_REPLAYS.inc();
}

pub fn inc_risk_rejections() {
    RISK_REJECTIONS.inc();
}

pub fn inc_guard_trips() {
    GUARD_TRIPS.inc();
}

pub fn set_safe_mode(active: bool) {
    SAFE_MODE.set(active as i64);
}

pub fn set_panic_mode(active: bool) {
    PANIC_MODE.set(active as i64);
}

pub fn inc_reconcile_runs() {
    RECONCILE_RUNS.inc();
}

pub fn inc_reconcile_mismatches(count: u64) {
    RECONCILE_MISMATCHES.inc_by(count);
}

pub fn inc_reconcile_skipped() {
    RECONCILE_SKIPPED.inc();
}

pub fn inc_exit_retries() {
    EXIT_RETRIES.inc();
}

pub fn inc_exit_dlq() {
    EXIT_DLQ.inc();
}

pub fn inc_broker_retries() {
    BROKER_RETRIES.inc();
}

pub fn set_broker_circuit_open(open: bool) {
    BROKER_CIRCUIT_OPEN.set(open as i64);
}

pub fn observe_broker_latency(seconds: f64) {
    BROKER_CALL_LATENCY.observe(seconds);
}

pub fn inc_dispatch_rejected() {
    DISPATCH_REJECTED.inc();
}
