use crate::broker::adapter::{BrokerOrder, BrokerPosition};
use crate::broker::BrokerRegistry;
use crate::config::ReconcileConfig;
use crate::context::ServiceContext;
use crate::guard_state::SystemGuard;
use crate::metrics;
use crate::model::{OrderIntent, Side, Trade, UserRecord};
use crate::order_fsm::{order_transition, OrderState};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use crate::persistence::wal::WalEntry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("A reconciliation sweep is already in flight")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMismatch {
    pub user_id: String,
    pub symbol: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMismatch {
    pub user_id: String,
    pub symbol: String,
    pub client_order_id: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMismatch {
    pub user_id: String,
    pub symbol: String,
    pub local_quantity: Decimal,
    pub broker_quantity: Decimal,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub mismatch: bool,
    pub users_checked: usize,
    pub order_mismatches: Vec<OrderMismatch>,
    pub status_mismatches: Vec<StatusMismatch>,
    pub position_mismatches: Vec<PositionMismatch>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileReport {
    pub fn total_mismatches(&self) -> usize {
        self.order_mismatches.len() + self.status_mismatches.len() + self.position_mismatches.len()
    }

    fn summary(&self) -> String {
        format!(
            "{} order, {} status, {} position mismatches across {} users",
            self.order_mismatches.len(),
            self.status_mismatches.len(),
            self.position_mismatches.len(),
            self.users_checked
        )
    }
}

/// Source-of-truth auditor: diffs the internal order/position ledger against
/// what each user's broker reports, on a schedule and on demand. Any
/// divergence can auto-cancel the user's open orders and flip the system
/// into safe mode; auto-flatten is deliberately log-only.
pub struct ReconciliationEngine {
    config: ReconcileConfig,
    store: Arc<PersistenceStore>,
    registry: Arc<BrokerRegistry>,
    guard: Arc<SystemGuard>,
    ctx: Arc<ServiceContext>,
    running: AtomicBool,
    last_report: RwLock<Option<ReconcileReport>>,
}

impl ReconciliationEngine {
    pub fn new(
        config: ReconcileConfig,
        store: Arc<PersistenceStore>,
        registry: Arc<BrokerRegistry>,
        guard: Arc<SystemGuard>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            guard,
            ctx,
            running: AtomicBool::new(false),
            last_report: RwLock::new(None),
        }
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().clone()
    }

    /// Full sweep over every user. Re-entrant calls are skipped, not queued:
    /// a second sweep racing the first would double-cancel.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        if self.running.swap(true, Ordering::SeqCst) {
            metrics::inc_reconcile_skipped();
            warn!("Reconciliation already in flight — skipping");
            return Err(ReconcileError::AlreadyRunning);
        }
        let result = self.run_sweep().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_sweep(&self) -> Result<ReconcileReport, ReconcileError> {
        let started_at = self.ctx.time.now();
        let users = self.store.load_users()?;

        let mut report = ReconcileReport {
            mismatch: false,
            users_checked: 0,
            order_mismatches: Vec::new(),
            status_mismatches: Vec::new(),
            position_mismatches: Vec::new(),
            started_at,
            finished_at: started_at,
        };

        for user in &users {
            match self.reconcile_user(user, &mut report).await {
                Ok(()) => report.users_checked += 1,
                Err(e) => {
                    // Broker unreachable: nothing to compare against; the
                    // sweep continues for the other users.
                    error!(user_id = %user.user_id, "Reconcile failed for user: {}", e);
                }
            }
        }

        report.finished_at = self.ctx.time.now();
        report.mismatch = report.total_mismatches() > 0;

        // A clean run still refreshes the timestamp so staleness is
        // observable.
        let summary = report.summary();
        self.guard
            .record_reconcile(report.mismatch.then_some(summary.as_str()));

        if report.mismatch {
            metrics::inc_reconcile_mismatches(report.total_mismatches() as u64);
            if self.config.safe_mode_on_mismatch {
                self.guard
                    .enter_safe_mode(&format!("reconciliation mismatch: {}", summary));
            }
        }
        metrics::inc_reconcile_runs();

        self.store.wal().append(&WalEntry::ReconcileCompleted {
            mismatch: report.mismatch,
            order_mismatches: report.order_mismatches.len(),
            status_mismatches: report.status_mismatches.len(),
            position_mismatches: report.position_mismatches.len(),
            summary: summary.clone(),
        })?;

        info!(mismatch = report.mismatch, "Reconciliation complete: {}", summary);
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    async fn reconcile_user(
        &self,
        user: &UserRecord,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let broker = self.registry.for_user(user);
        // Both legs of the broker truth in one round
        let (broker_orders, broker_positions) = futures::try_join!(
            broker.open_orders(&user.user_id),
            broker.open_positions(&user.user_id)
        )
        .map_err(|e| StoreError::Integrity(e.to_string()))?;

        let local_orders = self.store.load_open_orders(&user.user_id)?;
        let local_trades = self.store.load_open_trades(&user.user_id)?;

        let had_mismatches = report.total_mismatches();
        self.diff_orders(user, &local_orders, &broker_orders, report);
        self.diff_positions(user, &local_trades, &broker_positions, report);
        let user_mismatched = report.total_mismatches() > had_mismatches;

        if user_mismatched {
            if self.config.auto_cancel_on_mismatch {
                self.cancel_open_orders(user, &local_orders).await;
            }
            if self.config.auto_flatten_on_mismatch {
                // Intentionally log-only: flattening from a reconcile sweep
                // has never been armed. See DESIGN.md.
                warn!(
                    user_id = %user.user_id,
                    open_trades = local_trades.len(),
                    "Auto-flatten is enabled but not executed — manual review required"
                );
            }
        }
        Ok(())
    }

    fn diff_orders(
        &self,
        user: &UserRecord,
        local_orders: &[OrderIntent],
        broker_orders: &[BrokerOrder],
        report: &mut ReconcileReport,
    ) {
        let by_broker_id: HashMap<&str, &BrokerOrder> = broker_orders
            .iter()
            .map(|o| (o.broker_order_id.as_str(), o))
            .collect();
        let mut matched_broker_ids: Vec<&str> = Vec::new();

        for local in local_orders {
            // An intent that never reached the broker has nothing to compare
            let broker_id = match (&local.broker_order_id, local.order_state) {
                (Some(id), _) => id.as_str(),
                (None, OrderState::Created) => continue,
                (None, _) => {
                    report.order_mismatches.push(OrderMismatch {
                        user_id: user.user_id.clone(),
                        symbol: local.symbol.clone(),
                        client_order_id: Some(local.client_order_id.clone()),
                        broker_order_id: None,
                        detail: format!(
                            "order in state {} has no broker id",
                            local.order_state
                        ),
                    });
                    continue;
                }
            };

            let Some(broker_order) = by_broker_id.get(broker_id) else {
                report.order_mismatches.push(OrderMismatch {
                    user_id: user.user_id.clone(),
                    symbol: local.symbol.clone(),
                    client_order_id: Some(local.client_order_id.clone()),
                    broker_order_id: Some(broker_id.to_string()),
                    detail: "open locally but absent from broker open orders".to_string(),
                });
                continue;
            };
            matched_broker_ids.push(broker_id);

            let broker_state = OrderState::from_broker_status(&broker_order.status);
            if broker_state.is_terminal() {
                report.status_mismatches.push(StatusMismatch {
                    user_id: user.user_id.clone(),
                    symbol: local.symbol.clone(),
                    client_order_id: local.client_order_id.clone(),
                    detail: format!(
                        "broker reports terminal {} while local state is {}",
                        broker_state, local.order_state
                    ),
                });
                continue;
            }

            if (local.filled_quantity - broker_order.filled_quantity).abs()
                > self.config.quantity_tolerance
            {
                report.status_mismatches.push(StatusMismatch {
                    user_id: user.user_id.clone(),
                    symbol: local.symbol.clone(),
                    client_order_id: local.client_order_id.clone(),
                    detail: format!(
                        "filled quantity drift: local {} vs broker {}",
                        local.filled_quantity, broker_order.filled_quantity
                    ),
                });
            }

            if let (Some(local_px), Some(broker_px)) =
                (local.average_price, broker_order.average_price)
            {
                if !within_price_tolerance(local_px, broker_px, self.config.price_tolerance_pct) {
                    report.status_mismatches.push(StatusMismatch {
                        user_id: user.user_id.clone(),
                        symbol: local.symbol.clone(),
                        client_order_id: local.client_order_id.clone(),
                        detail: format!(
                            "average price drift: local {} vs broker {}",
                            local_px, broker_px
                        ),
                    });
                }
            }
        }

        for broker_order in broker_orders {
            if !matched_broker_ids.contains(&broker_order.broker_order_id.as_str()) {
                report.order_mismatches.push(OrderMismatch {
                    user_id: user.user_id.clone(),
                    symbol: broker_order.symbol.clone(),
                    client_order_id: broker_order.client_order_id.clone(),
                    broker_order_id: Some(broker_order.broker_order_id.clone()),
                    detail: "open at broker but unknown locally".to_string(),
                });
            }
        }
    }

    fn diff_positions(
        &self,
        user: &UserRecord,
        local_trades: &[Trade],
        broker_positions: &[BrokerPosition],
        report: &mut ReconcileReport,
    ) {
        let broker_by_symbol: HashMap<&str, &BrokerPosition> = broker_positions
            .iter()
            .filter(|p| !p.quantity.is_zero())
            .map(|p| (p.symbol.as_str(), p))
            .collect();
        let mut seen: Vec<&str> = Vec::new();

        for trade in local_trades {
            seen.push(trade.symbol.as_str());
            let local_signed = match trade.side {
                Side::Buy => trade.quantity,
                Side::Sell => -trade.quantity,
            };

            match broker_by_symbol.get(trade.symbol.as_str()) {
                Some(broker_pos) => {
                    if (local_signed - broker_pos.quantity).abs() > self.config.quantity_tolerance
                    {
                        report.position_mismatches.push(PositionMismatch {
                            user_id: user.user_id.clone(),
                            symbol: trade.symbol.clone(),
                            local_quantity: local_signed,
                            broker_quantity: broker_pos.quantity,
                            detail: "quantity drift beyond tolerance".to_string(),
                        });
                    }
                }
                None => {
                    report.position_mismatches.push(PositionMismatch {
                        user_id: user.user_id.clone(),
                        symbol: trade.symbol.clone(),
                        local_quantity: local_signed,
                        broker_quantity: Decimal::ZERO,
                        detail: "open locally but flat at broker".to_string(),
                    });
                }
            }
        }

        for (symbol, broker_pos) in &broker_by_symbol {
            if !seen.contains(symbol) {
                report.position_mismatches.push(PositionMismatch {
                    user_id: user.user_id.clone(),
                    symbol: symbol.to_string(),
                    local_quantity: Decimal::ZERO,
                    broker_quantity: broker_pos.quantity,
                    detail: "position at broker with no local counterpart".to_string(),
                });
            }
        }
    }

    /// Remedial cancel of everything the user has open, best-effort. Local
    /// orders advance to a cancel state only along legal FSM edges: ACKED
    /// goes straight to CANCELLED on a confirmed cancel, PART_FILLED parks
    /// at CANCEL_REQUESTED until the fill poller settles it.
    async fn cancel_open_orders(&self, user: &UserRecord, local_orders: &[OrderIntent]) {
        let broker = self.registry.for_user(user);
        for order in local_orders {
            let Some(broker_id) = &order.broker_order_id else {
                continue;
            };
            match broker.cancel_order(&user.user_id, broker_id).await {
                Ok(()) => {
                    let target = match order.order_state {
                        OrderState::PartFilled => OrderState::CancelRequested,
                        _ => OrderState::Cancelled,
                    };
                    let now = self.ctx.time.now();
                    match order_transition(
                        &order.client_order_id,
                        &order.correlation_id,
                        order.order_state,
                        target,
                        Some("reconcile auto-cancel".to_string()),
                        now,
                    ) {
                        Ok(record) => {
                            let mut updated = order.clone();
                            updated.order_state = target;
                            updated.updated_at = now;
                            if let Err(e) = self
                                .store
                                .record_transition(&record)
                                .and_then(|_| self.store.save_order(&updated))
                            {
                                error!(
                                    client_order_id = %order.client_order_id,
                                    "Failed to persist auto-cancel: {}",
                                    e
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                client_order_id = %order.client_order_id,
                                "Auto-cancel hit an illegal transition: {}",
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        user_id = %user.user_id,
                        broker_order_id = %broker_id,
                        "Auto-cancel failed at broker: {}",
                        e
                    );
                }
            }
        }
    }

    /// Scheduled sweep loop. Spawn once at startup; overlapping ticks are
    /// skipped by the in-flight guard.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        info!(
            interval_secs = self.config.interval_secs,
            "Reconciliation loop started"
        );
        loop {
            ticker.tick().await;
            match self.reconcile().await {
                Ok(_) | Err(ReconcileError::AlreadyRunning) => {}
                Err(e) => error!("Reconciliation sweep failed: {}", e),
            }
        }
    }
}

fn within_price_tolerance(local: Decimal, broker: Decimal, tolerance_pct: Decimal) -> bool {
    if broker.is_zero() {
        return local.is_zero();
    }
    ((local - broker) / broker).abs() <= tolerance_pct
}
