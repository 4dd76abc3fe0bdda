use crate::broker::BrokerRegistry;
use crate::exit_queue::ExitRetryQueue;
use crate::guard_state::SystemGuard;
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What the kill switch actually did, for the operator response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanicReport {
    pub reason: String,
    pub users_processed: usize,
    pub orders_cancelled: usize,
    pub cancel_failures: usize,
    pub exits_queued: usize,
    pub autotrade_disabled: usize,
}

/// Global kill switch. Cancels broker-reported open orders, queues one
/// flatten per locally-open trade, and freezes autonomous trading. Broker
/// calls are best-effort: one venue being down must not block the panic
/// itself — that is exactly why exits go through the durable queue instead
/// of synchronous closes.
pub struct PanicService {
    store: Arc<PersistenceStore>,
    guard: Arc<SystemGuard>,
    registry: Arc<BrokerRegistry>,
    exit_queue: Arc<ExitRetryQueue>,
}

impl PanicService {
    pub fn new(
        store: Arc<PersistenceStore>,
        guard: Arc<SystemGuard>,
        registry: Arc<BrokerRegistry>,
        exit_queue: Arc<ExitRetryQueue>,
    ) -> Self {
        Self {
            store,
            guard,
            registry,
            exit_queue,
        }
    }

    pub async fn trigger_global_emergency(&self, reason: &str) -> Result<PanicReport, StoreError> {
        // Freeze first: placement is blocked before any cleanup starts
        self.guard.enter_panic(reason);

        let users = self.store.load_users()?;
        let mut report = PanicReport {
            reason: reason.to_string(),
            users_processed: 0,
            orders_cancelled: 0,
            cancel_failures: 0,
            exits_queued: 0,
            autotrade_disabled: 0,
        };

        for user in &users {
            report.users_processed += 1;
            let broker = self.registry.for_user(user);

            match broker.open_orders(&user.user_id).await {
                Ok(orders) => {
                    for order in orders {
                        match broker
                            .cancel_order(&user.user_id, &order.broker_order_id)
                            .await
                        {
                            Ok(()) => {
                                report.orders_cancelled += 1;
                                info!(
                                    user_id = %user.user_id,
                                    broker_order_id = %order.broker_order_id,
                                    "Panic cancel issued"
                                );
                            }
                            Err(e) => {
                                // Logged, not fatal: keep cancelling the rest
                                report.cancel_failures += 1;
                                error!(
                                    user_id = %user.user_id,
                                    broker_order_id = %order.broker_order_id,
                                    error = %e,
                                    "Panic cancel failed"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(
                        user_id = %user.user_id,
                        error = %e,
                        "Could not list open orders during panic"
                    );
                }
            }

            for trade in self.store.load_open_trades(&user.user_id)? {
                self.exit_queue.enqueue(&trade)?;
                report.exits_queued += 1;
            }
        }

        report.autotrade_disabled = self.store.disable_all_autotrading()?;

        warn!(
            users = report.users_processed,
            cancelled = report.orders_cancelled,
            cancel_failures = report.cancel_failures,
            exits = report.exits_queued,
            "🚨 Global emergency executed: {}",
            reason
        );
        Ok(report)
    }

    /// Authorized reset. Panic comes off but safe mode stays on until an
    /// operator has verified broker state and clears it separately.
    pub fn clear(&self) {
        self.guard.clear_panic();
    }
}
