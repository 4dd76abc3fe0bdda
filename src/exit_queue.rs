use crate::broker::adapter::BrokerOrderRequest;
use crate::broker::BrokerRegistry;
use crate::config::ExitConfig;
use crate::context::ServiceContext;
use crate::metrics;
use crate::model::{ExitRetryRequest, OrderType, Trade};
use crate::order_fsm::{position_transition, PositionState};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use crate::persistence::wal::WalEntry;
use chrono::Duration as ChronoDuration;
use rand::Rng;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

/// Durable retry queue for flatten exits. An exit that cannot be submitted
/// is not an exception to swallow: it is parked here, retried with
/// exponential backoff, and dead-lettered for manual handling once attempts
/// are exhausted. Backed by a table, not memory — an exit failure must
/// survive a process restart.
pub struct ExitRetryQueue {
    config: ExitConfig,
    store: Arc<PersistenceStore>,
    registry: Arc<BrokerRegistry>,
    ctx: Arc<ServiceContext>,
}

impl ExitRetryQueue {
    pub fn new(
        config: ExitConfig,
        store: Arc<PersistenceStore>,
        registry: Arc<BrokerRegistry>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            ctx,
        }
    }

    /// Queue a flatten for a trade. Idempotent per trade: an unresolved
    /// request already covering it is returned instead of duplicated.
    pub fn enqueue(&self, trade: &Trade) -> Result<ExitRetryRequest, StoreError> {
        if let Some(existing) = self.store.find_pending_exit_for_trade(&trade.trade_id)? {
            return Ok(existing);
        }

        let request = ExitRetryRequest {
            request_id: self.ctx.id.new_id(),
            trade_id: trade.trade_id.clone(),
            user_id: trade.user_id.clone(),
            symbol: trade.symbol.clone(),
            attempts: 0,
            resolved: false,
            next_attempt_at: self.ctx.time.now(),
            last_error: None,
            dlq_logged: false,
            created_at: self.ctx.time.now(),
        };
        self.store.save_exit_request(&request)?;
        info!(
            trade_id = %trade.trade_id,
            user_id = %trade.user_id,
            "Exit queued for flatten"
        );
        Ok(request)
    }

    /// One pass over due requests. Called by the worker loop and directly by
    /// tests.
    pub async fn process_due(&self) -> Result<usize, StoreError> {
        let now = self.ctx.time.now();
        let due = self.store.load_due_exit_requests(now)?;
        let mut processed = 0;
        for request in due {
            self.attempt(request).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn attempt(&self, mut request: ExitRetryRequest) -> Result<(), StoreError> {
        let trade = match self.store.load_trade(&request.trade_id)? {
            Some(t) => t,
            None => {
                warn!(request_id = %request.request_id, "Exit request for unknown trade — resolving");
                request.resolved = true;
                return self.store.save_exit_request(&request);
            }
        };
        if !trade.is_open() {
            request.resolved = true;
            return self.store.save_exit_request(&request);
        }

        metrics::inc_exit_retries();
        request.attempts += 1;

        let broker = match self.store.load_user(&trade.user_id)? {
            Some(user) => self.registry.for_user(&user),
            None => {
                warn!(user_id = %trade.user_id, "No user record for exit — using paper backend");
                self.registry.paper()
            }
        };

        let exit_order = BrokerOrderRequest {
            client_order_id: format!("exit-{}-{}", request.trade_id, request.attempts),
            symbol: trade.symbol.clone(),
            side: trade.side.opposite(),
            order_type: OrderType::Market,
            quantity: trade.quantity,
            limit_price: None,
        };

        match broker.place_order(&trade.user_id, exit_order).await {
            Ok(ack) => {
                info!(
                    trade_id = %trade.trade_id,
                    broker_order_id = %ack.broker_order_id,
                    attempt = request.attempts,
                    "Flatten exit submitted"
                );
                self.close_trade(&trade, &request)?;
                request.resolved = true;
                request.last_error = None;
                self.store.save_exit_request(&request)
            }
            Err(e) => {
                request.last_error = Some(e.to_string());
                if request.attempts >= self.config.max_attempts {
                    // Exhausted: dead-letter and leave unresolved for manual
                    // intervention.
                    request.dlq_logged = true;
                    metrics::inc_exit_dlq();
                    error!(
                        request_id = %request.request_id,
                        trade_id = %request.trade_id,
                        attempts = request.attempts,
                        error = %e,
                        "🚨 Exit retries exhausted — dead-lettered"
                    );
                    self.store.wal().append(&WalEntry::ExitDeadLettered {
                        request_id: request.request_id.clone(),
                        trade_id: request.trade_id.clone(),
                        last_error: e.to_string(),
                    })?;
                } else {
                    let delay = self.backoff(request.attempts);
                    request.next_attempt_at = self.ctx.time.now() + delay;
                    warn!(
                        request_id = %request.request_id,
                        attempt = request.attempts,
                        retry_in_secs = delay.num_seconds(),
                        error = %e,
                        "Exit attempt failed, backing off"
                    );
                }
                self.store.save_exit_request(&request)
            }
        }
    }

    fn close_trade(&self, trade: &Trade, request: &ExitRetryRequest) -> Result<(), StoreError> {
        let now = self.ctx.time.now();
        let mut updated = trade.clone();

        // OPEN → EXITING → CLOSED, both audited
        if updated.position_state == PositionState::Open {
            if let Ok(rec) = position_transition(
                &updated.trade_id,
                &request.request_id,
                updated.position_state,
                PositionState::Exiting,
                Some("flatten exit submitted".to_string()),
                now,
            ) {
                self.store.record_transition(&rec)?;
                updated.position_state = PositionState::Exiting;
            }
        }
        if let Ok(rec) = position_transition(
            &updated.trade_id,
            &request.request_id,
            updated.position_state,
            PositionState::Closed,
            Some("flatten exit filled".to_string()),
            now,
        ) {
            self.store.record_transition(&rec)?;
            updated.position_state = PositionState::Closed;
            updated.closed_at = Some(now);
        }
        self.store.save_trade(&updated)
    }

    fn backoff(&self, attempts: u32) -> ChronoDuration {
        let base = self.config.base_backoff_secs.max(1);
        let exp = base * (1u64 << attempts.min(10));
        let jitter = rand::thread_rng().gen_range(0..=base);
        ChronoDuration::seconds((exp + jitter) as i64)
    }

    /// Worker loop polling the queue. Spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        info!(
            poll_secs = self.config.poll_interval_secs,
            "Exit retry worker started"
        );
        loop {
            ticker.tick().await;
            if let Err(e) = self.process_due().await {
                error!("Exit retry pass failed: {}", e);
            }
        }
    }
}
