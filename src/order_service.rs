use crate::broker::adapter::{BrokerAck, BrokerError, BrokerOrderRequest};
use crate::broker::BrokerRegistry;
use crate::context::ServiceContext;
use crate::guard_state::SystemGuard;
use crate::idempotency::{IdempotencyOutcome, IdempotencyStore};
use crate::metrics;
use crate::model::{GuardDecision, OrderIntent, OrderRequest, OrderResult};
use crate::order_fsm::{order_transition, OrderState, StateError};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use crate::persistence::wal::WalEntry;
use crate::risk_guard::TradingGuard;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum OrderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Unknown order: {0}")]
    UnknownOrder(String),
    #[error("Response payload corrupt for idempotency key {0}")]
    CorruptReplay(String),
}

/// Outcome of an idempotent order call. Guard denials and idempotency
/// conflicts are expected control flow, not errors.
#[derive(Debug)]
pub enum PlacementOutcome {
    Placed(OrderResult),
    Replayed(OrderResult),
    Denied(GuardDecision),
    /// Another request with this key is in flight; retry later.
    Busy,
    /// Key reused with a different payload.
    Conflict,
}

/// The order placement flow behind `placeOrder`/`modifyOrder`/`cancelOrder`.
/// Consults the system guard and per-user circuit breaker, dedupes through
/// the idempotency store, drives the order FSM, and never reports a broker
/// outcome it does not have: retries exhausted means UNKNOWN, not filled.
pub struct OrderService {
    store: Arc<PersistenceStore>,
    idempotency: Arc<IdempotencyStore>,
    guard: Arc<SystemGuard>,
    trading_guard: Arc<TradingGuard>,
    registry: Arc<BrokerRegistry>,
    ctx: Arc<ServiceContext>,
}

impl OrderService {
    pub fn new(
        store: Arc<PersistenceStore>,
        idempotency: Arc<IdempotencyStore>,
        guard: Arc<SystemGuard>,
        trading_guard: Arc<TradingGuard>,
        registry: Arc<BrokerRegistry>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        Self {
            store,
            idempotency,
            guard,
            trading_guard,
            registry,
            ctx,
        }
    }

    pub async fn place_order(
        &self,
        user_id: &str,
        request: OrderRequest,
        idempotency_key: &str,
    ) -> Result<PlacementOutcome, OrderError> {
        // Guards first: nothing is deduped or submitted while blocked
        if let Some(reason) = self.guard.placement_blocked() {
            warn!(user_id, idempotency_key, "Placement blocked: {}", reason);
            return Ok(PlacementOutcome::Denied(GuardDecision::deny(reason, None)));
        }
        let decision = self
            .trading_guard
            .can_trade(user_id, self.ctx.time.now())?;
        if !decision.allowed {
            metrics::inc_risk_rejections();
            return Ok(PlacementOutcome::Denied(decision));
        }

        let request_hash = request.request_hash();
        match self
            .idempotency
            .begin_or_replay(user_id, idempotency_key, request_hash)?
        {
            IdempotencyOutcome::Replay(value) => {
                let result: OrderResult = serde_json::from_value(value)
                    .map_err(|_| OrderError::CorruptReplay(idempotency_key.to_string()))?;
                return Ok(PlacementOutcome::Replayed(result));
            }
            IdempotencyOutcome::Conflict => return Ok(PlacementOutcome::Conflict),
            IdempotencyOutcome::Busy => return Ok(PlacementOutcome::Busy),
            IdempotencyOutcome::Fresh => {}
        }

        let result = self.submit(user_id, &request).await;
        match &result {
            Ok(order_result) => {
                let payload = serde_json::to_value(order_result)
                    .unwrap_or(serde_json::Value::Null);
                self.idempotency
                    .complete(user_id, idempotency_key, request_hash, payload)?;
            }
            Err(e) => {
                // Local failure before any durable outcome: unlock the key
                // so the client's retry can begin fresh.
                self.idempotency
                    .fail(user_id, idempotency_key, request_hash, &e.to_string())?;
            }
        }
        result.map(PlacementOutcome::Placed)
    }

    /// Create the intent, submit it, and settle its state from the broker's
    /// answer (or the lack of one).
    async fn submit(
        &self,
        user_id: &str,
        request: &OrderRequest,
    ) -> Result<OrderResult, OrderError> {
        let now = self.ctx.time.now();
        let client_order_id = self.ctx.id.new_id();
        let correlation_id = self.ctx.id.new_id();
        let quantity = Decimal::from(request.quantity);
        let limit_price = request
            .limit_price_cents
            .map(|cents| Decimal::new(cents, 2));

        let mut intent = OrderIntent {
            client_order_id: client_order_id.clone(),
            user_id: user_id.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity,
            limit_price,
            order_state: OrderState::Created,
            broker_order_id: None,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            correlation_id: correlation_id.clone(),
            signal_id: request.signal_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.save_order(&intent)?;
        self.store.wal().append(&WalEntry::OrderSubmitted {
            client_order_id: client_order_id.clone(),
            user_id: user_id.to_string(),
            payload: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
        })?;

        self.advance(&mut intent, OrderState::Sent, Some("submitting to broker".into()))?;

        let broker_request = BrokerOrderRequest {
            client_order_id: client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity,
            limit_price,
        };
        let user = self
            .store
            .load_user(user_id)?
            .ok_or_else(|| OrderError::UnknownOrder(format!("no user record for {}", user_id)))?;
        let broker = self.registry.for_user(&user);

        info!(
            user_id,
            client_order_id = %client_order_id,
            symbol = %request.symbol,
            "🚀 Submitting order"
        );
        metrics::inc_orders_submitted();

        match broker.place_order(user_id, broker_request).await {
            Ok(ack) => self.settle_ack(&mut intent, ack),
            Err(BrokerError::Rejected(reason)) => {
                metrics::inc_orders_rejected();
                self.advance(&mut intent, OrderState::Rejected, Some(reason.clone()))?;
                Ok(self.result_of(&intent, Some(reason)))
            }
            Err(e) => {
                // Retries exhausted (or circuit open): the broker outcome is
                // unverified. UNKNOWN, never assumed filled or cancelled —
                // reconciliation settles it.
                metrics::inc_orders_unknown();
                error!(
                    client_order_id = %intent.client_order_id,
                    "Broker outcome unknown: {}",
                    e
                );
                self.advance(&mut intent, OrderState::Unknown, Some(e.to_string()))?;
                Ok(self.result_of(&intent, Some(format!("broker outcome unknown: {}", e))))
            }
        }
    }

    fn settle_ack(
        &self,
        intent: &mut OrderIntent,
        ack: BrokerAck,
    ) -> Result<OrderResult, OrderError> {
        self.advance(intent, OrderState::Acked, Some("broker ack".into()))?;
        // Assigned exactly once, at ACKED
        intent.broker_order_id = Some(ack.broker_order_id.clone());
        intent.filled_quantity = ack.filled_quantity;
        intent.average_price = ack.average_price;

        let reported = OrderState::from_broker_status(&ack.status);
        match reported {
            OrderState::Filled => {
                self.advance(intent, OrderState::Filled, Some("filled on ack".into()))?
            }
            OrderState::PartFilled => self.advance(
                intent,
                OrderState::PartFilled,
                Some("partial fill on ack".into()),
            )?,
            _ => self.store.save_order(intent)?,
        }
        Ok(self.result_of(intent, None))
    }

    pub async fn cancel_order(
        &self,
        user_id: &str,
        client_order_id: &str,
        idempotency_key: &str,
    ) -> Result<PlacementOutcome, OrderError> {
        // Cancels reduce risk; they are allowed even in safe mode.
        let request_hash = {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            ("cancel", client_order_id).hash(&mut hasher);
            hasher.finish()
        };
        match self
            .idempotency
            .begin_or_replay(user_id, idempotency_key, request_hash)?
        {
            IdempotencyOutcome::Replay(value) => {
                let result: OrderResult = serde_json::from_value(value)
                    .map_err(|_| OrderError::CorruptReplay(idempotency_key.to_string()))?;
                return Ok(PlacementOutcome::Replayed(result));
            }
            IdempotencyOutcome::Conflict => return Ok(PlacementOutcome::Conflict),
            IdempotencyOutcome::Busy => return Ok(PlacementOutcome::Busy),
            IdempotencyOutcome::Fresh => {}
        }

        let result = self.do_cancel(user_id, client_order_id).await;
        match &result {
            Ok(order_result) => {
                let payload =
                    serde_json::to_value(order_result).unwrap_or(serde_json::Value::Null);
                self.idempotency
                    .complete(user_id, idempotency_key, request_hash, payload)?;
            }
            Err(e) => {
                self.idempotency
                    .fail(user_id, idempotency_key, request_hash, &e.to_string())?;
            }
        }
        result.map(PlacementOutcome::Placed)
    }

    async fn do_cancel(
        &self,
        user_id: &str,
        client_order_id: &str,
    ) -> Result<OrderResult, OrderError> {
        let mut intent = self
            .store
            .load_order(client_order_id)?
            .ok_or_else(|| OrderError::UnknownOrder(client_order_id.to_string()))?;

        if intent.order_state.is_terminal() {
            return Ok(self.result_of(&intent, Some("already terminal".into())));
        }

        match (&intent.broker_order_id, intent.order_state) {
            (None, OrderState::Created) => {
                // Never submitted: reject it locally and stop
                self.advance(
                    &mut intent,
                    OrderState::Rejected,
                    Some("cancelled before submission".into()),
                )?;
                Ok(self.result_of(&intent, Some("cancelled before submission".into())))
            }
            (Some(broker_id), _) => {
                let broker_id = broker_id.clone();
                let user = self.store.load_user(user_id)?.ok_or_else(|| {
                    OrderError::UnknownOrder(format!("no user record for {}", user_id))
                })?;
                let broker = self.registry.for_user(&user);
                match broker.cancel_order(user_id, &broker_id).await {
                    Ok(()) => {
                        let target = match intent.order_state {
                            OrderState::PartFilled => OrderState::CancelRequested,
                            _ => OrderState::Cancelled,
                        };
                        self.advance(&mut intent, target, Some("user cancel".into()))?;
                        Ok(self.result_of(&intent, None))
                    }
                    Err(BrokerError::Rejected(reason)) => {
                        // Too late to cancel (already filled at the venue).
                        // Leave local state; reconciliation converges it.
                        Ok(self.result_of(&intent, Some(format!("cancel rejected: {}", reason))))
                    }
                    Err(e) => {
                        metrics::inc_orders_unknown();
                        self.advance(&mut intent, OrderState::Unknown, Some(e.to_string()))?;
                        Ok(self.result_of(
                            &intent,
                            Some(format!("cancel outcome unknown: {}", e)),
                        ))
                    }
                }
            }
            (None, state) => Ok(self.result_of(
                &intent,
                Some(format!("order in state {} has no broker id", state)),
            )),
        }
    }

    /// Amend by cancel-and-resubmit under one idempotency umbrella: the
    /// replacement intent gets a fresh client_order_id tied together by the
    /// caller's key.
    pub async fn modify_order(
        &self,
        user_id: &str,
        client_order_id: &str,
        replacement: OrderRequest,
        idempotency_key: &str,
    ) -> Result<PlacementOutcome, OrderError> {
        let cancel_key = format!("{}-cancel", idempotency_key);
        match self
            .cancel_order(user_id, client_order_id, &cancel_key)
            .await?
        {
            PlacementOutcome::Placed(_) | PlacementOutcome::Replayed(_) => {
                self.place_order(user_id, replacement, idempotency_key).await
            }
            other => Ok(other),
        }
    }

    fn advance(
        &self,
        intent: &mut OrderIntent,
        to: OrderState,
        reason: Option<String>,
    ) -> Result<(), OrderError> {
        let now = self.ctx.time.now();
        let record = order_transition(
            &intent.client_order_id,
            &intent.correlation_id,
            intent.order_state,
            to,
            reason,
            now,
        )?;
        self.store.record_transition(&record)?;
        intent.order_state = to;
        intent.updated_at = now;
        self.store.save_order(intent)?;
        Ok(())
    }

    fn result_of(&self, intent: &OrderIntent, reason: Option<String>) -> OrderResult {
        OrderResult {
            client_order_id: intent.client_order_id.clone(),
            broker_order_id: intent.broker_order_id.clone(),
            order_state: intent.order_state,
            filled_quantity: intent.filled_quantity,
            average_price: intent.average_price,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::adapter::BrokerPort;
    use crate::broker::paper::PaperBroker;
    use crate::config::RiskConfig;
    use crate::model::{OrderType, Side, UserRecord};
    use crate::persistence::redb_store::RedbStore;
    use crate::persistence::wal::WalManager;
    use rust_decimal_macros::dec;

    struct Fixture {
        service: OrderService,
        store: Arc<PersistenceStore>,
        guard: Arc<SystemGuard>,
        broker: Arc<PaperBroker>,
        path: String,
    }

    fn fixture() -> Fixture {
        let path = format!("/tmp/test_orders_{}.redb", uuid::Uuid::new_v4());
        let redb = Arc::new(RedbStore::new(&path).expect("create RedbStore"));
        let wal = Arc::new(WalManager::new(redb.clone()));
        let store = Arc::new(PersistenceStore::new(redb, wal).expect("init store"));
        let ctx = Arc::new(ServiceContext::new_system());
        let guard = Arc::new(SystemGuard::new(store.clone(), ctx.clone()).unwrap());
        let trading_guard = Arc::new(TradingGuard::new(
            RiskConfig::default(),
            store.clone(),
            ctx.clone(),
        ));
        let idempotency = Arc::new(IdempotencyStore::new(store.clone(), ctx.clone()));
        let broker = Arc::new(PaperBroker::new());
        let registry = Arc::new(BrokerRegistry::new(broker.clone(), broker.clone()));
        let service = OrderService::new(
            store.clone(),
            idempotency,
            guard.clone(),
            trading_guard,
            registry,
            ctx,
        );

        store
            .save_user(&UserRecord {
                user_id: "u1".to_string(),
                autotrade_enabled: true,
                is_paper: true,
                equity: dec!(100000),
            })
            .unwrap();
        broker.set_mark_price("AAPL", dec!(190));
        broker.fund("u1", dec!(100000));

        Fixture {
            service,
            store,
            guard,
            broker,
            path,
        }
    }

    fn market_buy() -> OrderRequest {
        OrderRequest {
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 10,
            limit_price_cents: None,
            signal_id: None,
        }
    }

    fn resting_limit() -> OrderRequest {
        OrderRequest {
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: 10,
            limit_price_cents: Some(18000),
            signal_id: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_reaches_filled() {
        let f = fixture();
        let outcome = f
            .service
            .place_order("u1", market_buy(), "key-1")
            .await
            .unwrap();
        let result = match outcome {
            PlacementOutcome::Placed(r) => r,
            other => panic!("expected placed, got {:?}", other),
        };
        assert_eq!(result.order_state, OrderState::Filled);
        assert!(result.broker_order_id.is_some());
        assert_eq!(result.filled_quantity, dec!(10));

        std::fs::remove_file(f.path).unwrap_or(());
    }

    #[tokio::test]
    async fn test_replay_returns_same_result_without_resubmitting() {
        let f = fixture();
        let first = f
            .service
            .place_order("u1", market_buy(), "key-1")
            .await
            .unwrap();
        let PlacementOutcome::Placed(first) = first else {
            panic!("expected placed");
        };

        let second = f
            .service
            .place_order("u1", market_buy(), "key-1")
            .await
            .unwrap();
        let PlacementOutcome::Replayed(second) = second else {
            panic!("expected replay");
        };
        assert_eq!(first.client_order_id, second.client_order_id);

        // Exactly one broker position of 10 shares — not 20
        let positions = f.broker.open_positions("u1").await.unwrap();
        assert_eq!(positions[0].quantity, dec!(10));

        std::fs::remove_file(f.path).unwrap_or(());
    }

    #[tokio::test]
    async fn test_same_key_different_payload_conflicts() {
        let f = fixture();
        f.service
            .place_order("u1", market_buy(), "key-1")
            .await
            .unwrap();

        let mut other = market_buy();
        other.quantity = 99;
        let outcome = f
            .service
            .place_order("u1", other, "key-1")
            .await
            .unwrap();
        assert!(matches!(outcome, PlacementOutcome::Conflict));

        std::fs::remove_file(f.path).unwrap_or(());
    }

    #[tokio::test]
    async fn test_safe_mode_denies_placement() {
        let f = fixture();
        f.guard.enter_safe_mode("reconcile mismatch");

        let outcome = f
            .service
            .place_order("u1", market_buy(), "key-1")
            .await
            .unwrap();
        let PlacementOutcome::Denied(decision) = outcome else {
            panic!("expected denial");
        };
        assert!(decision.reason.unwrap().contains("safe mode"));

        std::fs::remove_file(f.path).unwrap_or(());
    }

    #[tokio::test]
    async fn test_cancel_resting_limit() {
        let f = fixture();
        let outcome = f
            .service
            .place_order("u1", resting_limit(), "key-1")
            .await
            .unwrap();
        let PlacementOutcome::Placed(result) = outcome else {
            panic!("expected placed");
        };
        assert_eq!(result.order_state, OrderState::Acked);

        let outcome = f
            .service
            .cancel_order("u1", &result.client_order_id, "key-2")
            .await
            .unwrap();
        let PlacementOutcome::Placed(cancelled) = outcome else {
            panic!("expected placed");
        };
        assert_eq!(cancelled.order_state, OrderState::Cancelled);
        assert!(f.broker.open_orders("u1").await.unwrap().is_empty());

        std::fs::remove_file(f.path).unwrap_or(());
    }

    #[tokio::test]
    async fn test_modify_replaces_resting_order() {
        let f = fixture();
        let PlacementOutcome::Placed(original) = f
            .service
            .place_order("u1", resting_limit(), "key-1")
            .await
            .unwrap()
        else {
            panic!("expected placed");
        };

        let mut replacement = resting_limit();
        replacement.limit_price_cents = Some(18500);
        let PlacementOutcome::Placed(amended) = f
            .service
            .modify_order("u1", &original.client_order_id, replacement, "key-2")
            .await
            .unwrap()
        else {
            panic!("expected placed");
        };

        assert_ne!(original.client_order_id, amended.client_order_id);
        let cancelled = f
            .store
            .load_order(&original.client_order_id)
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.order_state, OrderState::Cancelled);

        let open = f.broker.open_orders("u1").await.unwrap();
        assert_eq!(open.len(), 1);

        std::fs::remove_file(f.path).unwrap_or(());
    }

    #[tokio::test]
    async fn test_broker_rejection_is_terminal() {
        let f = fixture();
        // No mark price for this symbol -> paper broker rejects
        let request = OrderRequest {
            symbol: "ZZZZ".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 10,
            limit_price_cents: None,
            signal_id: None,
        };
        let PlacementOutcome::Placed(result) = f
            .service
            .place_order("u1", request, "key-1")
            .await
            .unwrap()
        else {
            panic!("expected placed");
        };
        assert_eq!(result.order_state, OrderState::Rejected);
        assert!(result.reason.is_some());

        std::fs::remove_file(f.path).unwrap_or(());
    }
}
