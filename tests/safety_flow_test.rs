//! System-wide safety flow integration tests
//!
//! Reconciliation drift flips safe mode and blocks placement; the global
//! panic cancels, queues flattening exits, and freezes autonomous trading;
//! clearing panic re-arms safe mode until an operator signs off.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use aegis_execution_rs::broker::adapter::{BrokerOrder, BrokerPosition};
use aegis_execution_rs::broker::paper::PaperBroker;
use aegis_execution_rs::broker::BrokerRegistry;
use aegis_execution_rs::config::{ExitConfig, ReconcileConfig, RiskConfig};
use aegis_execution_rs::context::ServiceContext;
use aegis_execution_rs::exit_queue::ExitRetryQueue;
use aegis_execution_rs::guard_state::SystemGuard;
use aegis_execution_rs::idempotency::IdempotencyStore;
use aegis_execution_rs::model::{
    OrderRequest, OrderType, Side, Trade, UserRecord,
};
use aegis_execution_rs::order_fsm::PositionState;
use aegis_execution_rs::order_service::{OrderService, PlacementOutcome};
use aegis_execution_rs::panic_service::PanicService;
use aegis_execution_rs::persistence::redb_store::RedbStore;
use aegis_execution_rs::persistence::store::PersistenceStore;
use aegis_execution_rs::persistence::wal::WalManager;
use aegis_execution_rs::reconciler::ReconciliationEngine;
use aegis_execution_rs::risk_guard::TradingGuard;

struct Stack {
    store: Arc<PersistenceStore>,
    guard: Arc<SystemGuard>,
    broker: Arc<PaperBroker>,
    reconciler: Arc<ReconciliationEngine>,
    panic_service: PanicService,
    exit_queue: Arc<ExitRetryQueue>,
    order_service: Arc<OrderService>,
    path: String,
}

fn stack() -> Stack {
    let path = format!("/tmp/test_safety_{}.redb", uuid::Uuid::new_v4());
    let redb = Arc::new(RedbStore::new(&path).expect("create RedbStore"));
    let wal = Arc::new(WalManager::new(redb.clone()));
    let store = Arc::new(PersistenceStore::new(redb, wal).expect("init store"));
    let ctx = Arc::new(ServiceContext::new_system());
    let guard = Arc::new(SystemGuard::new(store.clone(), ctx.clone()).unwrap());
    let broker = Arc::new(PaperBroker::new());
    let registry = Arc::new(BrokerRegistry::new(broker.clone(), broker.clone()));

    let reconciler = Arc::new(ReconciliationEngine::new(
        ReconcileConfig::default(),
        store.clone(),
        registry.clone(),
        guard.clone(),
        ctx.clone(),
    ));
    let exit_queue = Arc::new(ExitRetryQueue::new(
        ExitConfig::default(),
        store.clone(),
        registry.clone(),
        ctx.clone(),
    ));
    let panic_service = PanicService::new(
        store.clone(),
        guard.clone(),
        registry.clone(),
        exit_queue.clone(),
    );
    let trading_guard = Arc::new(TradingGuard::new(
        RiskConfig::default(),
        store.clone(),
        ctx.clone(),
    ));
    let idempotency = Arc::new(IdempotencyStore::new(store.clone(), ctx.clone()));
    let order_service = Arc::new(OrderService::new(
        store.clone(),
        idempotency,
        guard.clone(),
        trading_guard,
        registry,
        ctx,
    ));

    store
        .save_user(&UserRecord {
            user_id: "trader".to_string(),
            autotrade_enabled: true,
            is_paper: true,
            equity: dec!(100000),
        })
        .unwrap();
    broker.set_mark_price("AAPL", dec!(190));
    broker.fund("trader", dec!(100000));

    Stack {
        store,
        guard,
        broker,
        reconciler,
        panic_service,
        exit_queue,
        order_service,
        path,
    }
}

fn open_trade(symbol: &str) -> Trade {
    Trade {
        trade_id: uuid::Uuid::new_v4().to_string(),
        user_id: "trader".to_string(),
        symbol: symbol.to_string(),
        side: Side::Buy,
        position_state: PositionState::Open,
        quantity: dec!(10),
        entry_price: dec!(190),
        exit_price: None,
        stop_loss: dec!(185),
        is_paper_trade: true,
        opened_at: chrono::Utc::now(),
        closed_at: None,
    }
}

#[tokio::test]
async fn test_mismatch_flips_safe_mode_and_blocks_orders() {
    let s = stack();

    // A broker order the ledger knows nothing about
    s.broker.seed_order(
        "trader",
        BrokerOrder {
            broker_order_id: "mystery-1".to_string(),
            client_order_id: None,
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            quantity: dec!(5),
            filled_quantity: Decimal::ZERO,
            average_price: None,
            status: "ACKED".to_string(),
        },
    );

    let report = s.reconciler.reconcile().await.unwrap();
    assert!(report.mismatch);
    assert!(s.guard.is_safe_mode());

    // New placement is now refused with the mismatch reason
    let outcome = s
        .order_service
        .place_order(
            "trader",
            OrderRequest {
                symbol: "AAPL".to_string(),
                side: Side::Buy,
                order_type: OrderType::Market,
                quantity: 5,
                limit_price_cents: None,
                signal_id: None,
            },
            "blocked-by-safe-mode",
        )
        .await
        .unwrap();
    let PlacementOutcome::Denied(decision) = outcome else {
        panic!("expected denial under safe mode");
    };
    assert!(decision.reason.unwrap().contains("safe mode"));

    // Operator clears after review; placement works again
    s.guard.clear_safe_mode();
    let outcome = s
        .order_service
        .place_order(
            "trader",
            OrderRequest {
                symbol: "AAPL".to_string(),
                side: Side::Buy,
                order_type: OrderType::Market,
                quantity: 5,
                limit_price_cents: None,
                signal_id: None,
            },
            "after-clear",
        )
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Placed(_)));

    std::fs::remove_file(s.path).unwrap_or(());
}

#[tokio::test]
async fn test_panic_flattens_through_the_queue() {
    let s = stack();

    let trade_a = open_trade("AAPL");
    let trade_b = open_trade("MSFT");
    s.store.save_trade(&trade_a).unwrap();
    s.store.save_trade(&trade_b).unwrap();
    s.broker.set_mark_price("MSFT", dec!(400));
    s.broker.seed_position(
        "trader",
        BrokerPosition {
            symbol: "AAPL".to_string(),
            quantity: dec!(10),
            average_entry_price: dec!(190),
        },
    );

    let report = s
        .panic_service
        .trigger_global_emergency("volatility halt")
        .await
        .unwrap();
    assert_eq!(report.exits_queued, 2);
    assert_eq!(report.autotrade_disabled, 1);
    assert!(s.guard.is_panic_mode());

    // The queue drains both exits
    assert_eq!(s.exit_queue.process_due().await.unwrap(), 2);

    let a = s.store.load_trade(&trade_a.trade_id).unwrap().unwrap();
    let b = s.store.load_trade(&trade_b.trade_id).unwrap().unwrap();
    assert_eq!(a.position_state, PositionState::Closed);
    assert_eq!(b.position_state, PositionState::Closed);

    // Panic clear keeps safe mode on for operator review
    s.panic_service.clear();
    assert!(!s.guard.is_panic_mode());
    assert!(s.guard.is_safe_mode());

    std::fs::remove_file(s.path).unwrap_or(());
}
