use crate::model::{
    CorrelationRegimeState, ExitRetryRequest, IdempotencyRecord, IdempotencyStatus, OrderIntent,
    SystemGuardState, Trade, TradeRecord, TradingGuardState, UserRecord,
};
use crate::order_fsm::TransitionRecord;
use crate::persistence::redb_store::{RedbStore, StoreError};
use crate::persistence::wal::{WalEntry, WalManager};
use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use std::sync::Arc;

// Tables
const ORDERS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("order_intents");
const TRADES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("trades");
const TRADE_RECORDS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("trade_records");
const USER_GUARD_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("user_guard");
const SYSTEM_GUARD_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("system_guard");
const REGIME_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("correlation_regimes");
const IDEMPOTENCY_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("idempotency");
const EXIT_RETRY_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("exit_retry");
const USERS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("users");

const SYSTEM_GUARD_KEY: &str = "system";

/// Outcome of the first-writer-wins idempotency insert.
pub enum IdempotencyInsert {
    /// No record existed; an IN_PROGRESS row was written for this caller.
    Created,
    /// A record already existed; the caller decides replay/busy/conflict.
    Existing(IdempotencyRecord),
}

/// Durable ledger over redb. One writer at a time per the engine's locking,
/// which is what makes the read-check-write helpers below atomic.
pub struct PersistenceStore {
    store: Arc<RedbStore>,
    wal: Arc<WalManager>,
}

impl PersistenceStore {
    pub fn new(store: Arc<RedbStore>, wal: Arc<WalManager>) -> Result<Self, StoreError> {
        wal.initialize()?;
        let this = Self { store, wal };
        this.initialize_tables()?;
        Ok(this)
    }

    fn initialize_tables(&self) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let _ = txn.open_table(ORDERS_TABLE)?;
            let _ = txn.open_table(TRADES_TABLE)?;
            let _ = txn.open_table(TRADE_RECORDS_TABLE)?;
            let _ = txn.open_table(USER_GUARD_TABLE)?;
            let _ = txn.open_table(SYSTEM_GUARD_TABLE)?;
            let _ = txn.open_table(REGIME_TABLE)?;
            let _ = txn.open_table(IDEMPOTENCY_TABLE)?;
            let _ = txn.open_table(EXIT_RETRY_TABLE)?;
            let _ = txn.open_table(USERS_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn record_transition(&self, record: &TransitionRecord) -> Result<(), StoreError> {
        self.wal.append(&WalEntry::Transition(record.clone()))?;
        Ok(())
    }

    // --- Order intents ---

    pub fn save_order(&self, order: &OrderIntent) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(ORDERS_TABLE)?;
            let data = serde_json::to_vec(order)?;
            table.insert(order.client_order_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_order(&self, client_order_id: &str) -> Result<Option<OrderIntent>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(ORDERS_TABLE)?;
        let maybe = table
            .get(client_order_id)?
            .map(|v| serde_json::from_slice::<OrderIntent>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    pub fn load_open_orders(&self, user_id: &str) -> Result<Vec<OrderIntent>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(ORDERS_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let order: OrderIntent = serde_json::from_slice(&v.value())?;
            if order.user_id == user_id && order.is_open() {
                items.push(order);
            }
        }
        Ok(items)
    }

    // --- Trades / positions ---

    pub fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(TRADES_TABLE)?;
            let data = serde_json::to_vec(trade)?;
            table.insert(trade.trade_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_trade(&self, trade_id: &str) -> Result<Option<Trade>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(TRADES_TABLE)?;
        let maybe = table
            .get(trade_id)?
            .map(|v| serde_json::from_slice::<Trade>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    pub fn load_open_trades(&self, user_id: &str) -> Result<Vec<Trade>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(TRADES_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let trade: Trade = serde_json::from_slice(&v.value())?;
            if trade.user_id == user_id && trade.is_open() {
                items.push(trade);
            }
        }
        Ok(items)
    }

    // --- Closed trade records (Kelly history, circuit breaker input) ---

    pub fn save_trade_record(&self, record: &TradeRecord) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(TRADE_RECORDS_TABLE)?;
            let data = serde_json::to_vec(record)?;
            table.insert(record.trade_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Most recent closed trades for a user, newest last.
    pub fn load_recent_trade_records(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(TRADE_RECORDS_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let record: TradeRecord = serde_json::from_slice(&v.value())?;
            if record.user_id == user_id {
                items.push(record);
            }
        }
        items.sort_by(|a, b| a.closed_at.cmp(&b.closed_at));
        if items.len() > limit {
            let cut = items.len() - limit;
            items.drain(..cut);
        }
        Ok(items)
    }

    // --- Per-user guard state (optimistic concurrency) ---

    pub fn load_user_guard(&self, user_id: &str) -> Result<Option<TradingGuardState>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(USER_GUARD_TABLE)?;
        let maybe = table
            .get(user_id)?
            .map(|v| serde_json::from_slice::<TradingGuardState>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    /// Compare-and-swap write: fails with `VersionConflict` when the stored
    /// version no longer matches `expected_version`, so a concurrent close
    /// cannot be silently overwritten. The stored version is bumped.
    pub fn save_user_guard_cas(
        &self,
        state: &TradingGuardState,
        expected_version: u64,
    ) -> Result<TradingGuardState, StoreError> {
        let txn = self.store.begin_write()?;
        let saved = {
            let mut table = txn.open_table(USER_GUARD_TABLE)?;
            let current_version = table
                .get(state.user_id.as_str())?
                .map(|v| serde_json::from_slice::<TradingGuardState>(&v.value()))
                .transpose()?
                .map(|s| s.version)
                .unwrap_or(0);

            if current_version != expected_version {
                return Err(StoreError::VersionConflict(
                    state.user_id.clone(),
                    expected_version,
                ));
            }

            let mut next = state.clone();
            next.version = expected_version + 1;
            let data = serde_json::to_vec(&next)?;
            table.insert(next.user_id.as_str(), data)?;
            next
        };
        txn.commit()?;
        Ok(saved)
    }

    // --- System guard state (singleton) ---

    pub fn load_system_guard(&self) -> Result<SystemGuardState, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(SYSTEM_GUARD_TABLE)?;
        let maybe = table
            .get(SYSTEM_GUARD_KEY)?
            .map(|v| serde_json::from_slice::<SystemGuardState>(&v.value()))
            .transpose()?;
        Ok(maybe.unwrap_or_default())
    }

    pub fn save_system_guard(&self, state: &SystemGuardState) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(SYSTEM_GUARD_TABLE)?;
            let data = serde_json::to_vec(state)?;
            table.insert(SYSTEM_GUARD_KEY, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    // --- Correlation regime history (append-only) ---

    pub fn append_regime_state(&self, state: &CorrelationRegimeState) -> Result<(), StoreError> {
        self.wal.append(&WalEntry::RegimeComputed {
            user_id: state.user_id.clone(),
            payload: serde_json::to_value(state)?,
        })?;

        let key = format!(
            "{}:{:020}",
            state.user_id,
            state.computed_at.timestamp_millis()
        );
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(REGIME_TABLE)?;
            let data = serde_json::to_vec(state)?;
            table.insert(key.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_latest_regime(
        &self,
        user_id: &str,
    ) -> Result<Option<CorrelationRegimeState>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(REGIME_TABLE)?;
        let prefix = format!("{}:", user_id);
        let mut latest: Option<CorrelationRegimeState> = None;
        for res in table.range::<&str>(..)? {
            let (k, v) = res?;
            if k.value().starts_with(&prefix) {
                latest = Some(serde_json::from_slice(&v.value())?);
            }
        }
        Ok(latest)
    }

    // --- Idempotency ---

    fn idempotency_key(user_id: &str, key: &str) -> String {
        format!("{}:{}", user_id, key)
    }

    /// First-writer-wins: inserts an IN_PROGRESS record if none exists (or a
    /// prior one FAILED), otherwise returns the existing record untouched.
    /// Atomic within one write transaction.
    pub fn insert_idempotency(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyInsert, StoreError> {
        let composite = Self::idempotency_key(&record.user_id, &record.idempotency_key);
        let txn = self.store.begin_write()?;
        let outcome = {
            let mut table = txn.open_table(IDEMPOTENCY_TABLE)?;
            let existing = table
                .get(composite.as_str())?
                .map(|v| serde_json::from_slice::<IdempotencyRecord>(&v.value()))
                .transpose()?;

            match existing {
                Some(rec) if rec.status != IdempotencyStatus::Failed => {
                    IdempotencyInsert::Existing(rec)
                }
                _ => {
                    // Absent, or a failed attempt being retried
                    let data = serde_json::to_vec(record)?;
                    table.insert(composite.as_str(), data)?;
                    IdempotencyInsert::Created
                }
            }
        };
        txn.commit()?;
        Ok(outcome)
    }

    pub fn update_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let composite = Self::idempotency_key(&record.user_id, &record.idempotency_key);
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(IDEMPOTENCY_TABLE)?;
            let data = serde_json::to_vec(record)?;
            table.insert(composite.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_idempotency(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let composite = Self::idempotency_key(user_id, key);
        let txn = self.store.begin_read()?;
        let table = txn.open_table(IDEMPOTENCY_TABLE)?;
        let maybe = table
            .get(composite.as_str())?
            .map(|v| serde_json::from_slice::<IdempotencyRecord>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    // --- Exit retry queue ---

    pub fn save_exit_request(&self, request: &ExitRetryRequest) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(EXIT_RETRY_TABLE)?;
            let data = serde_json::to_vec(request)?;
            table.insert(request.request_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_exit_request(
        &self,
        request_id: &str,
    ) -> Result<Option<ExitRetryRequest>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EXIT_RETRY_TABLE)?;
        let maybe = table
            .get(request_id)?
            .map(|v| serde_json::from_slice::<ExitRetryRequest>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    /// Unresolved, non-dead-lettered requests whose next attempt is due.
    pub fn load_due_exit_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExitRetryRequest>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EXIT_RETRY_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let req: ExitRetryRequest = serde_json::from_slice(&v.value())?;
            if !req.resolved && !req.dlq_logged && req.next_attempt_at <= now {
                items.push(req);
            }
        }
        items.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        Ok(items)
    }

    /// An unresolved queue entry already covering this trade, if any.
    pub fn find_pending_exit_for_trade(
        &self,
        trade_id: &str,
    ) -> Result<Option<ExitRetryRequest>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EXIT_RETRY_TABLE)?;
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let req: ExitRetryRequest = serde_json::from_slice(&v.value())?;
            if req.trade_id == trade_id && !req.resolved {
                return Ok(Some(req));
            }
        }
        Ok(None)
    }

    // --- Users ---

    pub fn save_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(USERS_TABLE)?;
            let data = serde_json::to_vec(user)?;
            table.insert(user.user_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(USERS_TABLE)?;
        let maybe = table
            .get(user_id)?
            .map(|v| serde_json::from_slice::<UserRecord>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    pub fn load_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(USERS_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            items.push(serde_json::from_slice::<UserRecord>(&v.value())?);
        }
        Ok(items)
    }

    /// Batch-disable autonomous trading, used by the panic path so the
    /// scheduler cannot resubmit entries while panic is active.
    pub fn disable_all_autotrading(&self) -> Result<usize, StoreError> {
        let users = self.load_users()?;
        let txn = self.store.begin_write()?;
        let mut changed = 0;
        {
            let mut table = txn.open_table(USERS_TABLE)?;
            for mut user in users {
                if user.autotrade_enabled {
                    user.autotrade_enabled = false;
                    let data = serde_json::to_vec(&user)?;
                    table.insert(user.user_id.as_str(), data)?;
                    changed += 1;
                }
            }
        }
        txn.commit()?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use crate::order_fsm::PositionState;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    pub fn create_test_store() -> (Arc<PersistenceStore>, String) {
        let path = format!("/tmp/test_aegis_{}.redb", uuid::Uuid::new_v4());
        let redb = Arc::new(RedbStore::new(&path).expect("create RedbStore"));
        let wal = Arc::new(WalManager::new(redb.clone()));
        let store = Arc::new(PersistenceStore::new(redb, wal).expect("init store"));
        (store, path)
    }

    fn open_trade(user: &str, symbol: &str) -> Trade {
        Trade {
            trade_id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            position_state: PositionState::Open,
            quantity: dec!(10),
            entry_price: dec!(100),
            exit_price: None,
            stop_loss: dec!(95),
            is_paper_trade: true,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_open_trades_filter_by_user_and_state() {
        let (store, path) = create_test_store();

        let mut closed = open_trade("alice", "AAPL");
        closed.position_state = PositionState::Closed;
        store.save_trade(&closed).unwrap();
        store.save_trade(&open_trade("alice", "MSFT")).unwrap();
        store.save_trade(&open_trade("bob", "MSFT")).unwrap();

        let open = store.load_open_trades("alice").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "MSFT");

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_guard_cas_rejects_stale_version() {
        let (store, path) = create_test_store();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let state = TradingGuardState::fresh("carol", day);
        let saved = store.save_user_guard_cas(&state, 0).unwrap();
        assert_eq!(saved.version, 1);

        // Re-writing with the stale version must conflict
        let err = store.save_user_guard_cas(&state, 0).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_, 0)));

        // And with the fresh version it goes through
        let next = store.save_user_guard_cas(&saved, 1).unwrap();
        assert_eq!(next.version, 2);

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_idempotency_first_writer_wins() {
        let (store, path) = create_test_store();

        let record = IdempotencyRecord {
            user_id: "dave".to_string(),
            idempotency_key: "key-1".to_string(),
            request_hash: 42,
            status: IdempotencyStatus::InProgress,
            response: None,
            created_at: Utc::now(),
        };

        assert!(matches!(
            store.insert_idempotency(&record).unwrap(),
            IdempotencyInsert::Created
        ));
        assert!(matches!(
            store.insert_idempotency(&record).unwrap(),
            IdempotencyInsert::Existing(_)
        ));

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_due_exit_requests_respect_schedule() {
        let (store, path) = create_test_store();
        let now = Utc::now();

        let due = ExitRetryRequest {
            request_id: "r-1".to_string(),
            trade_id: "t-1".to_string(),
            user_id: "erin".to_string(),
            symbol: "NVDA".to_string(),
            attempts: 1,
            resolved: false,
            next_attempt_at: now - chrono::Duration::seconds(1),
            last_error: None,
            dlq_logged: false,
            created_at: now,
        };
        let mut later = due.clone();
        later.request_id = "r-2".to_string();
        later.next_attempt_at = now + chrono::Duration::minutes(5);

        store.save_exit_request(&due).unwrap();
        store.save_exit_request(&later).unwrap();

        let ready = store.load_due_exit_requests(now).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].request_id, "r-1");

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_disable_all_autotrading_counts_changes() {
        let (store, path) = create_test_store();
        for (id, enabled) in [("u1", true), ("u2", false), ("u3", true)] {
            store
                .save_user(&UserRecord {
                    user_id: id.to_string(),
                    autotrade_enabled: enabled,
                    is_paper: true,
                    equity: dec!(100000),
                })
                .unwrap();
        }
        assert_eq!(store.disable_all_autotrading().unwrap(), 2);
        assert!(store.load_users().unwrap().iter().all(|u| !u.autotrade_enabled));

        std::fs::remove_file(path).unwrap_or(());
    }
}
