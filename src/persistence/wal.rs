use crate::order_fsm::TransitionRecord;
use crate::persistence::redb_store::{RedbStore, StoreError};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// Tables
const WAL_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("wal_log");

/// Append-only audit journal. Lifecycle transitions, guard trips, reconcile
/// outcomes and dead-lettered exits all land here for post-hoc
/// reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    Transition(TransitionRecord),
    OrderSubmitted {
        client_order_id: String,
        user_id: String,
        payload: serde_json::Value,
    },
    RiskEvent {
        user_id: String,
        kind: String,
        detail: String,
    },
    ReconcileCompleted {
        mismatch: bool,
        order_mismatches: usize,
        status_mismatches: usize,
        position_mismatches: usize,
        summary: String,
    },
    PanicTriggered {
        reason: String,
    },
    SafeModeChanged {
        active: bool,
        reason: String,
    },
    ExitDeadLettered {
        request_id: String,
        trade_id: String,
        last_error: String,
    },
    RegimeComputed {
        user_id: String,
        payload: serde_json::Value,
    },
}

pub struct WalManager {
    store: Arc<RedbStore>,
}

impl WalManager {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let _ = txn.open_table(WAL_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn append(&self, entry: &WalEntry) -> Result<u64, StoreError> {
        let txn = self.store.begin_write()?;
        let sequence_id = {
            let mut table = txn.open_table(WAL_TABLE)?;
            let last_id = table.last()?.map(|(k, _)| k.value()).unwrap_or(0);
            let new_id = last_id + 1;

            let data = serde_json::to_vec(entry)?;
            table.insert(new_id, data)?;
            new_id
        };
        txn.commit()?;

        debug!("📝 Audit append: seq {}", sequence_id);
        Ok(sequence_id)
    }

    pub fn read_from(&self, start_seq: u64) -> Result<Vec<(u64, WalEntry)>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(WAL_TABLE)?;

        let mut entries = Vec::new();
        for result in table.range(start_seq..)? {
            let (k, v) = result?;
            let entry: WalEntry = serde_json::from_slice(&v.value())?;
            entries.push((k.value(), entry));
        }
        Ok(entries)
    }
}
