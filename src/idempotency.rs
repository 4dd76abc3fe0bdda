use crate::context::ServiceContext;
use crate::metrics;
use crate::model::{IdempotencyRecord, IdempotencyStatus};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::{IdempotencyInsert, PersistenceStore};
use std::sync::Arc;
use tracing::{info, warn};

/// What the caller should do with a placement request.
#[derive(Debug)]
pub enum IdempotencyOutcome {
    /// First time this key is seen: proceed, then call `complete` or `fail`.
    Fresh,
    /// Same key and payload already completed: return this response verbatim,
    /// do not touch the broker.
    Replay(serde_json::Value),
    /// Same key but a different payload — client error.
    Conflict,
    /// Another caller holds the key IN_PROGRESS. Retry later; never submit.
    Busy,
}

/// Deduplicates externally-retried order requests. At most one broker
/// submission happens per `(user_id, idempotency_key)` no matter how many
/// concurrent duplicates arrive: the durable first-writer-wins insert is the
/// lock.
pub struct IdempotencyStore {
    store: Arc<PersistenceStore>,
    ctx: Arc<ServiceContext>,
}

impl IdempotencyStore {
    pub fn new(store: Arc<PersistenceStore>, ctx: Arc<ServiceContext>) -> Self {
        Self { store, ctx }
    }

    pub fn begin_or_replay(
        &self,
        user_id: &str,
        key: &str,
        request_hash: u64,
    ) -> Result<IdempotencyOutcome, StoreError> {
        let record = IdempotencyRecord {
            user_id: user_id.to_string(),
            idempotency_key: key.to_string(),
            request_hash,
            status: IdempotencyStatus::InProgress,
            response: None,
            created_at: self.ctx.time.now(),
        };

        match self.store.insert_idempotency(&record)? {
            IdempotencyInsert::Created => Ok(IdempotencyOutcome::Fresh),
            IdempotencyInsert::Existing(existing) => {
                if existing.request_hash != request_hash {
                    warn!(
                        user_id,
                        key, "Idempotency key reused with a different payload"
                    );
                    return Ok(IdempotencyOutcome::Conflict);
                }
                match existing.status {
                    IdempotencyStatus::Completed => {
                        metrics::inc_idempotent_replays();
                        info!(user_id, key, "Replaying stored response");
                        Ok(IdempotencyOutcome::Replay(
                            existing.response.unwrap_or(serde_json::Value::Null),
                        ))
                    }
                    IdempotencyStatus::InProgress => Ok(IdempotencyOutcome::Busy),
                    // insert_idempotency already restarts FAILED records
                    IdempotencyStatus::Failed => Ok(IdempotencyOutcome::Fresh),
                }
            }
        }
    }

    pub fn complete(
        &self,
        user_id: &str,
        key: &str,
        request_hash: u64,
        response: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store.update_idempotency(&IdempotencyRecord {
            user_id: user_id.to_string(),
            idempotency_key: key.to_string(),
            request_hash,
            status: IdempotencyStatus::Completed,
            response: Some(response),
            created_at: self.ctx.time.now(),
        })
    }

    pub fn fail(
        &self,
        user_id: &str,
        key: &str,
        request_hash: u64,
        error: &str,
    ) -> Result<(), StoreError> {
        self.store.update_idempotency(&IdempotencyRecord {
            user_id: user_id.to_string(),
            idempotency_key: key.to_string(),
            request_hash,
            status: IdempotencyStatus::Failed,
            response: Some(serde_json::json!({ "error": error })),
            created_at: self.ctx.time.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::redb_store::RedbStore;
    use crate::persistence::wal::WalManager;

    fn create_test_idempotency() -> (IdempotencyStore, String) {
        let path = format!("/tmp/test_idem_{}.redb", uuid::Uuid::new_v4());
        let redb = Arc::new(RedbStore::new(&path).expect("create RedbStore"));
        let wal = Arc::new(WalManager::new(redb.clone()));
        let store = Arc::new(PersistenceStore::new(redb, wal).expect("init store"));
        let ctx = Arc::new(ServiceContext::new_system());
        (IdempotencyStore::new(store, ctx), path)
    }

    #[test]
    fn test_fresh_then_replay() {
        let (idem, path) = create_test_idempotency();

        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));
        idem.complete("u1", "k1", 7, serde_json::json!({"order": "ok"}))
            .unwrap();

        match idem.begin_or_replay("u1", "k1", 7).unwrap() {
            IdempotencyOutcome::Replay(resp) => {
                assert_eq!(resp["order"], "ok");
            }
            other => panic!("expected replay, got {:?}", other),
        }

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_in_progress_is_busy_not_double_submit() {
        let (idem, path) = create_test_idempotency();

        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));
        // Second caller while still IN_PROGRESS
        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Busy
        ));

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_different_hash_conflicts() {
        let (idem, path) = create_test_idempotency();

        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));
        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 8).unwrap(),
            IdempotencyOutcome::Conflict
        ));

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_failed_attempt_is_retryable() {
        let (idem, path) = create_test_idempotency();

        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));
        idem.fail("u1", "k1", 7, "broker down").unwrap();

        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_keys_are_scoped_per_user() {
        let (idem, path) = create_test_idempotency();

        assert!(matches!(
            idem.begin_or_replay("u1", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));
        // Same key under another user is independent
        assert!(matches!(
            idem.begin_or_replay("u2", "k1", 7).unwrap(),
            IdempotencyOutcome::Fresh
        ));

        std::fs::remove_file(path).unwrap_or(());
    }
}
