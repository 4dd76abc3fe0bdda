use crate::context::ServiceContext;
use crate::metrics;
use crate::model::{SystemGuardState, SystemMode};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use crate::persistence::wal::WalEntry;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Owner of the process-wide guard aggregate.
///
/// Every read/write of safe mode and panic mode goes through here — the
/// pipeline and order service only consult it, reconciliation and the panic
/// service mutate it, and every mutation is persisted before it is visible.
pub struct SystemGuard {
    state: RwLock<SystemGuardState>,
    store: Arc<PersistenceStore>,
    ctx: Arc<ServiceContext>,
}

impl SystemGuard {
    pub fn new(store: Arc<PersistenceStore>, ctx: Arc<ServiceContext>) -> Result<Self, StoreError> {
        let state = store.load_system_guard()?;
        metrics::set_safe_mode(state.safe_mode);
        metrics::set_panic_mode(state.panic_mode);
        if state.safe_mode || state.panic_mode {
            warn!(
                safe_mode = state.safe_mode,
                panic_mode = state.panic_mode,
                "Guard state restored with protection active"
            );
        }
        Ok(Self {
            state: RwLock::new(state),
            store,
            ctx,
        })
    }

    pub fn snapshot(&self) -> SystemGuardState {
        self.state.read().clone()
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state.read().safe_mode
    }

    pub fn is_panic_mode(&self) -> bool {
        self.state.read().panic_mode
    }

    /// New order placement is blocked while either protection is active.
    pub fn placement_blocked(&self) -> Option<String> {
        let state = self.state.read();
        if state.panic_mode {
            return Some(format!(
                "panic mode active: {}",
                state.panic_reason.as_deref().unwrap_or("unspecified")
            ));
        }
        if state.safe_mode {
            return Some(format!(
                "safe mode active: {}",
                state.safe_mode_reason.as_deref().unwrap_or("unspecified")
            ));
        }
        None
    }

    pub fn enter_safe_mode(&self, reason: &str) {
        let mut state = self.state.write();
        if state.safe_mode {
            return;
        }
        state.safe_mode = true;
        state.safe_mode_reason = Some(reason.to_string());
        if state.system_mode == SystemMode::Normal {
            state.system_mode = SystemMode::SafeMode;
        }
        warn!("🚨 SAFE MODE ENGAGED: {}", reason);
        metrics::set_safe_mode(true);
        self.persist(&state);
        let _ = self.store.wal().append(&WalEntry::SafeModeChanged {
            active: true,
            reason: reason.to_string(),
        });
    }

    /// Authorized operator action; the only way safe mode comes off.
    pub fn clear_safe_mode(&self) {
        let mut state = self.state.write();
        if !state.safe_mode {
            return;
        }
        state.safe_mode = false;
        state.safe_mode_reason = None;
        if !state.panic_mode {
            state.system_mode = SystemMode::Normal;
        }
        info!("✅ Safe mode cleared by operator");
        metrics::set_safe_mode(false);
        self.persist(&state);
        let _ = self.store.wal().append(&WalEntry::SafeModeChanged {
            active: false,
            reason: "operator clear".to_string(),
        });
    }

    pub fn enter_panic(&self, reason: &str) {
        let mut state = self.state.write();
        state.panic_mode = true;
        state.panic_reason = Some(reason.to_string());
        state.panic_at = Some(self.ctx.time.now());
        state.system_mode = SystemMode::Panic;
        error!("🚨 PANIC MODE: {}", reason);
        metrics::set_panic_mode(true);
        self.persist(&state);
        let _ = self.store.wal().append(&WalEntry::PanicTriggered {
            reason: reason.to_string(),
        });
    }

    /// Clearing panic re-arms safe mode rather than fully lifting
    /// protection: operators verify broker state and then clear safe mode
    /// explicitly.
    pub fn clear_panic(&self) {
        let mut state = self.state.write();
        if !state.panic_mode {
            return;
        }
        state.panic_mode = false;
        state.panic_reason = None;
        state.safe_mode = true;
        state.safe_mode_reason = Some("panic cleared, pending operator review".to_string());
        state.system_mode = SystemMode::SafeMode;
        warn!("Panic cleared — safe mode remains until operator review");
        metrics::set_panic_mode(false);
        metrics::set_safe_mode(true);
        self.persist(&state);
    }

    pub fn record_reconcile(&self, mismatch: Option<&str>) {
        let mut state = self.state.write();
        let now = self.ctx.time.now();
        state.last_reconcile_at = Some(now);
        if let Some(reason) = mismatch {
            state.last_mismatch_at = Some(now);
            state.last_mismatch_reason = Some(reason.to_string());
        }
        self.persist(&state);
    }

    fn persist(&self, state: &SystemGuardState) {
        if let Err(e) = self.store.save_system_guard(state) {
            // Keep serving the in-memory state; losing the write is logged,
            // not fatal for the guard decision itself.
            error!("Failed to persist system guard state: {}", e);
        }
    }
}
