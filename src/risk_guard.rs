use crate::config::RiskConfig;
use crate::context::ServiceContext;
use crate::metrics;
use crate::model::{GuardDecision, TradingGuardState};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use crate::persistence::wal::WalEntry;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

const CAS_RETRY_LIMIT: u32 = 16;

/// Per-user trading circuit breaker: daily-loss and loss-streak gate with
/// cooldown. State is keyed by user, reset on exchange-local day rollover,
/// and written with compare-and-swap so two concurrent trade closes cannot
/// lose an update.
pub struct TradingGuard {
    config: RiskConfig,
    tz: Tz,
    store: Arc<PersistenceStore>,
    ctx: Arc<ServiceContext>,
}

impl TradingGuard {
    pub fn new(config: RiskConfig, store: Arc<PersistenceStore>, ctx: Arc<ServiceContext>) -> Self {
        let tz: Tz = config
            .exchange_timezone
            .parse()
            .unwrap_or(chrono_tz::America::New_York);
        Self {
            config,
            tz,
            store,
            ctx,
        }
    }

    /// Load the user's state for the trading day containing `now`, resetting
    /// stale state from a previous day.
    fn day_state(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TradingGuardState, StoreError> {
        let today = ServiceContext::trading_day(now, &self.tz);
        match self.store.load_user_guard(user_id)? {
            Some(state) if state.trading_day == today => Ok(state),
            Some(stale) => {
                info!(
                    user_id,
                    old_day = %stale.trading_day,
                    new_day = %today,
                    "Trading day rolled over, guard state reset"
                );
                let mut fresh = TradingGuardState::fresh(user_id, today);
                fresh.version = stale.version;
                Ok(fresh)
            }
            None => Ok(TradingGuardState::fresh(user_id, today)),
        }
    }

    fn daily_loss_threshold(&self, equity: Decimal) -> Decimal {
        equity * self.config.max_daily_loss_pct
    }

    fn emit_risk_event(&self, user_id: &str, kind: &str, detail: String) {
        metrics::inc_guard_trips();
        warn!(user_id, kind, "{}", detail);
        let _ = self.store.wal().append(&WalEntry::RiskEvent {
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            detail,
        });
    }

    /// The gate the pipeline and placement path consult before acting.
    pub fn can_trade(&self, user_id: &str, now: DateTime<Utc>) -> Result<GuardDecision, StoreError> {
        if !self.config.circuit_breaker_enabled {
            return Ok(GuardDecision::allow());
        }

        let state = self.day_state(user_id, now)?;

        if let Some(until) = state.cooldown_until {
            if until > now {
                return Ok(GuardDecision::deny(
                    format!(
                        "cooldown active after {} consecutive losses",
                        state.consecutive_losses
                    ),
                    Some(until),
                ));
            }
        }

        let equity = self
            .store
            .load_user(user_id)?
            .map(|u| u.equity)
            .unwrap_or(Decimal::ZERO);
        let threshold = self.daily_loss_threshold(equity);
        if equity > Decimal::ZERO && state.day_pnl <= -threshold {
            let until = ServiceContext::next_trading_day_start(now, &self.tz);
            self.emit_risk_event(
                user_id,
                "DAILY_LOSS_LIMIT",
                format!(
                    "day PnL {} breached limit -{} — trading halted until next session",
                    state.day_pnl, threshold
                ),
            );
            return Ok(GuardDecision::deny(
                format!("daily loss limit breached ({})", state.day_pnl),
                Some(until),
            ));
        }

        // A served cooldown reopens the gate even though the streak only
        // resets on a win or day rollover.
        if state.consecutive_losses >= self.config.max_consecutive_losses
            && state.cooldown_until.is_none()
        {
            self.emit_risk_event(
                user_id,
                "LOSS_STREAK",
                format!("{} consecutive losses", state.consecutive_losses),
            );
            return Ok(GuardDecision::deny(
                format!("{} consecutive losses", state.consecutive_losses),
                Some(now),
            ));
        }

        Ok(GuardDecision::allow())
    }

    /// Fold a realized close into the user's day state. A loss extends the
    /// streak, a win resets it, a flat trade changes neither; crossing the
    /// streak threshold starts the cooldown clock at `closed_at`.
    pub fn on_trade_closed(
        &self,
        user_id: &str,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<TradingGuardState, StoreError> {
        let mut attempts = 0;
        loop {
            let mut state = self.day_state(user_id, closed_at)?;
            let expected_version = state.version;

            state.day_pnl += realized_pnl;
            if realized_pnl < Decimal::ZERO {
                state.consecutive_losses += 1;
                state.last_loss_at = Some(closed_at);
                // Arm (or re-arm after a served cooldown) on crossing the
                // threshold; an active cooldown is left untouched.
                let cooldown_open = state.cooldown_until.is_none_or(|u| u <= closed_at);
                if state.consecutive_losses >= self.config.max_consecutive_losses && cooldown_open
                {
                    let until = closed_at + Duration::minutes(self.config.cooldown_minutes);
                    state.cooldown_until = Some(until);
                    self.emit_risk_event(
                        user_id,
                        "COOLDOWN_STARTED",
                        format!(
                            "loss streak hit {} — cooldown until {}",
                            state.consecutive_losses, until
                        ),
                    );
                }
            } else if realized_pnl > Decimal::ZERO {
                state.consecutive_losses = 0;
            }

            match self.store.save_user_guard_cas(&state, expected_version) {
                Ok(saved) => return Ok(saved),
                Err(StoreError::VersionConflict(_, _)) if attempts < CAS_RETRY_LIMIT => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserRecord;
    use crate::persistence::redb_store::RedbStore;
    use crate::persistence::wal::WalManager;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn create_guard(config: RiskConfig) -> (TradingGuard, Arc<PersistenceStore>, String) {
        let path = format!("/tmp/test_tguard_{}.redb", uuid::Uuid::new_v4());
        let redb = Arc::new(RedbStore::new(&path).expect("create RedbStore"));
        let wal = Arc::new(WalManager::new(redb.clone()));
        let store = Arc::new(PersistenceStore::new(redb, wal).expect("init store"));
        let ctx = Arc::new(ServiceContext::new_system());
        let guard = TradingGuard::new(config, store.clone(), ctx);
        (guard, store, path)
    }

    fn fund_user(store: &PersistenceStore, user_id: &str, equity: Decimal) {
        store
            .save_user(&UserRecord {
                user_id: user_id.to_string(),
                autotrade_enabled: true,
                is_paper: true,
                equity,
            })
            .unwrap();
    }

    // Mid-session timestamp: 15:00 UTC == 10:00 New York
    fn session_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_disabled_breaker_always_allows() {
        let config = RiskConfig {
            circuit_breaker_enabled: false,
            ..RiskConfig::default()
        };
        let (guard, _store, path) = create_guard(config);
        assert!(guard.can_trade("u1", session_time()).unwrap().allowed);
        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_daily_loss_limit_denies_until_next_session() {
        let (guard, store, path) = create_guard(RiskConfig::default());
        fund_user(&store, "u1", dec!(100000));
        let now = session_time();

        // Loss sequence summing to -2001 against a 2% of 100k (= 2000) limit
        guard.on_trade_closed("u1", dec!(-1200), now).unwrap();
        guard
            .on_trade_closed("u1", dec!(-801), now + Duration::minutes(1))
            .unwrap();

        let decision = guard.can_trade("u1", now + Duration::minutes(2)).unwrap();
        assert!(!decision.allowed);
        let until = decision.until.unwrap();
        // Next New York midnight after the session
        assert_eq!(
            until,
            Utc.with_ymd_and_hms(2024, 3, 6, 5, 0, 0).unwrap()
        );

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_day_rollover_resets_state() {
        let (guard, store, path) = create_guard(RiskConfig::default());
        fund_user(&store, "u1", dec!(100000));
        let now = session_time();

        guard.on_trade_closed("u1", dec!(-2500), now).unwrap();
        assert!(!guard.can_trade("u1", now).unwrap().allowed);

        // The following trading day (New York) the gate reopens
        let next_day = Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap();
        assert!(guard.can_trade("u1", next_day).unwrap().allowed);

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_three_losses_trigger_exact_cooldown() {
        let config = RiskConfig {
            max_consecutive_losses: 3,
            cooldown_minutes: 45,
            ..RiskConfig::default()
        };
        let (guard, store, path) = create_guard(config);
        fund_user(&store, "u1", dec!(1000000));
        let now = session_time();

        guard.on_trade_closed("u1", dec!(-10), now).unwrap();
        guard
            .on_trade_closed("u1", dec!(-10), now + Duration::minutes(1))
            .unwrap();
        let third_close = now + Duration::minutes(2);
        let state = guard.on_trade_closed("u1", dec!(-10), third_close).unwrap();

        assert_eq!(state.consecutive_losses, 3);
        assert_eq!(
            state.cooldown_until,
            Some(third_close + Duration::minutes(45))
        );

        let decision = guard.can_trade("u1", third_close + Duration::minutes(10)).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.until, Some(third_close + Duration::minutes(45)));

        // Cooldown fully served: the gate reopens the same day
        let decision = guard.can_trade("u1", third_close + Duration::minutes(46)).unwrap();
        assert!(decision.allowed);

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_win_resets_streak_flat_changes_nothing() {
        let (guard, store, path) = create_guard(RiskConfig::default());
        fund_user(&store, "u1", dec!(1000000));
        let now = session_time();

        guard.on_trade_closed("u1", dec!(-10), now).unwrap();
        guard.on_trade_closed("u1", dec!(-10), now).unwrap();
        let state = guard.on_trade_closed("u1", dec!(0), now).unwrap();
        assert_eq!(state.consecutive_losses, 2, "flat close keeps the streak");

        let state = guard.on_trade_closed("u1", dec!(50), now).unwrap();
        assert_eq!(state.consecutive_losses, 0, "win resets the streak");
        assert_eq!(state.day_pnl, dec!(30));

        std::fs::remove_file(path).unwrap_or(());
    }

    #[test]
    fn test_concurrent_closes_do_not_lose_updates() {
        let (guard, store, path) = create_guard(RiskConfig::default());
        fund_user(&store, "u1", dec!(1000000));
        let guard = Arc::new(guard);
        let now = session_time();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || {
                    guard.on_trade_closed("u1", dec!(-5), now).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let state = store.load_user_guard("u1").unwrap().unwrap();
        assert_eq!(state.day_pnl, dec!(-40));
        assert_eq!(state.consecutive_losses, 8);

        std::fs::remove_file(path).unwrap_or(());
    }
}
