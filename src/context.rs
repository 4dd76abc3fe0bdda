use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Trait for providing the current time.
/// Decouples guard logic from `Utc::now()` so cooldowns and day rollover are
/// deterministic under test.
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Trait for generating unique IDs.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Context holding the providers, passed down to services and guards.
#[derive(Clone)]
pub struct ServiceContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
}

impl ServiceContext {
    pub fn new_system() -> Self {
        Self {
            time: Arc::new(SystemTimeProvider),
            id: Arc::new(RandomIdProvider),
        }
    }

    pub fn new_simulated(start: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(SimulatedTimeProvider::new(start)),
            id: Arc::new(SequentialIdProvider::new()),
        }
    }

    /// The trading day containing `at`, computed in the exchange's local
    /// timezone rather than UTC midnight.
    pub fn trading_day(at: DateTime<Utc>, tz: &Tz) -> NaiveDate {
        at.with_timezone(tz).date_naive()
    }

    /// First instant (UTC) of the trading day after the one containing `at`.
    pub fn next_trading_day_start(at: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
        let next_day = Self::trading_day(at, tz).succ_opt().unwrap_or_else(|| {
            // NaiveDate::MAX overflow is unreachable for real clocks
            Self::trading_day(at, tz)
        });
        let local_midnight = next_day.and_hms_opt(0, 0, 0).unwrap();
        match tz.from_local_datetime(&local_midnight) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
                dt.with_timezone(&Utc)
            }
            // Midnight skipped by a DST jump; fall back to the UTC reading
            chrono::LocalResult::None => Utc.from_utc_datetime(&local_midnight),
        }
    }
}

// --- Live implementations ---

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

// --- Simulated implementations ---

pub struct SimulatedTimeProvider {
    current_millis: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.current_millis
            .store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.current_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.current_millis.load(Ordering::SeqCst))
            .unwrap()
    }
}

pub struct SequentialIdProvider {
    counter: Mutex<u64>,
}

impl SequentialIdProvider {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
        }
    }
}

impl Default for SequentialIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for SequentialIdProvider {
    fn new_id(&self) -> String {
        let mut num = self.counter.lock().unwrap();
        *num += 1;
        format!("00000000-0000-0000-0000-{:012x}", *num)
    }
}
