use crate::broker::adapter::BrokerError;
use crate::context::TimeProvider;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

/// Failure-rate circuit breaker over broker calls.
///
/// Counts outcomes over a sliding time window; once the failure rate crosses
/// the threshold (with enough samples) the circuit opens and calls
/// short-circuit with `BrokerError::CircuitOpen` until the cooldown passes.
/// After the cooldown the window restarts clean (half-open probe).
pub struct CallCircuit {
    window_ms: i64,
    cooldown_ms: i64,
    failure_rate: f64,
    min_samples: usize,
    time: Arc<dyn TimeProvider>,
    inner: Mutex<CircuitInner>,
}

struct CircuitInner {
    samples: VecDeque<(i64, bool)>,
    open_until: Option<i64>,
}

impl CallCircuit {
    pub fn new(
        window_secs: u64,
        cooldown_secs: u64,
        failure_rate: f64,
        min_samples: usize,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            window_ms: (window_secs * 1000) as i64,
            cooldown_ms: (cooldown_secs * 1000) as i64,
            failure_rate,
            min_samples,
            time,
            inner: Mutex::new(CircuitInner {
                samples: VecDeque::new(),
                open_until: None,
            }),
        }
    }

    /// Gate a call. Errors with `CircuitOpen` while the cooldown is running.
    pub fn check(&self) -> Result<(), BrokerError> {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock();
        if let Some(until) = inner.open_until {
            if now < until {
                return Err(BrokerError::CircuitOpen);
            }
            // Cooldown expired: half-open, allow a probe on a clean window
            inner.open_until = None;
            inner.samples.clear();
            metrics::set_broker_circuit_open(false);
            info!("Broker circuit half-open, probing");
        }
        Ok(())
    }

    pub fn record(&self, success: bool) {
        let now = self.time.now_millis();
        let mut inner = self.inner.lock();
        inner.samples.push_back((now, success));
        let cutoff = now - self.window_ms;
        while matches!(inner.samples.front(), Some((ts, _)) if *ts < cutoff) {
            inner.samples.pop_front();
        }

        if inner.samples.len() < self.min_samples || inner.open_until.is_some() {
            return;
        }
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
        let rate = failures as f64 / inner.samples.len() as f64;
        if rate >= self.failure_rate {
            inner.open_until = Some(now + self.cooldown_ms);
            inner.samples.clear();
            metrics::set_broker_circuit_open(true);
            warn!(
                failure_rate = rate,
                cooldown_ms = self.cooldown_ms,
                "🚨 Broker circuit OPEN"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        let now = self.time.now_millis();
        matches!(self.inner.lock().open_until, Some(until) if now < until)
    }
}
