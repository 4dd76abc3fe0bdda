use crate::broker::adapter::{
    BrokerAck, BrokerError, BrokerOrder, BrokerOrderRequest, BrokerPort, BrokerPosition,
};
use crate::broker::circuit::CallCircuit;
use crate::config::BrokerConfig;
use crate::context::TimeProvider;
use crate::metrics;
use crate::rate_limiter::TokenBucket;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Decorates a broker backend with the call-safety envelope: request
/// timeout, token-bucket rate limit, failure-rate circuit breaker, and
/// bounded retries with jittered exponential backoff.
///
/// Only transient classes are retried (timeout, network, 5xx, rate-limit);
/// rejections surface immediately and an open circuit fails fast with
/// `CircuitOpen` instead of hammering a known-bad dependency. When retries
/// are exhausted the caller maps the ambiguity to an UNKNOWN order outcome —
/// never an assumed fill or cancel.
pub struct ResilientBroker {
    inner: Arc<dyn BrokerPort>,
    limiter: TokenBucket,
    circuit: CallCircuit,
    request_timeout: Duration,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
}

impl ResilientBroker {
    pub fn new(
        inner: Arc<dyn BrokerPort>,
        config: &BrokerConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            inner,
            limiter: TokenBucket::new(config.rate_limit_burst, config.rate_limit_per_sec),
            circuit: CallCircuit::new(
                config.breaker_window_secs,
                config.breaker_cooldown_secs,
                config.breaker_failure_rate,
                config.breaker_min_samples,
                time,
            ),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.retry_base_delay.as_millis() as u64 * (1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }

    async fn guarded<T, Fut>(
        &self,
        op: &str,
        call: impl Fn() -> Fut,
    ) -> Result<T, BrokerError>
    where
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.circuit.check()?;
            self.limiter.acquire().await;

            let start = Instant::now();
            let result = match timeout(self.request_timeout, call()).await {
                Ok(r) => r,
                Err(_) => Err(BrokerError::Timeout),
            };
            metrics::observe_broker_latency(start.elapsed().as_secs_f64());

            match result {
                Ok(value) => {
                    self.circuit.record(true);
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    // A rejection is the broker working correctly; only
                    // transient classes count against the circuit.
                    self.circuit.record(!retryable);
                    if !retryable || attempt + 1 >= self.retry_max_attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    metrics::inc_broker_retries();
                    let delay = self.backoff_delay(attempt - 1);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker call failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerPort for ResilientBroker {
    async fn open_orders(&self, user_id: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.guarded("open_orders", || self.inner.open_orders(user_id))
            .await
    }

    async fn open_positions(&self, user_id: &str) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.guarded("open_positions", || self.inner.open_positions(user_id))
            .await
    }

    async fn place_order(
        &self,
        user_id: &str,
        request: BrokerOrderRequest,
    ) -> Result<BrokerAck, BrokerError> {
        self.guarded("place_order", || {
            self.inner.place_order(user_id, request.clone())
        })
        .await
    }

    async fn cancel_order(
        &self,
        user_id: &str,
        broker_order_id: &str,
    ) -> Result<(), BrokerError> {
        self.guarded("cancel_order", || {
            self.inner.cancel_order(user_id, broker_order_id)
        })
        .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceContext;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    /// Backend scripted to fail a fixed number of times before succeeding.
    struct FlakyBroker {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
        error: BrokerError,
    }

    impl FlakyBroker {
        fn new(failures: u32, error: BrokerError) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                calls: Mutex::new(0),
                error,
            }
        }
    }

    #[async_trait]
    impl BrokerPort for FlakyBroker {
        async fn open_orders(&self, _user_id: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(self.error.clone());
            }
            Ok(vec![])
        }

        async fn open_positions(
            &self,
            _user_id: &str,
        ) -> Result<Vec<BrokerPosition>, BrokerError> {
            Ok(vec![])
        }

        async fn place_order(
            &self,
            _user_id: &str,
            _request: BrokerOrderRequest,
        ) -> Result<BrokerAck, BrokerError> {
            Ok(BrokerAck {
                broker_order_id: "b-1".to_string(),
                status: "ACKED".to_string(),
                filled_quantity: Decimal::ZERO,
                average_price: None,
            })
        }

        async fn cancel_order(
            &self,
            _user_id: &str,
            _broker_order_id: &str,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            request_timeout_ms: 500,
            rate_limit_per_sec: 1000.0,
            rate_limit_burst: 1000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1,
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_to_success() {
        let flaky = Arc::new(FlakyBroker::new(2, BrokerError::Timeout));
        let ctx = ServiceContext::new_system();
        let broker = ResilientBroker::new(flaky.clone(), &fast_config(), ctx.time.clone());

        assert!(broker.open_orders("u1").await.is_ok());
        assert_eq!(*flaky.calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let flaky = Arc::new(FlakyBroker::new(5, BrokerError::Rejected("bad qty".into())));
        let ctx = ServiceContext::new_system();
        let broker = ResilientBroker::new(flaky.clone(), &fast_config(), ctx.time.clone());

        let err = broker.open_orders("u1").await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
        assert_eq!(*flaky.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let flaky = Arc::new(FlakyBroker::new(10, BrokerError::Timeout));
        let ctx = ServiceContext::new_system();
        let broker = ResilientBroker::new(flaky.clone(), &fast_config(), ctx.time.clone());

        let err = broker.open_orders("u1").await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout));
        assert_eq!(*flaky.calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_fails_fast() {
        let flaky = Arc::new(FlakyBroker::new(100, BrokerError::Timeout));
        let ctx = ServiceContext::new_system();
        let mut config = fast_config();
        config.breaker_min_samples = 3;
        config.breaker_failure_rate = 0.5;
        let broker = ResilientBroker::new(flaky.clone(), &config, ctx.time.clone());

        // First call burns through retries and trips the breaker
        let _ = broker.open_orders("u1").await;
        let err = broker.open_orders("u1").await.unwrap_err();
        assert!(matches!(err, BrokerError::CircuitOpen));
        // No extra backend call happened while open
        assert_eq!(*flaky.calls.lock(), 3);
    }
}
