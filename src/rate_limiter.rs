use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Token-bucket rate limiter bounding outbound broker calls.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    fill_rate_per_sec: f64,
    inner: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: usize, fill_rate_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            fill_rate_per_sec,
            inner: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Returns the time until the next token
    /// when the bucket is empty.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.inner.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.fill_rate_per_sec).min(self.capacity);
        state.last_update = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.fill_rate_per_sec))
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => sleep(wait).await,
            }
        }
    }
}
