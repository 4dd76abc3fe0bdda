use crate::config::DispatchConfig;
use crate::metrics;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dispatcher saturated: {queued} queued at cap {cap}")]
    Saturated { queued: usize, cap: usize },
}

/// Bounded worker pool for per-request evaluation and placement work.
/// `workers` tasks run at once; at most `queue_depth` more may wait.
/// Exhaustion rejects new work instead of growing an unbounded backlog.
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    workers: usize,
    queue_depth: usize,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            queued: Arc::new(AtomicUsize::new(0)),
            workers: config.workers.max(1),
            queue_depth: config.queue_depth,
        }
    }

    /// Submit work. The future starts once a worker slot frees up; the call
    /// fails fast when both the pool and the queue are full.
    pub fn submit<F, T>(&self, work: F) -> Result<JoinHandle<T>, DispatchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let capacity = self.workers + self.queue_depth;
        let queued = self.queued.fetch_add(1, Ordering::SeqCst);
        if queued >= capacity {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            metrics::inc_dispatch_rejected();
            warn!(queued, cap = capacity, "Dispatcher saturated — rejecting work");
            return Err(DispatchError::Saturated {
                queued,
                cap: capacity,
            });
        }

        let permits = self.permits.clone();
        let counter = self.queued.clone();
        Ok(tokio::spawn(async move {
            // Acquire never fails: the semaphore is never closed
            let _permit = permits.acquire_owned().await.expect("semaphore closed");
            let result = work.await;
            counter.fetch_sub(1, Ordering::SeqCst);
            result
        }))
    }

    pub fn in_flight(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_runs_submitted_work() {
        let dispatcher = Dispatcher::new(&DispatchConfig {
            workers: 2,
            queue_depth: 2,
        });
        let handle = dispatcher.submit(async { 41 + 1 }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_saturation_rejects_instead_of_queueing() {
        let dispatcher = Dispatcher::new(&DispatchConfig {
            workers: 1,
            queue_depth: 1,
        });

        // Block the single worker
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocked = dispatcher
            .submit(async move {
                let _ = release_rx.await;
            })
            .unwrap();
        // Fill the one queue slot
        let queued = dispatcher.submit(async {}).unwrap();

        // Third submission must be rejected
        let err = dispatcher.submit(async {}).unwrap_err();
        assert!(matches!(err, DispatchError::Saturated { .. }));

        release_tx.send(()).unwrap();
        blocked.await.unwrap();
        queued.await.unwrap();
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let dispatcher = Dispatcher::new(&DispatchConfig {
            workers: 2,
            queue_depth: 16,
        });
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let live = live.clone();
            let peak = peak.clone();
            handles.push(
                dispatcher
                    .submit(async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
