//! Bounded-concurrency admission queue.
//!
//! Executions are admitted strictly FIFO: `run` waits for a free slot,
//! holds it for the duration of the wrapped future, and releases it on
//! completion or cancellation. At most `max_concurrency` executions run
//! at once; every queued execution is eventually dispatched as slots
//! free up.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    max_concurrency: usize,
}

/// Decrements the running counter even if the execution is cancelled.
struct RunningGuard {
    running: Arc<AtomicUsize>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutionQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            running: Arc::new(AtomicUsize::new(0)),
            max_concurrency,
        }
    }

    /// Wait for a free slot, then drive the future to completion while
    /// holding it. Slot acquisition order is FIFO.
    pub async fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed; a closed error would mean the
        // queue itself was torn down, in which case we run unthrottled
        // rather than losing the execution.
        let permit = self.semaphore.clone().acquire_owned().await.ok();
        self.running.fetch_add(1, Ordering::SeqCst);
        let _guard = RunningGuard {
            running: Arc::clone(&self.running),
            _permit: permit,
        };
        fut.await
    }

    /// Number of executions currently holding a slot.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
