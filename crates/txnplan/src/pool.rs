//! Bounded worker pool for step tasks
//!
//! Shared by every tracker of an executor. Dispatch never fails: a task is
//! spawned immediately and waits, in FIFO order, for one of
//! `max_concurrent` permits before its body runs. Aborting the returned
//! handle cancels the task whether it is waiting or running; awaiting it
//! afterwards returns once the task has actually stopped.

use crate::config::ExecutorConfig;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Permit count
    pub max_concurrent: usize,
    /// Tasks holding a permit
    pub active: usize,
    /// Tasks waiting for a permit
    pub waiting: usize,
    /// Tasks spawned since creation
    pub total_spawned: usize,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    waiting: AtomicUsize,
    total_spawned: AtomicUsize,
}

/// Decrements a counter when dropped, including on abort
struct CounterGuard<'a>(&'a AtomicUsize);

impl<'a> CounterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded pool of step tasks
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Pool with `max_concurrent` permits (at least one)
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Pool sized from a validated config
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.max_concurrent_steps)
    }

    /// Spawn `task` once a permit is free
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        counters.total_spawned.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let permit = {
                let _waiting = CounterGuard::enter(&counters.waiting);
                permits.acquire_owned().await
            };
            // The semaphore is never closed
            let Ok(_permit) = permit else {
                return;
            };
            let _active = CounterGuard::enter(&counters.active);
            task.await;
        })
    }

    /// Current statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_concurrent: self.max_concurrent,
            active: self.counters.active.load(Ordering::Relaxed),
            waiting: self.counters.waiting.load(Ordering::Relaxed),
            total_spawned: self.counters.total_spawned.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}
