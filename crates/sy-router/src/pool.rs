//! WorkerPool - concurrency control for multicast branches
//!
//! - Semaphore-bounded, or elastic (no permit limit) when no size is given
//! - Can be shared between dispatchers; only the owner shuts it down
//! - Branch panics are caught and surfaced as `Aborted` failures

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use sy_common::{DeliveryResult, Failure};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Snapshot of pool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_workers: Option<usize>,
    pub active_workers: u32,
    pub submitted: u64,
    pub running: bool,
}

pub struct WorkerPool {
    name: String,

    /// Concurrency limit; `None` for an elastic pool
    semaphore: Option<Arc<Semaphore>>,
    max_workers: Option<usize>,

    running: AtomicBool,
    active_workers: AtomicU32,
    submitted: AtomicU64,
}

impl WorkerPool {
    /// Pool running at most `max_workers` branches at a time
    pub fn bounded(name: impl Into<String>, max_workers: usize) -> Self {
        Self::create(name.into(), Some(max_workers.max(1)))
    }

    /// Pool that grows with demand
    pub fn elastic(name: impl Into<String>) -> Self {
        Self::create(name.into(), None)
    }

    fn create(name: String, max_workers: Option<usize>) -> Self {
        info!(pool = %name, max_workers = ?max_workers, "Starting worker pool");
        Self {
            name,
            semaphore: max_workers.map(|n| Arc::new(Semaphore::new(n))),
            max_workers,
            running: AtomicBool::new(true),
            active_workers: AtomicU32::new(0),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Run a branch under the pool's concurrency limit.
    ///
    /// Waits for a permit, so a bounded pool queues branches beyond its size.
    pub async fn run<F>(self: Arc<Self>, branch: F) -> DeliveryResult
    where
        F: Future<Output = DeliveryResult> + Send,
    {
        if !self.is_running() {
            return Err(Failure::aborted(format!("worker pool {} is shut down", self.name)));
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);

        let _permit = match &self.semaphore {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(pool = %self.name, "Semaphore closed while waiting for a worker");
                    return Err(Failure::aborted(format!("worker pool {} is shut down", self.name)));
                }
            },
            None => None,
        };

        let _active = ActiveWorker::enter(&self.active_workers);
        let outcome = AssertUnwindSafe(branch).catch_unwind().await;

        outcome.unwrap_or_else(|_| {
            warn!(pool = %self.name, "Branch panicked");
            Err(Failure::aborted("branch panicked"))
        })
    }

    /// Stop accepting work and release waiting branches. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(pool = %self.name, active_workers = self.active_workers(), "Shutting down worker pool");
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            name: self.name.clone(),
            max_workers: self.max_workers,
            active_workers: self.active_workers(),
            submitted: self.submitted.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }
}

/// Decrements the active count even when the branch future is dropped mid-flight
struct ActiveWorker<'a>(&'a AtomicU32);

impl<'a> ActiveWorker<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
