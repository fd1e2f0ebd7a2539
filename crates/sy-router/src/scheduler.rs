//! Scheduler - fixed-delay background tasks
//!
//! Stands in for a scheduled executor: timers live on the tokio runtime the scheduler was
//! created on, and each run executes on that runtime's blocking pool so slow work never
//! stalls a runtime worker. Tasks stop when either the task handle is cancelled or the
//! scheduler shuts down. A run in progress finishes before the task stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Result, RouterError};

pub struct Scheduler {
    name: String,
    handle: Handle,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            handle,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a scheduler bound to the runtime of the calling context
    pub fn current(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let handle = Handle::try_current().map_err(|e| {
            RouterError::configuration(format!("Scheduler {} requires a tokio runtime: {}", name, e))
        })?;
        Ok(Self::new(name, handle))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run `task` after `initial_delay`, then again `delay` after each run completes
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> Result<ScheduledTask>
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(RouterError::SchedulerShutdown { name: self.name.clone() });
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let name = self.name.clone();
        let task = Arc::new(Mutex::new(task));

        let join = self.handle.spawn(async move {
            let mut wait = initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let task = task.clone();
                        let run = tokio::task::spawn_blocking(move || {
                            let mut task = task.lock();
                            (*task)()
                        });
                        if let Err(e) = run.await {
                            warn!(scheduler = %name, error = %e, "Scheduled task run failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(scheduler = %name, "Scheduled task stopping on scheduler shutdown");
                        break;
                    }
                }
                wait = delay;
            }
        });

        Ok(ScheduledTask { join })
    }

    /// Stop all scheduled tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(scheduler = %self.name, "Shutting down scheduler");
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a scheduled task. Cancels the task when dropped.
pub struct ScheduledTask {
    join: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.join.abort();
    }
}
