//! MulticastDispatcher - fans one message out to an ordered list of destinations
//!
//! - Sequential: destinations run one at a time in list order on the calling task
//! - Parallel: every branch runs on the worker pool with its own message copy
//! - Streaming folds results as they arrive; otherwise results fold in list order
//! - An overall timeout cancels unfinished branches and excludes them from the result
//! - stop_on_exception cancels outstanding branches and propagates the first failure
//!
//! Branches never touch the accumulator. All folding happens on the coordinating task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sy_common::{headers, Failure, Message};
use sy_config::MulticastSettings;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::aggregation::{AggregationStrategy, UseLatestAggregationStrategy};
use crate::destination::{into_outcome, Destination};
use crate::pool::WorkerPool;
use crate::{Result, RouterError};

/// A branch that failed without stopping the multicast
#[derive(Debug, Clone, PartialEq)]
pub struct BranchFailure {
    pub index: usize,
    pub destination: String,
    pub failure: Failure,
}

/// Result of a multicast: the aggregated message plus per-branch accounting
#[derive(Debug, Clone)]
pub struct MulticastOutcome {
    /// Aggregated result, or the inbound message when nothing was folded
    pub message: Message,
    /// Indexes of branches folded into `message`, in folding order
    pub completed: Vec<usize>,
    pub failures: Vec<BranchFailure>,
    /// Branches still running when the timeout fired
    pub cancelled: Vec<usize>,
    pub timed_out: bool,
}

impl MulticastOutcome {
    fn new(message: Message) -> Self {
        Self {
            message,
            completed: Vec::new(),
            failures: Vec::new(),
            cancelled: Vec::new(),
            timed_out: false,
        }
    }
}

pub struct MulticastDispatcher {
    name: String,
    destinations: Vec<Arc<dyn Destination>>,
    strategy: Arc<dyn AggregationStrategy>,
    parallel: bool,
    streaming: bool,
    stop_on_exception: bool,
    timeout: Option<Duration>,

    pool: Arc<WorkerPool>,
    /// Whether the pool was created by this dispatcher and must be shut down with it
    owns_pool: bool,

    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,
}

impl MulticastDispatcher {
    pub fn builder(name: impl Into<String>) -> MulticastBuilder {
        MulticastBuilder::new(name)
    }

    /// Builder preloaded from the `[multicast]` configuration section
    pub fn from_settings(name: impl Into<String>, settings: &MulticastSettings) -> MulticastBuilder {
        MulticastBuilder::new(name).settings(settings)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_stop_on_exception(&self) -> bool {
        self.stop_on_exception
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Dispatch `message` to every destination and aggregate the results
    pub async fn process(&self, message: Message) -> Result<MulticastOutcome> {
        if self.is_shutdown() {
            return Err(RouterError::PoolShutdown { name: self.pool.name().to_string() });
        }

        metrics::counter!("switchyard_multicast_branches_total").increment(self.destinations.len() as u64);
        trace!(
            multicast = %self.name,
            message_id = %message.id,
            branches = self.destinations.len(),
            parallel = self.parallel,
            "Dispatching multicast"
        );

        if self.parallel {
            self.process_parallel(message).await
        } else {
            self.process_sequential(message).await
        }
    }

    async fn process_sequential(&self, message: Message) -> Result<MulticastOutcome> {
        let mut accumulated: Option<Message> = None;
        let mut outcome = MulticastOutcome::new(message);

        for (index, destination) in self.destinations.iter().enumerate() {
            let branch = branch_copy(&outcome.message, index);
            let result = self.pool.clone().run(destination.invoke(branch)).await;

            match into_outcome(result, destination.name()) {
                Ok(reply) => {
                    accumulated = Some(self.strategy.aggregate(accumulated.take(), reply));
                    outcome.completed.push(index);
                }
                Err(failure) => {
                    if self.stop_on_exception {
                        debug!(multicast = %self.name, index, error = %failure, "Stopping multicast on branch failure");
                        return Err(RouterError::BranchFailed { index, failure });
                    }
                    self.record_failure(&mut outcome, index, failure);
                }
            }
        }

        if let Some(message) = accumulated {
            outcome.message = message;
        }
        Ok(outcome)
    }

    async fn process_parallel(&self, message: Message) -> Result<MulticastOutcome> {
        let count = self.destinations.len();
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut tasks = JoinSet::new();
        for (index, destination) in self.destinations.iter().enumerate() {
            let branch = branch_copy(&message, index);
            let destination = destination.clone();
            let pool = self.pool.clone();
            tasks.spawn(async move {
                let result = pool.run(destination.invoke(branch)).await;
                (index, into_outcome(result, destination.name()))
            });
        }

        let mut accumulated: Option<Message> = None;
        let mut slots: Vec<Option<Message>> = (0..count).map(|_| None).collect();
        let mut finished = vec![false; count];
        let mut outcome = MulticastOutcome::new(message);

        loop {
            let joined = tokio::select! {
                biased;
                joined = tasks.join_next() => joined,
                _ = wait_until(deadline) => {
                    outcome.timed_out = true;
                    break;
                }
                _ = shutdown_rx.recv() => {
                    tasks.abort_all();
                    info!(multicast = %self.name, "Multicast interrupted by shutdown");
                    return Err(RouterError::PoolShutdown { name: self.pool.name().to_string() });
                }
            };

            let (index, result) = match joined {
                None => break,
                Some(Ok(branch)) => branch,
                Some(Err(e)) => {
                    warn!(multicast = %self.name, error = %e, "Branch task did not complete");
                    continue;
                }
            };
            // A branch that was ready only after the deadline is late, even if polled first
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!(multicast = %self.name, index, "Discarding branch result that arrived after the timeout");
                outcome.timed_out = true;
                break;
            }
            finished[index] = true;

            match result {
                Ok(reply) => {
                    outcome.completed.push(index);
                    if self.streaming {
                        accumulated = Some(self.strategy.aggregate(accumulated.take(), reply));
                    } else {
                        slots[index] = Some(reply);
                    }
                }
                Err(failure) => {
                    if self.stop_on_exception {
                        tasks.abort_all();
                        debug!(multicast = %self.name, index, error = %failure, "Stopping multicast on branch failure");
                        return Err(RouterError::BranchFailed { index, failure });
                    }
                    self.record_failure(&mut outcome, index, failure);
                }
            }
        }

        // Results of cancelled branches are never folded, even if they finish later
        tasks.abort_all();
        outcome.cancelled = (0..count).filter(|index| !finished[*index]).collect();

        if outcome.timed_out {
            metrics::counter!("switchyard_multicast_timeouts_total").increment(1);
            warn!(
                multicast = %self.name,
                timeout_ms = self.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                cancelled = ?outcome.cancelled,
                "Multicast timed out, unfinished branches cancelled"
            );
        }

        if !self.streaming {
            outcome.completed.sort_unstable();
            for reply in slots.into_iter().flatten() {
                accumulated = Some(self.strategy.aggregate(accumulated.take(), reply));
            }
        }

        if let Some(message) = accumulated {
            outcome.message = message;
        }
        Ok(outcome)
    }

    fn record_failure(&self, outcome: &mut MulticastOutcome, index: usize, failure: Failure) {
        let destination = self.destinations[index].name().to_string();
        debug!(multicast = %self.name, index, destination = %destination, error = %failure, "Branch failed, excluded from aggregation");
        outcome.failures.push(BranchFailure { index, destination, failure });
    }

    /// Cancel in-flight multicasts and close an owned pool. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(multicast = %self.name, owns_pool = self.owns_pool, "Shutting down multicast dispatcher");
        let _ = self.shutdown_tx.send(());
        if self.owns_pool {
            self.pool.shutdown();
        }
    }
}

impl Drop for MulticastDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn branch_copy(message: &Message, index: usize) -> Message {
    message.copy_for_branch().with_header(headers::MULTICAST_INDEX, index as u64)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct MulticastBuilder {
    name: String,
    destinations: Vec<Arc<dyn Destination>>,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    parallel: bool,
    streaming: bool,
    stop_on_exception: bool,
    timeout: Option<Duration>,
    pool: Option<Arc<WorkerPool>>,
    pool_size: Option<usize>,
}

impl MulticastBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destinations: Vec::new(),
            strategy: None,
            parallel: false,
            streaming: false,
            stop_on_exception: false,
            timeout: None,
            pool: None,
            pool_size: None,
        }
    }

    pub fn settings(mut self, settings: &MulticastSettings) -> Self {
        self.parallel = settings.parallel;
        self.streaming = settings.streaming;
        self.stop_on_exception = settings.stop_on_exception;
        self.timeout = settings.timeout_ms.map(Duration::from_millis);
        self.pool_size = settings.pool_size;
        self
    }

    pub fn destination(mut self, destination: impl Destination + 'static) -> Self {
        self.destinations.push(Arc::new(destination));
        self
    }

    pub fn destination_arc(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn aggregation_strategy(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn stop_on_exception(mut self, stop_on_exception: bool) -> Self {
        self.stop_on_exception = stop_on_exception;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run branches on a shared pool. The dispatcher never shuts a shared pool down.
    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Bound the dispatcher's own pool; ignored when a shared pool is supplied
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn build(self) -> Result<MulticastDispatcher> {
        if self.timeout.is_some() && !self.parallel {
            return Err(RouterError::configuration(
                "Timeout is used but parallel processing has not been enabled",
            ));
        }
        if self.destinations.is_empty() {
            return Err(RouterError::configuration(format!(
                "Multicast {} has no destinations",
                self.name
            )));
        }
        if self.pool_size == Some(0) {
            return Err(RouterError::configuration("pool_size must be greater than zero"));
        }

        let (pool, owns_pool) = match self.pool {
            Some(pool) => (pool, false),
            None => {
                let pool_name = format!("{}-pool", self.name);
                let pool = match self.pool_size {
                    Some(size) => WorkerPool::bounded(pool_name, size),
                    None => WorkerPool::elastic(pool_name),
                };
                (Arc::new(pool), true)
            }
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(MulticastDispatcher {
            name: self.name,
            destinations: self.destinations,
            strategy: self
                .strategy
                .unwrap_or_else(|| Arc::new(UseLatestAggregationStrategy)),
            parallel: self.parallel,
            streaming: self.streaming,
            stop_on_exception: self.stop_on_exception,
            timeout: self.timeout,
            pool,
            owns_pool,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        })
    }
}
