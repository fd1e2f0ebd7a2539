//! Switchyard Routing Core
//!
//! This crate provides the concurrency and resilience primitives of the router:
//! - Scheduler: fixed-delay background tasks with an explicit shutdown
//! - TimeoutMap: concurrent map with sliding expiry and vetoable eviction
//! - RedeliveryPolicy / DeadLetterChannel: bounded retry with a terminal failure destination
//! - WorkerPool: semaphore-bounded (or elastic) pool for multicast branches
//! - MulticastDispatcher: fan-out with aggregation, timeouts and stop-on-exception

pub mod error;
pub mod scheduler;
pub mod timeout_map;
pub mod destination;
pub mod redelivery;
pub mod pool;
pub mod aggregation;
pub mod multicast;

pub use error::RouterError;
pub use scheduler::{Scheduler, ScheduledTask};
pub use timeout_map::{TimeoutMap, EvictionListener, EvictAll};
pub use destination::{Destination, FailureDestination};
pub use redelivery::{RedeliveryPolicy, RedeliveryState, DeadLetterChannel};
pub use pool::{WorkerPool, WorkerPoolStats};
pub use aggregation::{AggregationStrategy, UseLatestAggregationStrategy};
pub use multicast::{MulticastDispatcher, MulticastBuilder, MulticastOutcome, BranchFailure};

pub type Result<T> = std::result::Result<T, RouterError>;
