//! Router Error Types

use sy_common::Failure;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Scheduler {name} is shut down")]
    SchedulerShutdown { name: String },

    #[error("Worker pool {name} is shut down")]
    PoolShutdown { name: String },

    #[error("Branch {index} failed: {failure}")]
    BranchFailed { index: usize, failure: Failure },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] Failure),
}

impl RouterError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// The underlying delivery failure, if this error carries one
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::BranchFailed { failure, .. } | Self::Delivery(failure) => Some(failure),
            _ => None,
        }
    }
}
