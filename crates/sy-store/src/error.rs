//! Store Error Types

use thiserror::Error;

use crate::page_file::PageId;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A concurrent transaction committed a write to the same page first
    #[error("Optimistic update conflict on page {page}")]
    OptimisticUpdate { page: PageId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt page file: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store is not started")]
    NotStarted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure raised by a unit of work
    #[error("Unit of work failed: {0}")]
    Work(#[from] anyhow::Error),
}

impl StoreError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    /// Conflicts are retried by the store; everything else is fatal to the unit of work
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::OptimisticUpdate { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
