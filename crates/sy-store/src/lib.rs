//! Switchyard Transactional Store
//!
//! Page-oriented durable key/value storage with optimistic transactions:
//! - TxPageFile: fixed-size pages in a single file, committed state cached in memory
//! - Transaction: buffered reads/writes validated against concurrent commits
//! - SortedIndex: named byte-ordered maps located through a root index
//! - TransactionalStore: lifecycle plus the retrying unit-of-work loop
//! - AggregationRepository: durable message repository built on named indexes

pub mod error;
pub mod page_file;
pub mod transaction;
pub mod index;
pub mod store;
pub mod repository;

pub use error::{Result, StoreError};
pub use page_file::{PageId, TxPageFile, ROOT_PAGE};
pub use transaction::Transaction;
pub use index::SortedIndex;
pub use store::TransactionalStore;
pub use repository::AggregationRepository;
