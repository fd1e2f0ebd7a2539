//! TransactionalStore - page file lifecycle and the unit-of-work loop
//!
//! `execute` runs work against a fresh transaction, commits and flushes.
//! Optimistic conflicts roll back and re-run the work from scratch with no retry cap,
//! so work must be safe to repeat. Any other failure rolls back once and is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use sy_config::StoreSettings;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StoreError};
use crate::index::SortedIndex;
use crate::page_file::{TxPageFile, ROOT_PAGE};
use crate::transaction::Transaction;

enum Attempt<T> {
    Committed(T),
    Conflict(StoreError),
    Fatal(StoreError),
}

impl<T> Attempt<T> {
    fn failed(error: StoreError) -> Self {
        if error.is_conflict() {
            Self::Conflict(error)
        } else {
            Self::Fatal(error)
        }
    }
}

pub struct TransactionalStore {
    file: Option<PathBuf>,
    page_size: usize,
    sync: bool,
    page_file: RwLock<Option<Arc<TxPageFile>>>,
}

impl TransactionalStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self::from(&StoreSettings {
            file: Some(file.into()),
            ..StoreSettings::default()
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// fsync on every flush. Off by default.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.page_file.read().is_some()
    }

    /// Open the page file, creating the root index on a fresh file
    pub fn start(&self) -> Result<()> {
        let path = self
            .file
            .as_ref()
            .ok_or_else(|| StoreError::Configuration("A file must be configured".to_string()))?;

        let mut guard = self.page_file.write();
        if guard.is_some() {
            return Ok(());
        }
        debug!(path = %path.display(), "Starting store");

        let page_file = Arc::new(TxPageFile::open(path, self.page_size, self.sync)?);

        if page_file.high_water() == 0 {
            Self::run(&page_file, |tx| {
                let root = SortedIndex::create(tx);
                if root.location() != ROOT_PAGE {
                    return Err(StoreError::corrupt(format!(
                        "root index allocated at page {} on a fresh file",
                        root.location()
                    )));
                }
                Ok(())
            })?;
            info!(path = %path.display(), "Aggregation repository data store created");
        } else {
            page_file.load_record(ROOT_PAGE)?;
            let indexes = {
                let mut tx = page_file.tx();
                SortedIndex::registered(&mut tx)?
            };
            for (_, index) in &indexes {
                page_file.load_record(index.location())?;
            }
            let free = page_file.rebuild_free_pages();
            info!(
                path = %path.display(),
                repositories = indexes.len(),
                free_pages = free,
                "Aggregation repository data store loaded containing {} repositories",
                indexes.len()
            );
        }

        *guard = Some(page_file);
        Ok(())
    }

    /// Flush and close the page file. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let Some(page_file) = self.page_file.write().take() else {
            return Ok(());
        };
        debug!(path = %page_file.path().display(), "Stopping store");
        page_file.flush()
    }

    pub fn page_file(&self) -> Result<Arc<TxPageFile>> {
        self.page_file.read().clone().ok_or(StoreError::NotStarted)
    }

    /// Run `work` in a transaction, then commit and flush
    pub fn execute<T, F>(&self, work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let page_file = self.page_file()?;
        Self::run(&page_file, work)
    }

    /// Handle to the named index, creating it when absent and `create` is set
    pub fn open_or_create(&self, tx: &mut Transaction<'_>, name: &str, create: bool) -> Result<Option<SortedIndex>> {
        let index = SortedIndex::open_or_create(tx, name, create)?;
        trace!(index = %name, location = ?index.map(|i| i.location()), "Resolved index");
        Ok(index)
    }

    /// Names of all indexes in the store
    pub fn indexes(&self) -> Result<Vec<String>> {
        self.execute(|tx| SortedIndex::names(tx))
    }

    fn run<T, F>(page_file: &TxPageFile, mut work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                debug!(attempt, "Attempting unit of work again");
            }

            let mut tx = page_file.tx();
            let outcome = match work(&mut tx) {
                Ok(value) => {
                    trace!(attempt, read_only = tx.is_read_only(), "Executed unit of work");
                    match tx.commit() {
                        Ok(()) => Attempt::Committed(value),
                        Err(e) => Attempt::failed(e),
                    }
                }
                Err(e) => {
                    tx.rollback();
                    Attempt::failed(e)
                }
            };

            match outcome {
                Attempt::Committed(value) => {
                    page_file.flush()?;
                    return Ok(value);
                }
                Attempt::Conflict(e) => {
                    metrics::counter!("switchyard_store_conflicts_total").increment(1);
                    warn!(attempt, error = %e, "Optimistic update conflict executing unit of work, rolled back and retrying");
                }
                Attempt::Fatal(e) => {
                    warn!(attempt, error = %e, "Error executing unit of work, rolled back");
                    return Err(e);
                }
            }
        }
    }
}

impl From<&StoreSettings> for TransactionalStore {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            file: settings.file.clone(),
            page_size: settings.page_size,
            sync: settings.sync,
            page_file: RwLock::new(None),
        }
    }
}

impl Drop for TransactionalStore {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Failed to flush store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn started(dir: &TempDir) -> TransactionalStore {
        let store = TransactionalStore::new(dir.path().join("store.db")).with_page_size(512);
        store.start().unwrap();
        store
    }

    fn read_counter(tx: &mut Transaction<'_>, index: &SortedIndex) -> Result<u64> {
        Ok(index
            .get(tx, b"counter")?
            .map(|raw| String::from_utf8_lossy(&raw).parse().unwrap_or(0))
            .unwrap_or(0))
    }

    #[test]
    fn test_start_requires_file() {
        let store = TransactionalStore::from(&StoreSettings::default());
        let err = store.start().unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(!store.is_started());
    }

    #[test]
    fn test_execute_before_start_fails() {
        let dir = TempDir::new().unwrap();
        let store = TransactionalStore::new(dir.path().join("idle.db"));
        let result = store.execute(|_| Ok(()));
        assert!(matches!(result, Err(StoreError::NotStarted)));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = started(&dir);
        store.start().unwrap();
        assert!(store.is_started());

        store.stop().unwrap();
        store.stop().unwrap();
        assert!(!store.is_started());
    }

    #[test]
    fn test_open_without_create_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = started(&dir);

        let missing = store.execute(|tx| store.open_or_create(tx, "missing", false)).unwrap();
        assert!(missing.is_none());
        assert!(store.indexes().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_keeps_index_locations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("round-trip.db");
        let names = ["orders", "invoices", "shipments"];

        let locations = {
            let store = TransactionalStore::new(&path).with_page_size(512);
            store.start().unwrap();
            for i in 0..30 {
                let name = names[i % names.len()];
                store
                    .execute(|tx| {
                        let index = store.open_or_create(tx, name, true)?.unwrap();
                        index.put(tx, format!("key-{i:02}"), format!("value-{i}"))?;
                        Ok(())
                    })
                    .unwrap();
            }
            let locations = store
                .execute(|tx| SortedIndex::registered(tx))
                .unwrap();
            store.stop().unwrap();
            locations
        };

        let store = TransactionalStore::new(&path);
        store.start().unwrap();
        let reopened = store.execute(|tx| SortedIndex::registered(tx)).unwrap();
        assert_eq!(reopened, locations);
        assert_eq!(reopened.len(), 3);

        let (count, value) = store
            .execute(|tx| {
                let index = store.open_or_create(tx, "invoices", false)?.unwrap();
                Ok((index.len(tx)?, index.get(tx, b"key-01")?))
            })
            .unwrap();
        assert_eq!(count, 10);
        assert_eq!(value, Some(b"value-1".to_vec()));
    }

    #[test]
    fn test_reopen_reuses_free_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("free.db");
        {
            let store = TransactionalStore::new(&path).with_page_size(256);
            store.start().unwrap();
            store
                .execute(|tx| {
                    let index = store.open_or_create(tx, "big", true)?.unwrap();
                    index.put(tx, "blob", vec![1u8; 2000])?;
                    Ok(())
                })
                .unwrap();
            store
                .execute(|tx| {
                    let index = store.open_or_create(tx, "big", false)?.unwrap();
                    index.remove(tx, b"blob")?;
                    Ok(())
                })
                .unwrap();
            store.stop().unwrap();
        }

        let store = TransactionalStore::new(&path).with_page_size(256);
        store.start().unwrap();
        let page_file = store.page_file().unwrap();
        let high_water = page_file.high_water();
        assert!(page_file.free_pages() > 0);

        store
            .execute(|tx| {
                let index = store.open_or_create(tx, "big", false)?.unwrap();
                index.put(tx, "blob", vec![2u8; 1000])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(page_file.high_water(), high_water);
    }

    #[test]
    fn test_concurrent_updates_retry_without_lost_update() {
        let dir = TempDir::new().unwrap();
        let store = started(&dir);
        let index = store
            .execute(|tx| store.open_or_create(tx, "counters", true))
            .unwrap()
            .unwrap();

        let barrier = Barrier::new(2);
        let attempts = [AtomicUsize::new(0), AtomicUsize::new(0)];

        std::thread::scope(|scope| {
            for attempts in &attempts {
                let store = &store;
                let barrier = &barrier;
                scope.spawn(move || {
                    store
                        .execute(|tx| {
                            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                            let current = read_counter(tx, &index)?;
                            if attempt == 1 {
                                // both first attempts read before either commits
                                barrier.wait();
                            }
                            index.put(tx, "counter", (current + 1).to_string())?;
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });

        let mut counts: Vec<usize> = attempts.iter().map(|a| a.load(Ordering::SeqCst)).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2]);

        let total = store.execute(|tx| read_counter(tx, &index)).unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_fatal_error_rolls_back_without_retry() {
        let dir = TempDir::new().unwrap();
        let store = started(&dir);
        let index = store
            .execute(|tx| store.open_or_create(tx, "fatal", true))
            .unwrap()
            .unwrap();

        let attempts = AtomicUsize::new(0);
        let result: Result<()> = store.execute(|tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            index.put(tx, "partial", "write")?;
            Err(anyhow::anyhow!("downstream rejected the batch").into())
        });

        assert!(matches!(result, Err(StoreError::Work(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let partial = store.execute(|tx| index.get(tx, b"partial")).unwrap();
        assert_eq!(partial, None);
    }
}
