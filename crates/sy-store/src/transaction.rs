//! Optimistic transactions over a TxPageFile
//!
//! Reads see committed data as of the first access to each page and are repeatable after
//! that. Writes are buffered until commit, where every written or freed page is checked
//! against the version first observed; a mismatch means another transaction committed the
//! page in between and the whole transaction fails with `OptimisticUpdate`.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::page_file::{PageId, TxPageFile};

pub struct Transaction<'a> {
    file: &'a TxPageFile,
    observed: HashMap<PageId, u64>,
    cache: HashMap<PageId, Bytes>,
    writes: HashMap<PageId, Bytes>,
    freed: BTreeSet<PageId>,
    allocated: Vec<PageId>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(file: &'a TxPageFile) -> Self {
        Self {
            file,
            observed: HashMap::new(),
            cache: HashMap::new(),
            writes: HashMap::new(),
            freed: BTreeSet::new(),
            allocated: Vec::new(),
            finished: false,
        }
    }

    pub fn read(&mut self, page: PageId) -> Result<Bytes> {
        if let Some(data) = self.writes.get(&page) {
            return Ok(data.clone());
        }
        if self.freed.contains(&page) {
            return Err(StoreError::corrupt(format!("page {} was freed in this transaction", page)));
        }
        if let Some(data) = self.cache.get(&page) {
            return Ok(data.clone());
        }

        let (version, data) = self
            .file
            .snapshot(page)
            .ok_or_else(|| StoreError::corrupt(format!("page {} has no committed data", page)))?;
        self.observed.entry(page).or_insert(version);
        self.cache.insert(page, data.clone());
        Ok(data)
    }

    pub fn write(&mut self, page: PageId, data: impl Into<Bytes>) {
        self.observe(page);
        self.freed.remove(&page);
        self.writes.insert(page, data.into());
    }

    /// Reserve a new head page. Returned to the free set if the transaction does not commit.
    pub fn allocate(&mut self) -> PageId {
        let (page, version) = self.file.allocate();
        self.observed.insert(page, version);
        self.allocated.push(page);
        page
    }

    pub fn free(&mut self, page: PageId) {
        self.observe(page);
        self.writes.remove(&page);
        self.cache.remove(&page);
        self.freed.insert(page);
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.freed.is_empty() && self.allocated.is_empty()
    }

    pub fn commit(mut self) -> Result<()> {
        if self.is_read_only() {
            self.finished = true;
            return Ok(());
        }

        let mut freed = std::mem::take(&mut self.freed);
        // Reserved but never written
        for page in &self.allocated {
            if !self.writes.contains_key(page) {
                freed.insert(*page);
            }
        }
        let writes = std::mem::take(&mut self.writes);
        let (written, released) = (writes.len(), freed.len());

        self.file.apply(&self.observed, writes, freed)?;
        self.finished = true;
        trace!(written, released, "Committed transaction");
        Ok(())
    }

    pub fn rollback(mut self) {
        self.release();
    }

    fn observe(&mut self, page: PageId) {
        if !self.observed.contains_key(&page) {
            let version = self.file.version(page);
            self.observed.insert(page, version);
        }
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.file.release(&self.allocated);
        trace!(pages = self.allocated.len(), "Rolled back transaction");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
