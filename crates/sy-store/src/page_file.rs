//! TxPageFile - the durable medium behind the store
//!
//! File layout:
//! - header slot (one page): magic `SYPF`, format version, page size, page high-water mark
//! - page `n` at offset `(n + 1) * page_size`: payload length (u32), next page (u64), payload
//!
//! A record is a chain of pages starting at its head page. Committed records are cached in
//! memory; the file is the durable copy, written on `flush`. No free list is stored: after
//! opening, the owner loads every reachable record and calls `rebuild_free_pages`.
//!
//! Pages are overwritten in place, so every flush first writes its page images and the new
//! high-water mark to `<file>.journal`, sealed with a SHA-256 digest. `open` replays a sealed
//! journal left by an interrupted flush and discards a torn one.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StoreError};
use crate::transaction::Transaction;

pub type PageId = u64;

/// Location of the root index in every page file
pub const ROOT_PAGE: PageId = 0;

pub const MIN_PAGE_SIZE: usize = 256;

const MAGIC: &[u8; 4] = b"SYPF";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const PAGE_HEADER_LEN: usize = 4 + 8;
const NO_PAGE: u64 = u64::MAX;

const JOURNAL_MAGIC: &[u8; 4] = b"SYRJ";
const JOURNAL_HEADER_LEN: usize = 4 + 4 + 8 + 4;
const DIGEST_LEN: usize = 32;

struct Record {
    data: Bytes,
    /// Pages holding `data`, head first
    chain: Vec<PageId>,
}

struct PageState {
    records: HashMap<PageId, Record>,
    /// Commit counter per head page; survives frees so a reused page never looks unchanged
    versions: HashMap<PageId, u64>,
    high_water: u64,
    free: BTreeSet<PageId>,
    dirty: BTreeSet<PageId>,
}

impl PageState {
    fn version(&self, page: PageId) -> u64 {
        self.versions.get(&page).copied().unwrap_or(0)
    }

    fn allocate(&mut self) -> PageId {
        match self.free.pop_first() {
            Some(page) => page,
            None => {
                let page = self.high_water;
                self.high_water += 1;
                page
            }
        }
    }
}

/// Page images written by one flush
struct FlushBatch {
    heads: BTreeSet<PageId>,
    pages: Vec<(PageId, Bytes)>,
    high_water: u64,
}

pub struct TxPageFile {
    path: PathBuf,
    journal_path: PathBuf,
    page_size: usize,
    sync: bool,
    fresh: bool,
    file: Mutex<File>,
    state: Mutex<PageState>,
}

impl TxPageFile {
    /// Open or create the page file at `path`.
    ///
    /// An existing file keeps the page size recorded in its header.
    pub fn open(path: impl AsRef<Path>, page_size: usize, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let journal_path = journal_path_for(&path);
        if page_size < MIN_PAGE_SIZE {
            return Err(StoreError::Configuration(format!(
                "page_size must be at least {} bytes",
                MIN_PAGE_SIZE
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let fresh = file.metadata()?.len() == 0;

        let (page_size, high_water) = if fresh {
            // A journal without its page file belongs to a store that was deleted
            remove_journal(&journal_path)?;
            write_header(&mut file, page_size, 0)?;
            debug!(path = %path.display(), page_size, "Created page file");
            (page_size, 0)
        } else {
            let (file_page_size, _) = read_header(&mut file)?;
            replay_journal(&journal_path, &mut file, file_page_size)?;
            let (file_page_size, high_water) = read_header(&mut file)?;
            if file_page_size != page_size {
                warn!(
                    path = %path.display(),
                    configured = page_size,
                    actual = file_page_size,
                    "Page file uses a different page size than configured, keeping the file's"
                );
            }
            (file_page_size, high_water)
        };

        info!(path = %path.display(), page_size, pages = high_water, sync, "Opened page file");

        Ok(Self {
            path,
            journal_path,
            page_size,
            sync,
            fresh,
            file: Mutex::new(file),
            state: Mutex::new(PageState {
                records: HashMap::new(),
                versions: HashMap::new(),
                high_water,
                free: BTreeSet::new(),
                dirty: BTreeSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// True when `open` created the file
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Payload bytes per page
    pub fn capacity(&self) -> usize {
        self.page_size - PAGE_HEADER_LEN
    }

    pub fn high_water(&self) -> u64 {
        self.state.lock().high_water
    }

    pub fn free_pages(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn tx(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Read the record chain at `head` from disk into the committed cache
    pub fn load_record(&self, head: PageId) -> Result<Bytes> {
        let mut file = self.file.lock();
        let mut state = self.state.lock();
        if let Some(record) = state.records.get(&head) {
            return Ok(record.data.clone());
        }

        let mut data = BytesMut::new();
        let mut chain = Vec::new();
        let mut page = head;
        loop {
            if page >= state.high_water || chain.contains(&page) {
                return Err(StoreError::corrupt(format!(
                    "record {} has an invalid chain at page {}",
                    head, page
                )));
            }
            let (payload, next) = self.read_page(&mut file, page)?;
            data.extend_from_slice(&payload);
            chain.push(page);
            if next == NO_PAGE {
                break;
            }
            page = next;
        }

        trace!(head, pages = chain.len(), bytes = data.len(), "Loaded record");
        let data = data.freeze();
        state.versions.entry(head).or_insert(1);
        state.records.insert(head, Record { data: data.clone(), chain });
        Ok(data)
    }

    /// Recompute the free set as every page below the high-water mark not held by a loaded record
    pub fn rebuild_free_pages(&self) -> usize {
        let mut state = self.state.lock();
        let reachable: BTreeSet<PageId> = state
            .records
            .values()
            .flat_map(|record| record.chain.iter().copied())
            .collect();
        state.free = (0..state.high_water).filter(|page| !reachable.contains(page)).collect();
        debug!(path = %self.path.display(), free = state.free.len(), "Rebuilt free pages");
        state.free.len()
    }

    /// Write records committed since the last flush, then the header
    pub fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();
        let batch = self.take_dirty();

        let result = self.write_batch(&mut file, &batch);
        if result.is_err() {
            self.state.lock().dirty.extend(batch.heads);
        } else {
            trace!(
                records = batch.heads.len(),
                pages = batch.pages.len(),
                high_water = batch.high_water,
                "Flushed page file"
            );
        }
        result
    }

    fn take_dirty(&self) -> FlushBatch {
        let mut state = self.state.lock();
        let heads = std::mem::take(&mut state.dirty);
        let pages = heads
            .iter()
            .filter_map(|head| state.records.get(head))
            .flat_map(|record| self.page_images(&record.data, &record.chain))
            .collect();
        FlushBatch {
            heads,
            pages,
            high_water: state.high_water,
        }
    }

    fn page_images(&self, data: &Bytes, chain: &[PageId]) -> Vec<(PageId, Bytes)> {
        let capacity = self.capacity();
        chain
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let start = (i * capacity).min(data.len());
                let end = ((i + 1) * capacity).min(data.len());
                let next = chain.get(i + 1).copied().unwrap_or(NO_PAGE);

                let mut buf = BytesMut::with_capacity(self.page_size);
                buf.put_u32((end - start) as u32);
                buf.put_u64(next);
                buf.put_slice(&data[start..end]);
                buf.resize(self.page_size, 0);
                (*page, buf.freeze())
            })
            .collect()
    }

    /// Journal, apply in place, then drop the journal
    fn write_batch(&self, file: &mut File, batch: &FlushBatch) -> Result<()> {
        if batch.pages.is_empty() {
            write_header(file, self.page_size, batch.high_water)?;
            if self.sync {
                file.sync_all()?;
            }
            return Ok(());
        }

        self.write_journal(batch)?;
        write_pages(file, self.page_size, &batch.pages, batch.high_water, self.sync)?;
        remove_journal(&self.journal_path)
    }

    fn write_journal(&self, batch: &FlushBatch) -> Result<()> {
        let encoded = encode_journal(self.page_size, batch.high_water, &batch.pages);
        let mut journal = File::create(&self.journal_path)?;
        journal.write_all(&encoded)?;
        if self.sync {
            journal.sync_all()?;
        }
        Ok(())
    }

    fn read_page(&self, file: &mut File, page: PageId) -> Result<(Bytes, u64)> {
        let mut buf = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(self.offset(page)))?;
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => StoreError::corrupt(format!("page {} is past the end of the file", page)),
            _ => StoreError::Io(e),
        })?;

        let mut buf = Bytes::from(buf);
        let len = buf.get_u32() as usize;
        let next = buf.get_u64();
        if len > self.capacity() {
            return Err(StoreError::corrupt(format!("page {} declares {} payload bytes", page, len)));
        }
        Ok((buf.slice(..len), next))
    }

    fn offset(&self, page: PageId) -> u64 {
        page_offset(page, self.page_size)
    }

    // ========================================================================
    // Transaction support
    // ========================================================================

    /// Committed data and version of a head page
    pub(crate) fn snapshot(&self, page: PageId) -> Option<(u64, Bytes)> {
        let state = self.state.lock();
        state
            .records
            .get(&page)
            .map(|record| (state.version(page), record.data.clone()))
    }

    pub(crate) fn version(&self, page: PageId) -> u64 {
        self.state.lock().version(page)
    }

    /// Reserve a page for a new record; returns the page and its current version
    pub(crate) fn allocate(&self) -> (PageId, u64) {
        let mut state = self.state.lock();
        let page = state.allocate();
        (page, state.version(page))
    }

    /// Return pages reserved by a transaction that did not commit them
    pub(crate) fn release(&self, pages: &[PageId]) {
        if pages.is_empty() {
            return;
        }
        self.state.lock().free.extend(pages.iter().copied());
    }

    /// Validate and apply a transaction's write set under the commit lock
    pub(crate) fn apply(
        &self,
        observed: &HashMap<PageId, u64>,
        writes: HashMap<PageId, Bytes>,
        freed: BTreeSet<PageId>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        for page in writes.keys().chain(freed.iter()) {
            let seen = observed.get(page).copied().unwrap_or(0);
            if seen != state.version(*page) {
                return Err(StoreError::OptimisticUpdate { page: *page });
            }
        }
        for page in writes.keys() {
            if !state.records.contains_key(page) && state.free.contains(page) {
                return Err(StoreError::corrupt(format!("write to unallocated page {}", page)));
            }
        }

        let capacity = self.capacity();
        for (head, data) in writes {
            let needed = data.len().div_ceil(capacity).max(1);
            let mut chain = state
                .records
                .remove(&head)
                .map(|record| record.chain)
                .unwrap_or_else(|| vec![head]);

            while chain.len() < needed {
                let page = state.allocate();
                chain.push(page);
            }
            if chain.len() > needed {
                let surplus = chain.split_off(needed);
                state.free.extend(surplus);
            }

            *state.versions.entry(head).or_insert(0) += 1;
            state.records.insert(head, Record { data, chain });
            state.dirty.insert(head);
        }

        for head in freed {
            match state.records.remove(&head) {
                Some(record) => state.free.extend(record.chain),
                None => {
                    state.free.insert(head);
                }
            }
            *state.versions.entry(head).or_insert(0) += 1;
            state.dirty.remove(&head);
        }

        Ok(())
    }
}

fn page_offset(page: PageId, page_size: usize) -> u64 {
    (page + 1) * page_size as u64
}

fn write_pages(
    file: &mut File,
    page_size: usize,
    pages: &[(PageId, Bytes)],
    high_water: u64,
    sync: bool,
) -> Result<()> {
    for (page, image) in pages {
        file.seek(SeekFrom::Start(page_offset(*page, page_size)))?;
        file.write_all(image)?;
    }
    write_header(file, page_size, high_water)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

fn journal_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".journal");
    PathBuf::from(name)
}

fn remove_journal(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Journal layout: magic, page size (u32), high-water mark (u64), page count (u32), then per
/// page its id (u64) and full image, then a SHA-256 digest of everything before it.
fn encode_journal(page_size: usize, high_water: u64, pages: &[(PageId, Bytes)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(JOURNAL_HEADER_LEN + pages.len() * (8 + page_size) + DIGEST_LEN);
    buf.put_slice(JOURNAL_MAGIC);
    buf.put_u32(page_size as u32);
    buf.put_u64(high_water);
    buf.put_u32(pages.len() as u32);
    for (page, image) in pages {
        buf.put_u64(*page);
        buf.put_slice(image);
    }
    let digest = Sha256::digest(&buf[..]);
    buf.put_slice(&digest);
    buf.freeze()
}

/// High-water mark and page images of a sealed journal; `None` when torn or foreign
fn decode_journal(raw: Bytes, page_size: usize) -> Option<(u64, Vec<(PageId, Bytes)>)> {
    if raw.len() < JOURNAL_HEADER_LEN + DIGEST_LEN {
        return None;
    }
    let body_len = raw.len() - DIGEST_LEN;
    if Sha256::digest(&raw[..body_len]).as_slice() != &raw[body_len..] {
        return None;
    }

    let mut buf = raw.slice(..body_len);
    if &buf[..4] != JOURNAL_MAGIC {
        return None;
    }
    buf.advance(4);
    if buf.get_u32() as usize != page_size {
        return None;
    }
    let high_water = buf.get_u64();
    let count = buf.get_u32() as usize;
    if count.checked_mul(8 + page_size) != Some(buf.remaining()) {
        return None;
    }

    let mut pages = Vec::with_capacity(count);
    for _ in 0..count {
        let page = buf.get_u64();
        pages.push((page, buf.split_to(page_size)));
    }
    Some((high_water, pages))
}

/// Finish a flush that was interrupted after its journal was sealed, then remove the journal
fn replay_journal(journal_path: &Path, file: &mut File, page_size: usize) -> Result<bool> {
    let raw = match fs::read(journal_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let replayed = match decode_journal(Bytes::from(raw), page_size) {
        Some((high_water, pages)) => {
            write_pages(file, page_size, &pages, high_water, true)?;
            info!(
                journal = %journal_path.display(),
                pages = pages.len(),
                high_water,
                "Replayed journal of an interrupted flush"
            );
            true
        }
        None => {
            warn!(journal = %journal_path.display(), "Discarding incomplete journal");
            false
        }
    };
    remove_journal(journal_path)?;
    Ok(replayed)
}

fn write_header(file: &mut File, page_size: usize, high_water: u64) -> Result<()> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_slice(MAGIC);
    buf.put_u32(FORMAT_VERSION);
    buf.put_u32(page_size as u32);
    buf.put_u64(high_water);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<(usize, u64)> {
    let mut raw = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut raw).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => StoreError::corrupt("truncated header"),
        _ => StoreError::Io(e),
    })?;

    let mut buf = &raw[..];
    if &buf[..4] != MAGIC {
        return Err(StoreError::corrupt("not a page file (bad magic)"));
    }
    buf.advance(4);
    let version = buf.get_u32();
    if version != FORMAT_VERSION {
        return Err(StoreError::corrupt(format!("unsupported format version {}", version)));
    }
    let page_size = buf.get_u32() as usize;
    if page_size < MIN_PAGE_SIZE {
        return Err(StoreError::corrupt(format!("invalid page size {}", page_size)));
    }
    Ok((page_size, buf.get_u64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_file() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        (dir, path)
    }

    #[test]
    fn test_fresh_file_writes_header() {
        let (_dir, path) = temp_file();
        let file = TxPageFile::open(&path, 512, false).unwrap();
        assert!(file.is_fresh());
        assert_eq!(file.high_water(), 0);
        drop(file);

        let reopened = TxPageFile::open(&path, 512, false).unwrap();
        assert!(!reopened.is_fresh());
        assert_eq!(reopened.page_size(), 512);
    }

    #[test]
    fn test_reopen_keeps_file_page_size() {
        let (_dir, path) = temp_file();
        drop(TxPageFile::open(&path, 512, false).unwrap());

        let reopened = TxPageFile::open(&path, 4096, false).unwrap();
        assert_eq!(reopened.page_size(), 512);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let (_dir, path) = temp_file();
        std::fs::write(&path, b"definitely not a page file header").unwrap();

        let result = TxPageFile::open(&path, 512, false);
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_rejects_tiny_page_size() {
        let (_dir, path) = temp_file();
        let result = TxPageFile::open(&path, 64, false);
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[test]
    fn test_record_spanning_pages_survives_reopen() {
        let (_dir, path) = temp_file();
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        let head = {
            let file = TxPageFile::open(&path, 256, true).unwrap();
            let mut tx = file.tx();
            let head = tx.allocate();
            tx.write(head, payload.clone());
            tx.commit().unwrap();
            file.flush().unwrap();
            // 2000 bytes over 244-byte pages
            assert_eq!(file.high_water(), 9);
            head
        };

        assert!(!journal_path_for(&path).exists());
        let file = TxPageFile::open(&path, 256, false).unwrap();
        let loaded = file.load_record(head).unwrap();
        assert_eq!(&loaded[..], &payload[..]);
        assert_eq!(file.rebuild_free_pages(), 0);
    }

    #[test]
    fn test_shrinking_record_frees_pages() {
        let (_dir, path) = temp_file();
        let file = TxPageFile::open(&path, 256, false).unwrap();

        let mut tx = file.tx();
        let head = tx.allocate();
        tx.write(head, vec![7u8; 1000]);
        tx.commit().unwrap();
        assert_eq!(file.free_pages(), 0);

        let mut tx = file.tx();
        tx.write(head, vec![7u8; 10]);
        tx.commit().unwrap();
        file.flush().unwrap();
        assert_eq!(file.free_pages(), 4);

        drop(file);
        let file = TxPageFile::open(&path, 256, false).unwrap();
        assert_eq!(file.load_record(head).unwrap().len(), 10);
        assert_eq!(file.rebuild_free_pages(), 4);
    }

    #[test]
    fn test_unflushed_commits_are_not_durable() {
        let (_dir, path) = temp_file();
        {
            let file = TxPageFile::open(&path, 256, false).unwrap();
            let mut tx = file.tx();
            let head = tx.allocate();
            tx.write(head, b"volatile".to_vec());
            tx.commit().unwrap();
        }

        let file = TxPageFile::open(&path, 256, false).unwrap();
        assert_eq!(file.high_water(), 0);
        assert!(file.load_record(0).is_err());
    }

    #[test]
    fn test_interrupted_flush_is_replayed_on_open() {
        let (_dir, path) = temp_file();
        let (root, child) = {
            let file = TxPageFile::open(&path, 256, false).unwrap();
            let mut tx = file.tx();
            let root = tx.allocate();
            tx.write(root, b"root v1".to_vec());
            tx.commit().unwrap();
            file.flush().unwrap();

            let mut tx = file.tx();
            let child = tx.allocate();
            tx.write(child, vec![9u8; 600]);
            tx.write(root, b"root v2".to_vec());
            tx.commit().unwrap();

            // journal sealed, root page rewritten, then the process dies
            let batch = file.take_dirty();
            file.write_journal(&batch).unwrap();
            let (page, image) = &batch.pages[0];
            assert_eq!(*page, root);
            let mut handle = file.file.lock();
            handle.seek(SeekFrom::Start(file.offset(*page))).unwrap();
            handle.write_all(image).unwrap();
            (root, child)
        };

        let file = TxPageFile::open(&path, 256, false).unwrap();
        assert!(!journal_path_for(&path).exists());
        assert_eq!(file.high_water(), 4);
        assert_eq!(&file.load_record(root).unwrap()[..], b"root v2");
        assert_eq!(file.load_record(child).unwrap().len(), 600);
        assert_eq!(file.rebuild_free_pages(), 0);
    }

    #[test]
    fn test_torn_journal_is_discarded() {
        let (_dir, path) = temp_file();
        let file = TxPageFile::open(&path, 256, false).unwrap();
        let mut tx = file.tx();
        let head = tx.allocate();
        tx.write(head, b"stable".to_vec());
        tx.commit().unwrap();
        file.flush().unwrap();

        let mut tx = file.tx();
        tx.write(head, b"never durable".to_vec());
        tx.commit().unwrap();
        let batch = file.take_dirty();
        file.write_journal(&batch).unwrap();
        drop(file);

        let journal = journal_path_for(&path);
        let len = fs::metadata(&journal).unwrap().len();
        OpenOptions::new().write(true).open(&journal).unwrap().set_len(len - 10).unwrap();

        let file = TxPageFile::open(&path, 256, false).unwrap();
        assert!(!journal.exists());
        assert_eq!(file.high_water(), 1);
        assert_eq!(&file.load_record(head).unwrap()[..], b"stable");
    }

    #[test]
    fn test_stale_journal_ignored_for_new_file() {
        let (_dir, path) = temp_file();
        let journal = journal_path_for(&path);
        fs::write(&journal, encode_journal(256, 1, &[(0, Bytes::from(vec![0u8; 256]))])).unwrap();

        let file = TxPageFile::open(&path, 256, false).unwrap();
        assert!(file.is_fresh());
        assert!(!journal.exists());
        assert_eq!(file.high_water(), 0);
    }
}
