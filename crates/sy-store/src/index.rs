//! SortedIndex - byte-ordered key/value map stored as a single record
//!
//! Record encoding: entry count (u32), then per entry key length (u32), key,
//! value length (u32), value. Named indexes are found through the root index
//! at `ROOT_PAGE`, which maps index names to their head page.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::page_file::{PageId, ROOT_PAGE};
use crate::transaction::Transaction;

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

/// Handle to an index record. Operations run inside the caller's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortedIndex {
    location: PageId,
}

impl SortedIndex {
    /// Allocate and write an empty index
    pub fn create(tx: &mut Transaction<'_>) -> Self {
        let location = tx.allocate();
        tx.write(location, encode(&Entries::new()));
        Self { location }
    }

    pub fn open(location: PageId) -> Self {
        Self { location }
    }

    /// The index of index names
    pub fn root() -> Self {
        Self::open(ROOT_PAGE)
    }

    /// Look up the index called `name` in the root index, creating it when `create` is set
    pub fn open_or_create(tx: &mut Transaction<'_>, name: &str, create: bool) -> Result<Option<Self>> {
        let root = Self::root();
        if let Some(raw) = root.get(tx, name.as_bytes())? {
            return Ok(Some(Self::open(decode_location(name, &raw)?)));
        }
        if !create {
            return Ok(None);
        }

        let index = Self::create(tx);
        root.put(tx, name.as_bytes(), index.location.to_be_bytes())?;
        debug!(index = %name, location = index.location, "Created index");
        Ok(Some(index))
    }

    /// Every index registered in the root index, by name
    pub fn registered(tx: &mut Transaction<'_>) -> Result<Vec<(String, Self)>> {
        Self::root()
            .iter(tx)?
            .map(|(key, raw)| {
                let name = String::from_utf8_lossy(&key).into_owned();
                let location = decode_location(&name, &raw)?;
                Ok((name, Self::open(location)))
            })
            .collect()
    }

    pub fn names(tx: &mut Transaction<'_>) -> Result<Vec<String>> {
        Ok(Self::root()
            .keys(tx)?
            .into_iter()
            .map(|key| String::from_utf8_lossy(&key).into_owned())
            .collect())
    }

    pub fn location(&self) -> PageId {
        self.location
    }

    pub fn get(&self, tx: &mut Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.load(tx)?.remove(key))
    }

    pub fn contains_key(&self, tx: &mut Transaction<'_>, key: &[u8]) -> Result<bool> {
        Ok(self.load(tx)?.contains_key(key))
    }

    /// Insert or replace, returning the previous value
    pub fn put(
        &self,
        tx: &mut Transaction<'_>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        let mut entries = self.load(tx)?;
        let previous = entries.insert(key.into(), value.into());
        tx.write(self.location, encode(&entries));
        Ok(previous)
    }

    pub fn remove(&self, tx: &mut Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut entries = self.load(tx)?;
        let previous = entries.remove(key);
        if previous.is_some() {
            tx.write(self.location, encode(&entries));
        }
        Ok(previous)
    }

    pub fn len(&self, tx: &mut Transaction<'_>) -> Result<usize> {
        Ok(self.load(tx)?.len())
    }

    pub fn is_empty(&self, tx: &mut Transaction<'_>) -> Result<bool> {
        Ok(self.load(tx)?.is_empty())
    }

    pub fn keys(&self, tx: &mut Transaction<'_>) -> Result<Vec<Vec<u8>>> {
        Ok(self.load(tx)?.into_keys().collect())
    }

    /// Entries in key byte order
    pub fn iter(&self, tx: &mut Transaction<'_>) -> Result<std::collections::btree_map::IntoIter<Vec<u8>, Vec<u8>>> {
        Ok(self.load(tx)?.into_iter())
    }

    fn load(&self, tx: &mut Transaction<'_>) -> Result<Entries> {
        decode(self.location, tx.read(self.location)?)
    }
}

fn encode(entries: &Entries) -> Bytes {
    let size = 4 + entries.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(entries.len() as u32);
    for (key, value) in entries {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    buf.freeze()
}

fn decode(location: PageId, mut buf: Bytes) -> Result<Entries> {
    let corrupt = || StoreError::corrupt(format!("index at page {} is truncated", location));

    if buf.remaining() < 4 {
        return Err(corrupt());
    }
    let count = buf.get_u32();
    let mut entries = Entries::new();
    for _ in 0..count {
        let key = take_chunk(&mut buf).ok_or_else(corrupt)?;
        let value = take_chunk(&mut buf).ok_or_else(corrupt)?;
        entries.insert(key, value);
    }
    Ok(entries)
}

fn take_chunk(buf: &mut Bytes) -> Option<Vec<u8>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.split_to(len).to_vec())
}

fn decode_location(name: &str, raw: &[u8]) -> Result<PageId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::corrupt(format!("root entry for {} is not a page location", name)))?;
    Ok(PageId::from_be_bytes(bytes))
}
