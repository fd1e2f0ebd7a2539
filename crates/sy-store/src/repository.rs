//! AggregationRepository - durable storage for in-progress aggregations
//!
//! Aggregated messages live in the index named after the repository, keyed by
//! correlation key. Completed aggregations move to `<name>-completed`, keyed by message
//! id, until they are confirmed. Anything still there after a restart is recoverable.

use std::sync::Arc;

use sy_common::Message;
use tracing::{debug, trace};

use crate::error::Result;
use crate::store::TransactionalStore;

pub struct AggregationRepository {
    name: String,
    completed_name: String,
    store: Arc<TransactionalStore>,
}

impl AggregationRepository {
    pub fn new(name: impl Into<String>, store: Arc<TransactionalStore>) -> Self {
        let name = name.into();
        let completed_name = format!("{}-completed", name);
        Self {
            name,
            completed_name,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `message` under `key`, returning the message it replaced
    pub fn add(&self, key: &str, message: &Message) -> Result<Option<Message>> {
        let encoded = serde_json::to_vec(message)?;
        let previous = self.store.execute(|tx| {
            let index = self.store.open_or_create(tx, &self.name, true)?;
            match index {
                Some(index) => index.put(tx, key, encoded.clone()),
                None => Ok(None),
            }
        })?;
        trace!(repository = %self.name, key = %key, message_id = %message.id, "Added aggregation");
        previous.map(|raw| decode(&raw)).transpose()
    }

    pub fn get(&self, key: &str) -> Result<Option<Message>> {
        let raw = self.store.execute(|tx| match self.store.open_or_create(tx, &self.name, false)? {
            Some(index) => index.get(tx, key.as_bytes()),
            None => Ok(None),
        })?;
        raw.map(|raw| decode(&raw)).transpose()
    }

    /// Remove the aggregation under `key` and park `message` as completed until confirmed
    pub fn remove(&self, key: &str, message: &Message) -> Result<()> {
        let encoded = serde_json::to_vec(message)?;
        self.store.execute(|tx| {
            if let Some(index) = self.store.open_or_create(tx, &self.name, false)? {
                index.remove(tx, key.as_bytes())?;
            }
            if let Some(completed) = self.store.open_or_create(tx, &self.completed_name, true)? {
                completed.put(tx, message.id.as_str(), encoded.clone())?;
            }
            Ok(())
        })?;
        debug!(repository = %self.name, key = %key, message_id = %message.id, "Aggregation completed");
        Ok(())
    }

    /// Drop a completed aggregation. Returns false when it was not pending.
    pub fn confirm(&self, message_id: &str) -> Result<bool> {
        let removed = self.store.execute(|tx| match self.store.open_or_create(tx, &self.completed_name, false)? {
            Some(completed) => Ok(completed.remove(tx, message_id.as_bytes())?.is_some()),
            None => Ok(false),
        })?;
        trace!(repository = %self.name, message_id = %message_id, removed, "Confirmed aggregation");
        Ok(removed)
    }

    /// Ids of completed aggregations that were never confirmed
    pub fn scan(&self) -> Result<Vec<String>> {
        let ids = self.store.execute(|tx| match self.store.open_or_create(tx, &self.completed_name, false)? {
            Some(completed) => completed.keys(tx),
            None => Ok(Vec::new()),
        })?;
        let ids: Vec<String> = ids
            .into_iter()
            .map(|id| String::from_utf8_lossy(&id).into_owned())
            .collect();
        if !ids.is_empty() {
            debug!(repository = %self.name, count = ids.len(), "Found completed aggregations to recover");
        }
        Ok(ids)
    }

    /// The completed message with `message_id`, if still unconfirmed
    pub fn recover(&self, message_id: &str) -> Result<Option<Message>> {
        let raw = self.store.execute(|tx| match self.store.open_or_create(tx, &self.completed_name, false)? {
            Some(completed) => completed.get(tx, message_id.as_bytes()),
            None => Ok(None),
        })?;
        raw.map(|raw| decode(&raw)).transpose()
    }

    /// Correlation keys of in-progress aggregations
    pub fn keys(&self) -> Result<Vec<String>> {
        let keys = self.store.execute(|tx| match self.store.open_or_create(tx, &self.name, false)? {
            Some(index) => index.keys(tx),
            None => Ok(Vec::new()),
        })?;
        Ok(keys
            .into_iter()
            .map(|key| String::from_utf8_lossy(&key).into_owned())
            .collect())
    }
}

fn decode(raw: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(raw)?)
}
