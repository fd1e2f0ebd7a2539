//! TimeoutMap - concurrent map with sliding expiry
//!
//! Every `put` and every successful `get` pushes an entry's expire time to `now + timeout`.
//! A purge task scheduled every `purge_poll_time` collects expired entries, notifies the
//! eviction listener earliest-expired first, and removes the approved entries once all
//! notifications for the sweep have been made.
//!
//! Locking is optional: with `use_lock(false)` the map skips the exclusive guard for callers
//! that never touch it from more than one task.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use sy_config::TimeoutMapSettings;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::scheduler::{ScheduledTask, Scheduler};
use crate::{Result, RouterError};

const DEFAULT_PURGE_POLL: Duration = Duration::from_millis(1000);

/// Decides what happens to expired entries.
///
/// Scheduled sweeps call the listener on the runtime's blocking pool while holding the map's
/// lock, so a slow listener delays other locked map operations but never a runtime worker.
pub trait EvictionListener<K, V>: Send + Sync {
    /// Pre-filter applied while scanning; entries rejected here are not even notified
    fn is_valid_for_eviction(&self, _key: &K, _value: &V) -> bool {
        true
    }

    /// Called for each expired entry, earliest-expired first. Return `false` to keep the entry
    /// until the next sweep.
    fn on_eviction(&self, key: &K, value: &V) -> bool;
}

/// Evicts every expired entry
pub struct EvictAll;

impl<K, V> EvictionListener<K, V> for EvictAll {
    fn on_eviction(&self, _key: &K, _value: &V) -> bool {
        true
    }
}

impl<K, V, F> EvictionListener<K, V> for F
where
    F: Fn(&K, &V) -> bool + Send + Sync,
{
    fn on_eviction(&self, key: &K, value: &V) -> bool {
        self(key, value)
    }
}

#[derive(Debug, Clone)]
struct TimeoutEntry<V> {
    value: V,
    timeout: Duration,
    expire_at: Instant,
}

impl<V> TimeoutEntry<V> {
    fn new(value: V, timeout: Duration) -> Self {
        Self {
            value,
            timeout,
            expire_at: Instant::now() + timeout,
        }
    }

    fn touch(&mut self) {
        self.expire_at = Instant::now() + self.timeout;
    }
}

struct Inner<K, V> {
    name: String,
    map: DashMap<K, TimeoutEntry<V>>,
    lock: Option<ReentrantMutex<()>>,
    purge_poll_time: Duration,
    listener: Arc<dyn EvictionListener<K, V>>,
    purge_task: Mutex<Option<ScheduledTask>>,
    running: AtomicBool,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn guard(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.lock.as_ref().map(|l| l.lock())
    }

    fn run_purge(&self) {
        if !self.running.load(Ordering::SeqCst) {
            trace!(map = %self.name, "Purge task not allowed to run");
            return;
        }

        trace!(map = %self.name, "Running purge task to see if any entries have timed out");
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.purge())) {
            warn!(
                map = %self.name,
                error = %panic_message(&panic),
                "Purge task failed, will retry on next sweep"
            );
        }
    }

    fn purge(&self) -> usize {
        trace!(map = %self.name, size = self.map.len(), "Purging timeout map");
        let now = Instant::now();
        let _guard = self.guard();

        // Snapshot first so listener callbacks never run while a shard lock is held
        let candidates: Vec<(K, V, Instant)> = self
            .map
            .iter()
            .filter(|e| e.value().expire_at < now)
            .map(|e| (e.key().clone(), e.value().value.clone(), e.value().expire_at))
            .collect();

        let mut expired: Vec<(K, V, Instant)> = candidates
            .into_iter()
            .filter(|(key, value, _)| {
                self.guarded_listener_call(key, "is_valid_for_eviction", || {
                    self.listener.is_valid_for_eviction(key, value)
                })
            })
            .collect();

        if expired.is_empty() {
            return 0;
        }

        expired.sort_by_key(|(_, _, expire_at)| *expire_at);

        let mut evicts = Vec::with_capacity(expired.len());
        for (key, value, _) in &expired {
            let evict = self.guarded_listener_call(key, "on_eviction", || {
                self.listener.on_eviction(key, value)
            });
            if evict {
                debug!(map = %self.name, key = ?key, "Evicting inactive entry");
                evicts.push(key.clone());
            } else {
                trace!(map = %self.name, key = ?key, "Eviction vetoed by listener");
            }
        }

        let mut removed = 0;
        for key in evicts {
            // A listener may have refreshed the entry re-entrantly; keep it if so
            if self.map.remove_if(&key, |_, e| e.expire_at < now).is_some() {
                removed += 1;
            }
        }

        metrics::counter!("switchyard_timeout_map_evictions_total").increment(removed as u64);
        removed
    }

    /// Listener calls are isolated so one misbehaving listener can't abort the sweep.
    /// A panicking call counts as a veto.
    fn guarded_listener_call<F>(&self, key: &K, hook: &str, call: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(decision) => decision,
            Err(panic) => {
                warn!(
                    map = %self.name,
                    key = ?key,
                    hook = hook,
                    error = %panic_message(&panic),
                    "Eviction listener failed, keeping entry for this sweep"
                );
                false
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Concurrent map whose entries expire after a period of inactivity
pub struct TimeoutMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for TimeoutMap<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V> TimeoutMap<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> TimeoutMapBuilder<K, V> {
        TimeoutMapBuilder {
            name: name.into(),
            purge_poll_time: DEFAULT_PURGE_POLL,
            use_lock: true,
            listener: Arc::new(EvictAll),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &TimeoutMapSettings) -> TimeoutMapBuilder<K, V> {
        Self::builder(name)
            .purge_poll_time(Duration::from_millis(settings.purge_poll_ms))
            .use_lock(settings.use_lock)
    }

    /// Returns the value and restarts its expiry window
    pub fn get(&self, key: &K) -> Option<V> {
        let _guard = self.inner.guard();
        let mut entry = self.inner.map.get_mut(key)?;
        entry.touch();
        Some(entry.value.clone())
    }

    /// Insert or replace an entry, starting a fresh expiry window
    pub fn put(&self, key: K, value: V, timeout: Duration) {
        let _guard = self.inner.guard();
        self.inner.map.insert(key, TimeoutEntry::new(value, timeout));
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let _guard = self.inner.guard();
        self.inner.map.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn keys(&self) -> Vec<K> {
        let _guard = self.inner.guard();
        self.inner.map.iter().map(|e| e.key().clone()).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    pub fn purge_poll_time(&self) -> Duration {
        self.inner.purge_poll_time
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one eviction sweep now. Returns the number of entries removed.
    pub fn purge(&self) -> usize {
        self.inner.purge()
    }

    /// Schedule the purge task. Fails if the scheduler has already been shut down.
    pub fn start(&self, scheduler: &Scheduler) -> Result<()> {
        if scheduler.is_shutdown() {
            return Err(RouterError::SchedulerShutdown {
                name: scheduler.name().to_string(),
            });
        }

        let mut purge_task = self.inner.purge_task.lock();
        if purge_task.is_some() {
            return Ok(());
        }

        self.inner.running.store(true, Ordering::SeqCst);
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        let task = scheduler.schedule_with_fixed_delay(
            Duration::ZERO,
            self.inner.purge_poll_time,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.run_purge();
                }
            },
        );

        match task {
            Ok(task) => {
                *purge_task = Some(task);
                info!(
                    map = %self.inner.name,
                    purge_poll_ms = self.inner.purge_poll_time.as_millis() as u64,
                    "Started timeout map"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Cancel the purge task and clear all entries. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.purge_task.lock().take() {
            task.cancel();
            info!(map = %self.inner.name, "Stopped timeout map");
        }
        let _guard = self.inner.guard();
        self.inner.map.clear();
    }
}

pub struct TimeoutMapBuilder<K, V> {
    name: String,
    purge_poll_time: Duration,
    use_lock: bool,
    listener: Arc<dyn EvictionListener<K, V>>,
}

impl<K, V> TimeoutMapBuilder<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn purge_poll_time(mut self, purge_poll_time: Duration) -> Self {
        self.purge_poll_time = purge_poll_time;
        self
    }

    pub fn use_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    pub fn listener(mut self, listener: impl EvictionListener<K, V> + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub fn build(self) -> TimeoutMap<K, V> {
        TimeoutMap {
            inner: Arc::new(Inner {
                name: self.name,
                map: DashMap::new(),
                lock: self.use_lock.then(|| ReentrantMutex::new(())),
                purge_poll_time: self.purge_poll_time,
                listener: self.listener,
                purge_task: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }
}
