#![forbid(unsafe_code)]

//! Size- and age-bounded caches bound to a scope.
//!
//! A [`Cache`] keeps values under string keys. An entry expires `max_age`
//! after it was stored; once more than `max_size` entries are held, the
//! least recently read ones are evicted. Ages follow the host clock of the
//! [`TimerManager`] the cache was created on, and a periodic cleanup runs as
//! an interval on that manager.
//!
//! A cache created with a [`CacheStore`] starts from the stored entries that
//! are still fresh. It writes its fresh entries back after a removal, after
//! a cleanup that dropped something, on [`Cache::flush`], and when it is
//! torn down (scope end, replacement, [`Cache::close`]). `clear` empties the
//! store as well.
//!
//! # Invariants
//!
//! 1. `len() <= max_size` after every `set`.
//! 2. `get` never returns an expired value.
//! 3. A closed cache holds nothing and ignores `set`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use lifescope_core::diagnostics::{Diagnostics, LifecycleEventKind};
use lifescope_core::{EntryHandle, LifecycleConfig, Registry, ResourceId, TeardownError, TeardownReport};

use crate::timer::{TimerClock, TimerHandle, TimerManager};

/// Registry category for caches.
pub const CACHE_CATEGORY: &str = "cache";

/// Bounds and cleanup cadence of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Most entries kept after a `set`.
    pub max_size: usize,
    /// Age at which an entry expires.
    pub max_age: Duration,
    /// Period of the background cleanup.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    /// Set the entry limit.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the expiry age.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the cleanup period.
    #[must_use]
    pub fn with_cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }
}

/// Occupancy and lifetime counters of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries held now.
    pub size: usize,
    /// Configured limit.
    pub max_size: usize,
    /// `get` calls that returned a value.
    pub hits: u64,
    /// `get` calls that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped by the size limit.
    pub evictions: u64,
    /// Cleanups that dropped at least one entry.
    pub cleanups: u64,
}

impl CacheStats {
    /// `size / max_size`, in percent.
    #[must_use]
    pub fn usage(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.size as f64 * 100.0 / self.max_size as f64
    }

    /// Hits over all lookups, in percent. Zero before the first lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 * 100.0 / lookups as f64
    }
}

/// One entry as handed to a [`CacheStore`].
///
/// Times are relative to the moment of the save, so they survive a clock
/// that restarts from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "cache-persistence", derive(serde::Serialize, serde::Deserialize))]
pub struct StoredEntry<T> {
    /// Cache key.
    pub key: String,
    /// Cached value.
    pub value: T,
    /// Milliseconds since the entry was stored.
    pub age_ms: u64,
    /// Milliseconds since the entry was last read.
    pub idle_ms: u64,
    /// Reads plus the initial store.
    pub access_count: u64,
}

/// Failure of a [`CacheStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStoreError {
    message: String,
}

impl CacheStoreError {
    /// Error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Failure description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CacheStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache store: {}", self.message)
    }
}

impl std::error::Error for CacheStoreError {}

/// Backing storage for caches that outlive their scope.
///
/// Entries are saved in least-recently-read-first order and loaded back in
/// the order returned.
pub trait CacheStore<T> {
    /// Entries saved under `name`; empty when nothing was saved.
    fn load(&self, name: &str) -> Result<Vec<StoredEntry<T>>, CacheStoreError>;

    /// Replace whatever is saved under `name`.
    fn save(&self, name: &str, entries: Vec<StoredEntry<T>>) -> Result<(), CacheStoreError>;
}

/// In-process store; clones share contents. Keeps a cache warm across
/// remounts within one session.
pub struct MemoryCacheStore<T> {
    saved: Rc<RefCell<HashMap<String, Vec<StoredEntry<T>>>>>,
}

impl<T> Clone for MemoryCacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            saved: Rc::clone(&self.saved),
        }
    }
}

impl<T> Default for MemoryCacheStore<T> {
    fn default() -> Self {
        Self {
            saved: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl<T> fmt::Debug for MemoryCacheStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheStore")
            .field("caches", &self.saved.borrow().len())
            .finish()
    }
}

impl<T: Clone> MemoryCacheStore<T> {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// What is saved under `name`.
    #[must_use]
    pub fn entries(&self, name: &str) -> Vec<StoredEntry<T>> {
        self.saved.borrow().get(name).cloned().unwrap_or_default()
    }
}

impl<T: Clone> CacheStore<T> for MemoryCacheStore<T> {
    fn load(&self, name: &str) -> Result<Vec<StoredEntry<T>>, CacheStoreError> {
        Ok(self.entries(name))
    }

    fn save(&self, name: &str, entries: Vec<StoredEntry<T>>) -> Result<(), CacheStoreError> {
        self.saved.borrow_mut().insert(name.to_owned(), entries);
        Ok(())
    }
}

#[cfg(feature = "cache-persistence")]
pub use file_store::JsonFileStore;

#[cfg(feature = "cache-persistence")]
mod file_store {
    use std::fs;
    use std::io;
    use std::path::PathBuf;

    use serde::Serialize;
    use serde::de::DeserializeOwned;

    use super::{CacheStore, CacheStoreError, StoredEntry};

    /// One JSON file per cache, `cache_<name>.json` under a directory.
    #[derive(Debug, Clone)]
    pub struct JsonFileStore {
        dir: PathBuf,
    }

    impl JsonFileStore {
        /// Store rooted at `dir`. The directory is created on first save.
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        /// File backing the cache `name`. Characters outside
        /// `[A-Za-z0-9_-]` become `_`.
        #[must_use]
        pub fn path_for(&self, name: &str) -> PathBuf {
            let safe: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect();
            self.dir.join(format!("cache_{safe}.json"))
        }
    }

    impl<T: Serialize + DeserializeOwned> CacheStore<T> for JsonFileStore {
        fn load(&self, name: &str) -> Result<Vec<StoredEntry<T>>, CacheStoreError> {
            match fs::read_to_string(self.path_for(name)) {
                Ok(text) => serde_json::from_str(&text).map_err(|err| CacheStoreError::new(err.to_string())),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(err) => Err(CacheStoreError::new(err.to_string())),
            }
        }

        fn save(&self, name: &str, entries: Vec<StoredEntry<T>>) -> Result<(), CacheStoreError> {
            let text = serde_json::to_string(&entries).map_err(|err| CacheStoreError::new(err.to_string()))?;
            fs::create_dir_all(&self.dir).map_err(|err| CacheStoreError::new(err.to_string()))?;
            fs::write(self.path_for(name), text).map_err(|err| CacheStoreError::new(err.to_string()))
        }
    }
}

struct Slot<T> {
    value: T,
    stored_at: Duration,
    /// Age carried over from a store.
    prior_age: Duration,
    read_at: Duration,
    prior_idle: Duration,
    access_count: u64,
    /// Recency rank; higher was touched later.
    touched: u64,
}

impl<T> Slot<T> {
    fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.stored_at).saturating_add(self.prior_age)
    }

    fn idle(&self, now: Duration) -> Duration {
        now.saturating_sub(self.read_at).saturating_add(self.prior_idle)
    }
}

#[derive(Clone, Copy, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    cleanups: u64,
}

struct CacheCore<T> {
    name: ResourceId,
    config: CacheConfig,
    slots: RefCell<HashMap<String, Slot<T>>>,
    counters: Cell<Counters>,
    touch_seq: Cell<u64>,
    clock: TimerClock,
    last_now: Cell<Duration>,
    store: Option<Box<dyn CacheStore<T>>>,
    loaded: Cell<bool>,
    closed: Cell<bool>,
    cleanup_timer: RefCell<Option<TimerHandle>>,
    diag: Rc<Diagnostics>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl<T: Clone + 'static> CacheCore<T> {
    fn now(&self) -> Duration {
        if let Some(now) = self.clock.now() {
            self.last_now.set(now);
        }
        self.last_now.get()
    }

    fn next_touch(&self) -> u64 {
        let seq = self.touch_seq.get() + 1;
        self.touch_seq.set(seq);
        seq
    }

    fn is_fresh(&self, slot: &Slot<T>, now: Duration) -> bool {
        slot.age(now) < self.config.max_age
    }

    fn bump(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.get();
        f(&mut counters);
        self.counters.set(counters);
    }

    fn load(&self) {
        let Some(store) = &self.store else {
            self.loaded.set(true);
            return;
        };
        let entries = match store.load(self.name.as_str()) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(cache = self.name.as_str(), error = %err, "lifescope: cache load failed");
                Vec::new()
            }
        };
        let now = self.now();
        let mut slots = self.slots.borrow_mut();
        for entry in entries {
            let age = Duration::from_millis(entry.age_ms);
            if age >= self.config.max_age {
                continue;
            }
            let touched = self.next_touch();
            slots.insert(
                entry.key,
                Slot {
                    value: entry.value,
                    stored_at: now,
                    prior_age: age,
                    read_at: now,
                    prior_idle: Duration::from_millis(entry.idle_ms),
                    access_count: entry.access_count,
                    touched,
                },
            );
        }
        self.loaded.set(true);
        if self.diag.enabled() {
            tracing::debug!(cache = self.name.as_str(), entries = slots.len(), "lifescope: cache loaded");
        }
    }

    fn persist(&self) -> Result<(), CacheStoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if !self.loaded.get() {
            return Ok(());
        }
        let now = self.now();
        let mut fresh: Vec<(u64, StoredEntry<T>)> = self
            .slots
            .borrow()
            .iter()
            .filter(|(_, slot)| self.is_fresh(slot, now))
            .map(|(key, slot)| {
                let entry = StoredEntry {
                    key: key.clone(),
                    value: slot.value.clone(),
                    age_ms: millis(slot.age(now)),
                    idle_ms: millis(slot.idle(now)),
                    access_count: slot.access_count,
                };
                (slot.touched, entry)
            })
            .collect();
        fresh.sort_by_key(|(touched, _)| *touched);
        let count = fresh.len();
        store.save(self.name.as_str(), fresh.into_iter().map(|(_, entry)| entry).collect())?;
        self.diag.emit(
            LifecycleEventKind::CachePersisted,
            Some(&self.name),
            Some(&format!("{count} entries")),
            count,
        );
        Ok(())
    }

    fn persist_or_warn(&self) {
        if let Err(err) = self.persist() {
            tracing::warn!(cache = self.name.as_str(), error = %err, "lifescope: cache save failed");
        }
    }

    fn cleanup(&self) -> usize {
        let now = self.now();
        let (expired, evicted, left) = {
            let mut slots = self.slots.borrow_mut();
            let before = slots.len();
            slots.retain(|_, slot| self.is_fresh(slot, now));
            let expired = before - slots.len();

            let over = slots.len().saturating_sub(self.config.max_size);
            if over > 0 {
                let mut by_recency: Vec<(u64, String)> =
                    slots.iter().map(|(key, slot)| (slot.touched, key.clone())).collect();
                by_recency.sort_unstable();
                for (_, key) in by_recency.into_iter().take(over) {
                    slots.remove(&key);
                }
            }
            (expired, over, slots.len())
        };
        let removed = expired + evicted;
        if removed == 0 {
            return 0;
        }
        self.bump(|c| {
            c.evictions += evicted as u64;
            c.cleanups += 1;
        });
        self.diag.emit(
            LifecycleEventKind::CacheCleaned,
            Some(&self.name),
            Some(&format!("expired={expired} evicted={evicted}")),
            left,
        );
        self.persist_or_warn();
        removed
    }

    /// Re-arm the periodic cleanup after a forced cleanup cleared it.
    fn ensure_cleanup_timer(&self) {
        if let Some(timer) = self.cleanup_timer.borrow_mut().as_mut() {
            if !timer.is_active() {
                timer.restart(None);
            }
        }
    }

    fn shut_down(&self) -> Result<(), CacheStoreError> {
        self.closed.set(true);
        if let Some(timer) = self.cleanup_timer.borrow_mut().take() {
            timer.clear();
        }
        let saved = self.persist();
        self.slots.borrow_mut().clear();
        saved
    }
}

/// Handle to one cache. Clones refer to the same cache.
pub struct Cache<T> {
    core: Rc<CacheCore<T>>,
    entry: EntryHandle,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            entry: self.entry.clone(),
        }
    }
}

impl<T> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.core.name)
            .field("len", &self.core.slots.borrow().len())
            .field("closed", &self.core.closed.get())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Cache<T> {
    /// Cache name; also its registry id.
    #[must_use]
    pub fn name(&self) -> &ResourceId {
        &self.core.name
    }

    /// Bounds the cache was created with.
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.core.config
    }

    /// Value under `key` when present and fresh. Counts a hit or a miss; an
    /// expired entry is dropped.
    pub fn get(&self, key: &str) -> Option<T> {
        let core = &self.core;
        if core.closed.get() {
            return None;
        }
        let now = core.now();
        let mut slots = core.slots.borrow_mut();
        let fresh = slots.get(key).map(|slot| core.is_fresh(slot, now));
        match fresh {
            Some(true) => {
                let touched = core.next_touch();
                let slot = slots.get_mut(key)?;
                slot.access_count += 1;
                slot.read_at = now;
                slot.prior_idle = Duration::ZERO;
                slot.touched = touched;
                core.bump(|c| c.hits += 1);
                Some(slot.value.clone())
            }
            Some(false) => {
                slots.remove(key);
                core.bump(|c| c.misses += 1);
                None
            }
            None => {
                core.bump(|c| c.misses += 1);
                None
            }
        }
    }

    /// Whether `key` holds a fresh value. Does not count as a read.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let now = self.core.now();
        self.core
            .slots
            .borrow()
            .get(key)
            .is_some_and(|slot| self.core.is_fresh(slot, now))
    }

    /// Store `value` under `key`, replacing any previous value. Runs a
    /// cleanup when the cache grows past `max_size`. Returns `false` on a
    /// closed cache.
    pub fn set(&self, key: impl Into<String>, value: T) -> bool {
        let core = &self.core;
        if core.closed.get() {
            return false;
        }
        let now = core.now();
        let touched = core.next_touch();
        let len = {
            let mut slots = core.slots.borrow_mut();
            slots.insert(
                key.into(),
                Slot {
                    value,
                    stored_at: now,
                    prior_age: Duration::ZERO,
                    read_at: now,
                    prior_idle: Duration::ZERO,
                    access_count: 1,
                    touched,
                },
            );
            slots.len()
        };
        if len > core.config.max_size {
            core.cleanup();
        }
        core.ensure_cleanup_timer();
        true
    }

    /// Drop `key`. Returns `true` when it was present.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.core.slots.borrow_mut().remove(key).is_some();
        if removed {
            self.core.persist_or_warn();
        }
        removed
    }

    /// Drop every entry, in memory and in the store.
    pub fn clear(&self) {
        self.core.slots.borrow_mut().clear();
        self.core.persist_or_warn();
    }

    /// Drop expired entries, then the least recently read ones beyond
    /// `max_size`. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.core.cleanup()
    }

    /// Write fresh entries to the store now.
    pub fn flush(&self) -> Result<(), CacheStoreError> {
        self.core.persist()
    }

    /// Occupancy and counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let counters = self.core.counters.get();
        CacheStats {
            size: self.core.slots.borrow().len(),
            max_size: self.core.config.max_size,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            cleanups: counters.cleanups,
        }
    }

    /// Entries held, fresh or not yet cleaned up.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.slots.borrow().len()
    }

    /// Whether the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True until the cache is closed, replaced or its scope ends.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Save to the store, stop the cleanup and drop every entry.
    pub fn close(&self) -> Result<bool, TeardownError> {
        self.entry.remove()
    }
}

trait Trim {
    fn trim(&self) -> usize;
}

impl<T: Clone + 'static> Trim for CacheCore<T> {
    fn trim(&self) -> usize {
        if self.closed.get() {
            return 0;
        }
        self.cleanup()
    }
}

/// Creates and tracks the caches of one scope.
pub struct CacheManager {
    registry: Registry,
    trims: RefCell<Vec<Weak<dyn Trim>>>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("caches", &self.registry.active_count())
            .finish()
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    /// Manager with build-mode default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&LifecycleConfig::default())
    }

    /// Manager with an explicit config.
    #[must_use]
    pub fn with_config(config: &LifecycleConfig) -> Self {
        Self {
            registry: Registry::with_config(CACHE_CATEGORY, config),
            trims: RefCell::new(Vec::new()),
        }
    }

    /// In-memory cache `name`, aged and cleaned on `timers`.
    ///
    /// A cache already tracked under `name` is closed first.
    pub fn create_cache<T: Clone + 'static>(&self, timers: &TimerManager, name: &str, config: CacheConfig) -> Cache<T> {
        self.build(timers, name, config, None)
    }

    /// Like [`create_cache`](Self::create_cache), backed by `store`. The
    /// previous cache under `name` is saved before this one loads.
    pub fn create_persistent_cache<T: Clone + 'static>(
        &self,
        timers: &TimerManager,
        name: &str,
        config: CacheConfig,
        store: impl CacheStore<T> + 'static,
    ) -> Cache<T> {
        self.build(timers, name, config, Some(Box::new(store)))
    }

    fn build<T: Clone + 'static>(
        &self,
        timers: &TimerManager,
        name: &str,
        config: CacheConfig,
        store: Option<Box<dyn CacheStore<T>>>,
    ) -> Cache<T> {
        let name = ResourceId::from(name);
        let core = Rc::new(CacheCore {
            name: name.clone(),
            config,
            slots: RefCell::new(HashMap::new()),
            counters: Cell::new(Counters::default()),
            touch_seq: Cell::new(0),
            clock: timers.clock(),
            last_now: Cell::new(timers.now()),
            store,
            loaded: Cell::new(false),
            closed: Cell::new(false),
            cleanup_timer: RefCell::new(None),
            diag: Rc::clone(self.registry.diagnostics()),
        });

        let weak: Weak<CacheCore<T>> = Rc::downgrade(&core);
        let entry = self.registry.register(Some(name.clone()), move |cause| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            if core.diag.enabled() {
                tracing::debug!(cache = core.name.as_str(), cause = cause.as_str(), "lifescope: cache closed");
            }
            core.shut_down().map_err(|err| TeardownError::failed(err.to_string()))
        });

        if entry.is_active() {
            core.load();
            let weak = Rc::downgrade(&core);
            let timer = timers.create_interval(
                move || {
                    if let Some(core) = weak.upgrade() {
                        core.cleanup();
                    }
                },
                config.cleanup_interval,
                Some(ResourceId::from(format!("{CACHE_CATEGORY}:{name}"))),
            );
            *core.cleanup_timer.borrow_mut() = Some(timer);
            let trim: Rc<dyn Trim> = core.clone();
            let mut trims = self.trims.borrow_mut();
            trims.retain(|t| t.strong_count() > 0);
            trims.push(Rc::downgrade(&trim));
        }

        Cache { core, entry }
    }

    /// Run a cleanup on every open cache. Returns the entries dropped.
    pub fn cleanup_all(&self) -> usize {
        let live: Vec<Rc<dyn Trim>> = self.trims.borrow().iter().filter_map(Weak::upgrade).collect();
        live.iter().map(|cache| cache.trim()).sum()
    }

    /// Close the cache tracked under `name`.
    pub fn remove_cache(&self, name: &str) -> bool {
        matches!(self.registry.remove(&ResourceId::from(name)), Ok(true))
    }

    /// Close every cache.
    pub fn remove_all(&self) -> TeardownReport {
        self.registry.remove_all()
    }

    /// Close every cache and refuse new ones. `Drop` does the same.
    pub fn close(&self) -> TeardownReport {
        self.registry.close()
    }

    /// Number of open caches.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Names of open caches.
    #[must_use]
    pub fn names(&self) -> Vec<ResourceId> {
        self.registry.ids()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let report = self.close();
        if !report.is_clean() {
            tracing::warn!(
                failures = report.failures.len(),
                "lifescope: cache teardown failures at scope end"
            );
        }
    }
}
