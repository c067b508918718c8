#![forbid(unsafe_code)]

//! One component's bundle of managed resources.
//!
//! A [`ResourceScope`] is mounted with its owner and unmounted with it. It
//! owns one [`RequestManager`], one [`ListenerManager`], one [`TimerManager`]
//! and one [`CacheManager`]; ending the scope closes each exactly once:
//! timers, listeners, requests, then caches, which save to their stores.
//!
//! Every manager of a scope writes diagnostics through one shared sink.
//!
//! # Memory Pressure
//!
//! | Level | Action |
//! |-------|--------|
//! | `Normal` | none |
//! | `High` | forced cleanup when `cleanup_on_high_pressure` is set |
//! | `Critical` | forced cleanup |
//!
//! A forced cleanup tears down timers, listeners and requests but leaves the
//! scope mounted. Caches are trimmed to their fresh entries, not closed; their
//! periodic cleanup re-arms on the next `set`.

use std::cell::Cell;

use lifescope_core::diagnostics::{Diagnostics, LifecycleEventKind};
use lifescope_core::{LifecycleConfig, TeardownReport};

use crate::cache::{Cache, CacheConfig, CacheManager, CacheStore};
use crate::listener::ListenerManager;
use crate::request::RequestManager;
use crate::timer::TimerManager;

/// Diagnostics category for scope-level events.
pub const SCOPE_CATEGORY: &str = "scope";

/// Host-reported memory pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryPressure {
    /// Nothing to do.
    #[default]
    Normal,
    /// Usage is high.
    High,
    /// Usage is critical.
    Critical,
}

impl MemoryPressure {
    /// Classify a heap usage ratio (`used / limit`).
    ///
    /// Above 0.9 is critical, above 0.7 is high. Non-finite ratios are
    /// treated as normal.
    #[must_use]
    pub fn from_usage_ratio(ratio: f64) -> Self {
        if !ratio.is_finite() {
            return Self::Normal;
        }
        if ratio > 0.9 {
            Self::Critical
        } else if ratio > 0.7 {
            Self::High
        } else {
            Self::Normal
        }
    }

    /// Stable name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Live resources per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    /// Timeouts plus intervals.
    pub timers: usize,
    /// Attached listeners.
    pub listeners: usize,
    /// Registered requests.
    pub requests: usize,
    /// Open caches.
    pub caches: usize,
}

impl ResourceCounts {
    /// Sum across kinds.
    #[must_use]
    pub fn total(&self) -> usize {
        self.timers + self.listeners + self.requests + self.caches
    }
}

/// Requests, listeners, timers and caches owned by one mounted component.
#[derive(Debug)]
pub struct ResourceScope {
    name: String,
    config: LifecycleConfig,
    requests: RequestManager,
    listeners: ListenerManager,
    timers: TimerManager,
    caches: CacheManager,
    diag: Diagnostics,
    ended: Cell<bool>,
}

impl ResourceScope {
    /// Mount a scope with config from the environment.
    #[must_use]
    pub fn mount(name: &str) -> Self {
        Self::mount_with_config(name, LifecycleConfig::from_env())
    }

    /// Mount a scope with an explicit config. The configured sink is
    /// opened once and shared by every manager of the scope.
    #[must_use]
    pub fn mount_with_config(name: &str, config: LifecycleConfig) -> Self {
        let config = config.share_sink();
        let scope = Self {
            name: name.to_owned(),
            requests: RequestManager::with_config(&config),
            listeners: ListenerManager::with_config(&config),
            timers: TimerManager::with_config(&config),
            caches: CacheManager::with_config(&config),
            diag: Diagnostics::new(SCOPE_CATEGORY, &config),
            config,
            ended: Cell::new(false),
        };
        if scope.diag.enabled() {
            tracing::debug!(scope = %scope.name, "lifescope: scope mounted");
        }
        scope
    }

    /// Scope name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Config the scope was mounted with.
    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Request manager.
    #[must_use]
    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    /// Listener manager.
    #[must_use]
    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    /// Timer manager.
    #[must_use]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Cache manager.
    #[must_use]
    pub fn caches(&self) -> &CacheManager {
        &self.caches
    }

    /// In-memory cache cleaned on this scope's timers.
    pub fn create_cache<T: Clone + 'static>(&self, name: &str, config: CacheConfig) -> Cache<T> {
        self.caches.create_cache(&self.timers, name, config)
    }

    /// Cache backed by `store`, saved when the scope ends.
    pub fn create_persistent_cache<T: Clone + 'static>(
        &self,
        name: &str,
        config: CacheConfig,
        store: impl CacheStore<T> + 'static,
    ) -> Cache<T> {
        self.caches
            .create_persistent_cache(&self.timers, name, config, store)
    }

    /// Whether the scope has been unmounted.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.get()
    }

    /// Clear timers, remove listeners and cancel requests. The scope stays
    /// mounted and accepts new resources afterwards. Open caches stay open
    /// and drop their expired and over-limit entries.
    pub fn force_cleanup(&self) -> TeardownReport {
        let before = self.active_resource_counts();
        let mut report = self.timers.clear_all();
        report.merge(self.listeners.remove_all());
        report.merge(self.requests.cancel_all());
        let trimmed = self.caches.cleanup_all();

        let detail = format!(
            "timers={} listeners={} requests={} cache_entries={} failures={}",
            before.timers,
            before.listeners,
            before.requests,
            trimmed,
            report.failures.len()
        );
        self.diag
            .emit(LifecycleEventKind::ForcedCleanup, None, Some(&detail), 0);
        if !report.is_clean() {
            tracing::warn!(
                scope = %self.name,
                failures = report.failures.len(),
                "lifescope: forced cleanup finished with failures"
            );
        }
        report
    }

    /// Live resources per kind.
    #[must_use]
    pub fn active_resource_counts(&self) -> ResourceCounts {
        ResourceCounts {
            timers: self.timers.counts().total,
            listeners: self.listeners.active_count(),
            requests: self.requests.counts().requests,
            caches: self.caches.active_count(),
        }
    }

    /// React to host memory pressure. Returns the cleanup report when a
    /// cleanup ran.
    pub fn report_pressure(&self, pressure: MemoryPressure) -> Option<TeardownReport> {
        let cleanup = match pressure {
            MemoryPressure::Normal => false,
            MemoryPressure::High => self.config.cleanup_on_high_pressure,
            MemoryPressure::Critical => true,
        };
        if !cleanup {
            return None;
        }
        if pressure == MemoryPressure::Critical {
            tracing::warn!(scope = %self.name, "lifescope: critical memory pressure, forcing cleanup");
        } else if self.diag.enabled() {
            tracing::debug!(
                scope = %self.name,
                pressure = pressure.as_str(),
                "lifescope: memory pressure, forcing cleanup"
            );
        }
        Some(self.force_cleanup())
    }

    /// End the scope and return what its teardowns reported.
    pub fn unmount(self) -> TeardownReport {
        self.end()
    }

    fn end(&self) -> TeardownReport {
        if self.ended.replace(true) {
            return TeardownReport::default();
        }
        let mut report = self.timers.close();
        report.merge(self.listeners.close());
        report.merge(self.requests.close());
        report.merge(self.caches.close());
        if self.diag.enabled() {
            tracing::debug!(
                scope = %self.name,
                attempted = report.attempted,
                failures = report.failures.len(),
                "lifescope: scope unmounted"
            );
        }
        report
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        let report = self.end();
        if !report.is_clean() {
            tracing::warn!(
                scope = %self.name,
                failures = report.failures.len(),
                "lifescope: teardown failures at unmount"
            );
        }
    }
}
