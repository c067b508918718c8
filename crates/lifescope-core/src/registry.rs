#![forbid(unsafe_code)]

//! Scoped registry of teardown actions.
//!
//! # Design
//!
//! A [`Registry`] maps [`ResourceId`]s to not-yet-executed teardown actions.
//! It is owned by exactly one scope (a mounted component, a hook instance)
//! and is neither `Clone` nor `Send`. Dropping it ends the scope: every
//! remaining teardown runs once and further registrations are refused.
//!
//! Handles returned by [`Registry::register`] hold a weak reference back to
//! the registry plus the token of the entry they were issued for, so a stale
//! handle can never tear down a newer entry that reused its id.
//!
//! # Invariants
//!
//! 1. A stored id always maps to a teardown that has not run.
//! 2. An entry leaves the map *before* its teardown runs. Teardowns may call
//!    back into the registry.
//! 3. Registering under a stored id runs the old teardown to completion before
//!    the new entry becomes visible.
//! 4. Every teardown runs at most once. A teardown that fails (returns `Err`
//!    or panics) still counts as run and its entry stays removed.
//! 5. [`Registry::close`] runs at most once; `Drop` calls it.
//!
//! # Failure Modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | Teardown returns `Err` | Logged at `warn`, counted, collected in the report |
//! | Teardown panics | Caught, same as `Err` (requires `panic = "unwind"`) |
//! | Register after close | New teardown runs immediately, handle is inactive |
//! | Teardown re-registers its own id while being replaced | Nested entry is torn down at once |
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use lifescope_core::registry::Registry;
//!
//! let fired = Rc::new(Cell::new(0));
//! let registry = Registry::new("listener");
//! let f = Rc::clone(&fired);
//! let handle = registry.register_fn(Some("resize".into()), move || f.set(f.get() + 1));
//! assert!(handle.is_active());
//!
//! drop(registry);
//! assert_eq!(fired.get(), 1);
//! assert!(!handle.is_active());
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::config::LifecycleConfig;
use crate::diagnostics::{Diagnostics, LifecycleEventKind};
use crate::error::{TeardownError, TeardownReport};
use crate::id::{IdGenerator, ResourceId};

/// Why a teardown is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownCause {
    /// Removed through its handle or by id.
    Removed,
    /// A newer entry was registered under the same id.
    Replaced,
    /// Bulk removal ([`Registry::remove_all`]).
    Cleared,
    /// The owning scope ended.
    ScopeEnded,
}

impl TeardownCause {
    /// Stable name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Replaced => "replaced",
            Self::Cleared => "cleared",
            Self::ScopeEnded => "scope_ended",
        }
    }
}

/// Boxed teardown action.
pub type TeardownFn = Box<dyn FnOnce(TeardownCause) -> Result<(), TeardownError>>;

type PreemptHook = Box<dyn FnMut(&ResourceId)>;

/// Counters kept for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Entries installed.
    pub registered: u64,
    /// Entries torn down because their id was reused.
    pub replaced: u64,
    /// Entries torn down individually or in bulk.
    pub removed: u64,
    /// Entries dropped without teardown.
    pub released: u64,
    /// Teardowns that failed.
    pub failed: u64,
}

struct Entry {
    token: u64,
    teardown: TeardownFn,
}

struct State {
    entries: HashMap<ResourceId, Entry>,
    ids: IdGenerator,
    next_token: u64,
    closed: bool,
    replacing: HashSet<ResourceId>,
    stats: RegistryStats,
}

struct Shared {
    state: RefCell<State>,
    preempt: RefCell<Option<PreemptHook>>,
    diag: Rc<Diagnostics>,
}

impl Shared {
    fn active_count(&self) -> usize {
        self.state.borrow().entries.len()
    }

    fn take(&self, id: &ResourceId, token: Option<u64>) -> Option<TeardownFn> {
        let mut state = self.state.borrow_mut();
        match state.entries.get(id) {
            Some(entry) if token.is_none_or(|t| t == entry.token) => {}
            _ => return None,
        }
        state.entries.remove(id).map(|entry| entry.teardown)
    }

    fn run(
        &self,
        id: &ResourceId,
        teardown: TeardownFn,
        cause: TeardownCause,
    ) -> Result<(), TeardownError> {
        let result = match catch_unwind(AssertUnwindSafe(|| teardown(cause))) {
            Ok(result) => result.map_err(|err| err.with_id(id.clone())),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("non-string panic payload"));
                Err(TeardownError::panicked(id.clone(), message))
            }
        };
        if let Err(err) = &result {
            self.state.borrow_mut().stats.failed += 1;
            tracing::warn!(
                category = self.diag.category(),
                id = id.as_str(),
                cause = cause.as_str(),
                error = %err,
                "lifescope: teardown failed, entry removed"
            );
            self.diag.emit(
                LifecycleEventKind::TeardownFailed,
                Some(id),
                Some(&err.to_string()),
                self.active_count(),
            );
        }
        result
    }

    fn remove(
        &self,
        id: &ResourceId,
        token: Option<u64>,
        cause: TeardownCause,
    ) -> Result<bool, TeardownError> {
        let Some(teardown) = self.take(id, token) else {
            return Ok(false);
        };
        self.state.borrow_mut().stats.removed += 1;
        let result = self.run(id, teardown, cause);
        self.diag.emit(
            LifecycleEventKind::Removed,
            Some(id),
            Some(cause.as_str()),
            self.active_count(),
        );
        result.map(|()| true)
    }

    fn release(&self, id: &ResourceId, token: u64) -> bool {
        // Dropped outside the borrow: a teardown closure may own values whose
        // own Drop reaches back into this registry.
        let Some(teardown) = self.take(id, Some(token)) else {
            return false;
        };
        drop(teardown);
        self.state.borrow_mut().stats.released += 1;
        self.diag.emit(
            LifecycleEventKind::Released,
            Some(id),
            None,
            self.active_count(),
        );
        true
    }

    fn sweep(&self, cause: TeardownCause) -> TeardownReport {
        let drained: Vec<(ResourceId, Entry)> = {
            let mut state = self.state.borrow_mut();
            let drained: Vec<_> = state.entries.drain().collect();
            state.stats.removed += drained.len() as u64;
            drained
        };
        let mut report = TeardownReport {
            attempted: drained.len(),
            failures: Vec::new(),
        };
        for (id, entry) in drained {
            if let Err(err) = self.run(&id, entry.teardown, cause) {
                report.failures.push(err);
            }
        }
        report
    }

    fn notify_preempted(&self, id: &ResourceId) {
        let hook = self.preempt.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook(id);
            let mut slot = self.preempt.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }
}

/// Scope-owned registry of teardown actions. See the [module docs](self).
pub struct Registry {
    shared: Rc<Shared>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Registry")
            .field("category", &state.ids.category())
            .field("active", &state.entries.len())
            .field("closed", &state.closed)
            .field("stats", &state.stats)
            .finish()
    }
}

impl Registry {
    /// Create a registry with build-mode default config.
    ///
    /// `category` prefixes synthesized ids and tags diagnostics.
    #[must_use]
    pub fn new(category: &str) -> Self {
        Self::with_config(category, &LifecycleConfig::default())
    }

    /// Create a registry with an explicit config.
    #[must_use]
    pub fn with_config(category: &str, config: &LifecycleConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(State {
                    entries: HashMap::new(),
                    ids: IdGenerator::new(category),
                    next_token: 0,
                    closed: false,
                    replacing: HashSet::new(),
                    stats: RegistryStats::default(),
                }),
                preempt: RefCell::new(None),
                diag: Rc::new(Diagnostics::new(category, config)),
            }),
        }
    }

    /// Category tag of this registry.
    #[must_use]
    pub fn category(&self) -> &str {
        self.shared.diag.category()
    }

    /// Diagnostics emitter shared with specializations built on this registry.
    #[must_use]
    pub fn diagnostics(&self) -> &Rc<Diagnostics> {
        &self.shared.diag
    }

    /// Synthesize a fresh id that is not currently stored.
    pub fn next_id(&self) -> ResourceId {
        let mut state = self.shared.state.borrow_mut();
        loop {
            let id = state.ids.next_id();
            if !state.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Like [`next_id`](Self::next_id), prefixed with `prefix` instead of
    /// the registry category.
    pub fn next_id_with_prefix(&self, prefix: &str) -> ResourceId {
        let mut state = self.shared.state.borrow_mut();
        loop {
            let id = state.ids.next_id_with_prefix(prefix);
            if !state.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store `teardown` under `id` (synthesized when `None`).
    ///
    /// An entry already stored under `id` is torn down first with
    /// [`TeardownCause::Replaced`]. A failure of that teardown is logged and
    /// does not prevent the new entry from being installed.
    pub fn register<F>(&self, id: Option<ResourceId>, teardown: F) -> EntryHandle
    where
        F: FnOnce(TeardownCause) -> Result<(), TeardownError> + 'static,
    {
        let shared = &self.shared;
        let id = match id {
            Some(id) => id,
            None => self.next_id(),
        };
        let teardown: TeardownFn = Box::new(teardown);

        let refused = {
            let state = shared.state.borrow();
            state.closed || state.replacing.contains(&id)
        };
        if refused {
            let cause = if shared.state.borrow().closed {
                TeardownCause::ScopeEnded
            } else {
                TeardownCause::Replaced
            };
            tracing::debug!(
                category = shared.diag.category(),
                id = id.as_str(),
                cause = cause.as_str(),
                "lifescope: registration refused, tearing down"
            );
            // Failure is already logged inside `run`.
            let _ = shared.run(&id, teardown, cause);
            return EntryHandle::detached(id);
        }

        let previous = shared.take(&id, None);
        if let Some(previous) = previous {
            shared.state.borrow_mut().replacing.insert(id.clone());
            let _ = shared.run(&id, previous, TeardownCause::Replaced);
            {
                let mut state = shared.state.borrow_mut();
                state.replacing.remove(&id);
                state.stats.replaced += 1;
            }
            shared.diag.emit(
                LifecycleEventKind::Replaced,
                Some(&id),
                None,
                shared.active_count(),
            );
            shared.notify_preempted(&id);
        }

        let token = {
            let mut state = shared.state.borrow_mut();
            if state.closed {
                // The replaced teardown closed the scope.
                drop(state);
                let _ = shared.run(&id, teardown, TeardownCause::ScopeEnded);
                return EntryHandle::detached(id);
            }
            state.next_token += 1;
            let token = state.next_token;
            state.entries.insert(id.clone(), Entry { token, teardown });
            state.stats.registered += 1;
            token
        };
        shared.diag.emit(
            LifecycleEventKind::Registered,
            Some(&id),
            None,
            shared.active_count(),
        );

        EntryHandle {
            id,
            token,
            shared: Rc::downgrade(shared),
        }
    }

    /// Infallible convenience over [`register`](Self::register).
    pub fn register_fn(&self, id: Option<ResourceId>, teardown: impl FnOnce() + 'static) -> EntryHandle {
        self.register(id, move |_cause| {
            teardown();
            Ok(())
        })
    }

    /// Tear down the entry stored under `id`, whichever handle owns it.
    ///
    /// Returns `Ok(false)` when nothing was stored.
    pub fn remove(&self, id: &ResourceId) -> Result<bool, TeardownError> {
        self.shared.remove(id, None, TeardownCause::Removed)
    }

    /// Drop the handle's entry without running its teardown.
    ///
    /// For resources that already finished on their own. Returns `false` if
    /// the entry is gone or was replaced.
    pub fn release(&self, handle: &EntryHandle) -> bool {
        handle.release()
    }

    /// Run every stored teardown once and clear the registry.
    ///
    /// Failures are isolated per entry and reported, never propagated.
    pub fn remove_all(&self) -> TeardownReport {
        let report = self.shared.sweep(TeardownCause::Cleared);
        if report.attempted > 0 {
            self.shared.diag.emit(
                LifecycleEventKind::Cleared,
                None,
                Some(&format!("{} torn down", report.attempted)),
                self.shared.active_count(),
            );
        }
        report
    }

    /// End the scope: tear down everything and refuse new entries.
    ///
    /// Only the first call does work.
    pub fn close(&self) -> TeardownReport {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                return TeardownReport::default();
            }
            state.closed = true;
        }
        let report = self.shared.sweep(TeardownCause::ScopeEnded);
        self.shared.diag.emit(
            LifecycleEventKind::Closed,
            None,
            Some(&format!("{} torn down", report.attempted)),
            self.shared.active_count(),
        );
        report
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().closed
    }

    /// Number of live entries.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active_count()
    }

    /// Whether an entry is stored under `id`.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.shared.state.borrow().entries.contains_key(id)
    }

    /// Ids of live entries, in no particular order.
    #[must_use]
    pub fn ids(&self) -> Vec<ResourceId> {
        self.shared.state.borrow().entries.keys().cloned().collect()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.shared.state.borrow().stats
    }

    /// Call `hook` whenever a registration preempts an existing entry.
    pub fn set_preempt_hook(&self, hook: impl FnMut(&ResourceId) + 'static) {
        *self.shared.preempt.borrow_mut() = Some(Box::new(hook));
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let report = self.close();
        if !report.is_clean() {
            tracing::warn!(
                category = self.category(),
                failures = report.failures.len(),
                "lifescope: scope ended with failed teardowns"
            );
        }
    }
}

/// Caller-side token for one registry entry.
///
/// Cloning yields another token for the same entry.
#[derive(Clone)]
pub struct EntryHandle {
    id: ResourceId,
    token: u64,
    shared: Weak<Shared>,
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl EntryHandle {
    /// Handle that refers to no entry.
    fn detached(id: ResourceId) -> Self {
        Self {
            id,
            token: 0,
            shared: Weak::new(),
        }
    }

    /// Id this handle was issued for.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// True while this handle's entry is stored.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            shared
                .state
                .borrow()
                .entries
                .get(&self.id)
                .is_some_and(|entry| entry.token == self.token)
        })
    }

    /// Tear down this handle's entry. Repeated calls are no-ops.
    ///
    /// Returns `Ok(true)` when this call ran the teardown.
    pub fn remove(&self) -> Result<bool, TeardownError> {
        match self.shared.upgrade() {
            Some(shared) => shared.remove(&self.id, Some(self.token), TeardownCause::Removed),
            None => Ok(false),
        }
    }

    /// Drop this handle's entry without running its teardown.
    pub fn release(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.release(&self.id, self.token))
    }
}
