#![forbid(unsafe_code)]

//! Timeouts and intervals bound to a scope, driven by a host clock.
//!
//! The manager never reads a clock of its own. The host calls
//! [`TimerManager::advance_to`] with its current time (frame time, tick
//! count, `Instant` offset) and every timer due by then fires in due order.
//! Timeouts and intervals live in separate registries, so the same id can
//! name one of each.
//!
//! Callbacks may create, clear or restart timers, including themselves;
//! no borrow is held while a callback runs.
//!
//! An interval that falls behind fires once per elapsed period, up to
//! [`MAX_CATCH_UP`] times in one advance; past that, the missed periods are
//! skipped and the interval resumes at the first period boundary after the
//! new clock value. An interval whose next due time does not fit in a
//! `Duration` stays registered but never fires again.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use lifescope_core::diagnostics::LifecycleEventKind;
use lifescope_core::{EntryHandle, LifecycleConfig, Registry, ResourceId, TeardownReport};

/// Registry category for timeouts.
pub const TIMEOUT_CATEGORY: &str = "timeout";
/// Registry category for intervals.
pub const INTERVAL_CATEGORY: &str = "interval";

/// Shortest interval period.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Most times one interval fires within a single advance.
pub const MAX_CATCH_UP: u32 = 64;

const NANOS_PER_SEC: u128 = 1_000_000_000;

type TimerCallback = Rc<RefCell<dyn FnMut()>>;

/// Timeout or interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires once.
    Timeout,
    /// Fires every period until cleared.
    Interval,
}

/// Live timer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerCounts {
    /// Pending timeouts.
    pub timeouts: usize,
    /// Running intervals.
    pub intervals: usize,
    /// Sum of both.
    pub total: usize,
}

struct Slot {
    id: ResourceId,
    kind: TimerKind,
    due: Duration,
    period: Duration,
    callback: TimerCallback,
    entry: EntryHandle,
    /// Fires within the current advance.
    burst: u32,
    /// Next due time overflowed; never fires again.
    parked: bool,
}

fn duration_from_nanos(nanos: u128) -> Option<Duration> {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
    let subsec = u32::try_from(nanos % NANOS_PER_SEC).ok()?;
    Some(Duration::new(secs, subsec))
}

/// Due time after an interval fired at `due`. Once the burst limit is hit,
/// jumps to the first period boundary past `limit`. `None` on overflow.
fn next_due(due: Duration, period: Duration, burst: u32, limit: Duration) -> Option<Duration> {
    let next = due.checked_add(period)?;
    if burst < MAX_CATCH_UP || next > limit {
        return Some(next);
    }
    let period = period.as_nanos().max(1);
    let skipped = (limit - due).as_nanos() / period + 1;
    let nanos = due.as_nanos().checked_add(period.checked_mul(skipped)?)?;
    duration_from_nanos(nanos)
}

struct TimerCore {
    timeouts: Registry,
    intervals: Registry,
    slots: RefCell<BTreeMap<u64, Slot>>,
    now: Cell<Duration>,
    next_serial: Cell<u64>,
}

impl TimerCore {
    fn registry(&self, kind: TimerKind) -> &Registry {
        match kind {
            TimerKind::Timeout => &self.timeouts,
            TimerKind::Interval => &self.intervals,
        }
    }

    fn schedule(
        self: &Rc<Self>,
        kind: TimerKind,
        callback: TimerCallback,
        delay: Duration,
        id: Option<ResourceId>,
    ) -> TimerHandle {
        let delay = match kind {
            TimerKind::Timeout => delay,
            TimerKind::Interval => delay.max(MIN_PERIOD),
        };
        let registry = self.registry(kind);
        let id = id.unwrap_or_else(|| registry.next_id());
        let serial = self.next_serial.get() + 1;
        self.next_serial.set(serial);

        let core = Rc::downgrade(self);
        let clear_id = id.clone();
        let entry = registry.register(Some(id.clone()), move |cause| {
            if let Some(core) = core.upgrade() {
                core.slots.borrow_mut().remove(&serial);
                core.registry(kind).diagnostics().emit(
                    LifecycleEventKind::TimerCleared,
                    Some(&clear_id),
                    Some(cause.as_str()),
                    0,
                );
            }
            Ok(())
        });

        if entry.is_active() {
            self.slots.borrow_mut().insert(
                serial,
                Slot {
                    id: id.clone(),
                    kind,
                    due: self.now.get().saturating_add(delay),
                    period: delay,
                    callback: Rc::clone(&callback),
                    entry: entry.clone(),
                    burst: 0,
                    parked: false,
                },
            );
            registry.diagnostics().emit(
                LifecycleEventKind::TimerCreated,
                Some(&id),
                Some(&format!("{}ms", delay.as_millis())),
                registry.active_count(),
            );
        }

        TimerHandle {
            entry,
            kind,
            delay,
            callback,
            core: Rc::downgrade(self),
        }
    }

    /// Fire the earliest timer due at or before `limit`, if any.
    fn fire_next(&self, limit: Duration) -> bool {
        let (callback, id, kind) = {
            let mut slots = self.slots.borrow_mut();
            let Some(serial) = slots
                .iter()
                .filter(|(_, slot)| !slot.parked && slot.due <= limit)
                .min_by_key(|(serial, slot)| (slot.due, **serial))
                .map(|(serial, _)| *serial)
            else {
                return false;
            };
            let Some(slot) = slots.get_mut(&serial) else {
                return false;
            };
            self.now.set(self.now.get().max(slot.due));
            let kind = slot.kind;
            let fired = (Rc::clone(&slot.callback), slot.id.clone(), kind);
            if kind == TimerKind::Interval {
                slot.burst += 1;
                match next_due(slot.due, slot.period, slot.burst, limit) {
                    Some(due) => slot.due = due,
                    None => {
                        slot.parked = true;
                        tracing::debug!(
                            id = slot.id.as_str(),
                            "lifescope: interval due time overflowed, parked"
                        );
                    }
                }
            } else if let Some(done) = slots.remove(&serial) {
                done.entry.release();
            }
            fired
        };

        let registry = self.registry(kind);
        registry.diagnostics().emit(
            LifecycleEventKind::TimerFired,
            Some(&id),
            None,
            registry.active_count(),
        );
        match callback.try_borrow_mut() {
            Ok(mut run) => (&mut *run)(),
            Err(_) => tracing::debug!(
                id = id.as_str(),
                "lifescope: timer callback still running, skipped nested fire"
            ),
        }
        true
    }
}

/// Caller handle for one timer.
pub struct TimerHandle {
    entry: EntryHandle,
    kind: TimerKind,
    delay: Duration,
    callback: TimerCallback,
    core: Weak<TimerCore>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", self.entry.id())
            .field("kind", &self.kind)
            .field("delay", &self.delay)
            .field("active", &self.is_active())
            .finish()
    }
}

impl TimerHandle {
    /// Timer id.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        self.entry.id()
    }

    /// Timeout or interval.
    #[must_use]
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Delay (timeout) or period (interval).
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// True until the timer is cleared, replaced, or (for a timeout) fired.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Stop the timer. Returns `true` when this call cleared it.
    pub fn clear(&self) -> bool {
        matches!(self.entry.remove(), Ok(true))
    }

    /// Clear the timer and schedule it again from the current time, under
    /// the same id and with the same callback. `delay` overrides the stored
    /// delay when given. A fired timeout can be restarted.
    ///
    /// Returns `false` when the owning manager is gone or closed.
    pub fn restart(&mut self, delay: Option<Duration>) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        self.clear();
        let next = core.schedule(
            self.kind,
            Rc::clone(&self.callback),
            delay.unwrap_or(self.delay),
            Some(self.entry.id().clone()),
        );
        let active = next.is_active();
        *self = next;
        active
    }
}

/// Read-only view of a manager's clock.
#[derive(Debug, Clone)]
pub struct TimerClock {
    core: Weak<TimerCore>,
}

impl TimerClock {
    /// Current clock value, or `None` once the manager is gone.
    #[must_use]
    pub fn now(&self) -> Option<Duration> {
        self.core.upgrade().map(|core| core.now.get())
    }
}

struct DebounceState<T> {
    settled: RefCell<T>,
    pending: RefCell<Option<T>>,
}

/// A value that settles `delay` after the last [`set`](Self::set).
///
/// Each `set` restarts the wait. The settled value only changes when the
/// timeout fires, so a burst of updates settles once, on the last value.
/// A value still pending when the scope ends never settles.
pub struct Debounced<T> {
    state: Rc<DebounceState<T>>,
    delay: Duration,
    core: Weak<TimerCore>,
    timer: Option<TimerHandle>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Debounced<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debounced")
            .field("settled", &self.state.settled.borrow())
            .field("pending", &self.state.pending.borrow())
            .field("delay", &self.delay)
            .finish()
    }
}

impl<T: Clone + 'static> Debounced<T> {
    /// Latest settled value.
    #[must_use]
    pub fn get(&self) -> T {
        self.state.settled.borrow().clone()
    }

    /// Whether a value is waiting to settle.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.pending.borrow().is_some()
    }

    /// Queue `value` and restart the wait. Returns `false` when the timer
    /// manager is gone or closed; the value is then dropped.
    pub fn set(&mut self, value: T) -> bool {
        *self.state.pending.borrow_mut() = Some(value);
        let armed = if let Some(timer) = self.timer.as_mut() {
            timer.restart(Some(self.delay))
        } else if let Some(core) = self.core.upgrade() {
            let state = Rc::downgrade(&self.state);
            let settle = move || {
                if let Some(state) = state.upgrade() {
                    if let Some(value) = state.pending.borrow_mut().take() {
                        *state.settled.borrow_mut() = value;
                    }
                }
            };
            let timer = core.schedule(TimerKind::Timeout, Rc::new(RefCell::new(settle)), self.delay, None);
            let active = timer.is_active();
            self.timer = Some(timer);
            active
        } else {
            false
        };
        if !armed {
            self.state.pending.borrow_mut().take();
        }
        armed
    }

    /// Drop the pending value, if any, and stop the wait.
    pub fn cancel(&mut self) -> bool {
        if let Some(timer) = &self.timer {
            timer.clear();
        }
        self.state.pending.borrow_mut().take().is_some()
    }
}

/// Creates and tracks the timers of one scope.
pub struct TimerManager {
    core: Rc<TimerCore>,
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("now", &self.core.now.get())
            .field("counts", &self.counts())
            .finish()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    /// Manager with build-mode default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&LifecycleConfig::default())
    }

    /// Manager with an explicit config.
    #[must_use]
    pub fn with_config(config: &LifecycleConfig) -> Self {
        Self {
            core: Rc::new(TimerCore {
                timeouts: Registry::with_config(TIMEOUT_CATEGORY, config),
                intervals: Registry::with_config(INTERVAL_CATEGORY, config),
                slots: RefCell::new(BTreeMap::new()),
                now: Cell::new(Duration::ZERO),
                next_serial: Cell::new(0),
            }),
        }
    }

    /// Run `callback` once, `delay` after the current time.
    pub fn create_timeout(
        &self,
        callback: impl FnMut() + 'static,
        delay: Duration,
        id: Option<ResourceId>,
    ) -> TimerHandle {
        self.core
            .schedule(TimerKind::Timeout, Rc::new(RefCell::new(callback)), delay, id)
    }

    /// Run `callback` every `period`, starting one period from now.
    pub fn create_interval(
        &self,
        callback: impl FnMut() + 'static,
        period: Duration,
        id: Option<ResourceId>,
    ) -> TimerHandle {
        self.core
            .schedule(TimerKind::Interval, Rc::new(RefCell::new(callback)), period, id)
    }

    /// Value that settles `delay` after its last update, starting at
    /// `initial`.
    pub fn debounce<T: Clone + 'static>(&self, initial: T, delay: Duration) -> Debounced<T> {
        Debounced {
            state: Rc::new(DebounceState {
                settled: RefCell::new(initial),
                pending: RefCell::new(None),
            }),
            delay,
            core: Rc::downgrade(&self.core),
            timer: None,
        }
    }

    /// Clear the timeout stored under `id`.
    pub fn clear_timeout(&self, id: &ResourceId) -> bool {
        matches!(self.core.timeouts.remove(id), Ok(true))
    }

    /// Clear the interval stored under `id`.
    pub fn clear_interval(&self, id: &ResourceId) -> bool {
        matches!(self.core.intervals.remove(id), Ok(true))
    }

    /// Move the clock to `now` and fire every timer due by then.
    ///
    /// Timers fire in due order; an interval that falls several periods
    /// behind fires once per elapsed period, at most [`MAX_CATCH_UP`] times.
    /// Going backwards is a no-op. Returns the number of callbacks run.
    pub fn advance_to(&self, now: Duration) -> usize {
        if now < self.core.now.get() {
            return 0;
        }
        let _span = tracing::debug_span!("lifescope.timers.advance", now_ms = now.as_millis() as u64)
            .entered();
        for slot in self.core.slots.borrow_mut().values_mut() {
            slot.burst = 0;
        }
        let mut fired = 0;
        while self.core.fire_next(now) {
            fired += 1;
        }
        self.core.now.set(now);
        fired
    }

    /// Advance the clock by `elapsed`.
    pub fn advance_by(&self, elapsed: Duration) -> usize {
        self.advance_to(self.core.now.get().saturating_add(elapsed))
    }

    /// Current clock value.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.core.now.get()
    }

    /// Clock view that does not keep the manager alive.
    #[must_use]
    pub fn clock(&self) -> TimerClock {
        TimerClock {
            core: Rc::downgrade(&self.core),
        }
    }

    /// Clear every timer.
    pub fn clear_all(&self) -> TeardownReport {
        let mut report = self.core.timeouts.remove_all();
        report.merge(self.core.intervals.remove_all());
        report
    }

    /// Clear every timer and refuse new ones. `Drop` does the same.
    pub fn close(&self) -> TeardownReport {
        let mut report = self.core.timeouts.close();
        report.merge(self.core.intervals.close());
        report
    }

    /// Pending timeout and interval counts.
    #[must_use]
    pub fn counts(&self) -> TimerCounts {
        let timeouts = self.core.timeouts.active_count();
        let intervals = self.core.intervals.active_count();
        TimerCounts {
            timeouts,
            intervals,
            total: timeouts + intervals,
        }
    }

    /// Number of live timers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.counts().total
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        let report = self.close();
        if !report.is_clean() {
            tracing::warn!(
                failures = report.failures.len(),
                "lifescope: timer teardown failures at scope end"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> TimerManager {
        TimerManager::with_config(&LifecycleConfig::quiet())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnMut() + 'static) {
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        (hits, move || h.set(h.get() + 1))
    }

    #[test]
    fn timeout_fires_once_and_leaves() {
        let timers = timers();
        let (hits, cb) = counter();
        let handle = timers.create_timeout(cb, ms(100), None);
        assert!(handle.id().as_str().starts_with("timeout_"));
        assert_eq!(timers.advance_to(ms(99)), 0);
        assert!(handle.is_active());
        assert_eq!(timers.advance_to(ms(100)), 1);
        assert_eq!(hits.get(), 1);
        assert!(!handle.is_active());
        assert_eq!(timers.advance_to(ms(500)), 0);
        assert_eq!(timers.counts(), TimerCounts::default());
    }

    #[test]
    fn interval_fires_per_elapsed_period() {
        let timers = timers();
        let (hits, cb) = counter();
        let handle = timers.create_interval(cb, ms(10), Some("poll".into()));
        assert_eq!(timers.advance_to(ms(35)), 3);
        assert_eq!(hits.get(), 3);
        assert!(handle.is_active());
        assert!(handle.clear());
        assert!(!handle.clear());
        assert_eq!(timers.advance_to(ms(100)), 0);
    }

    #[test]
    fn zero_period_is_clamped() {
        let timers = timers();
        let (hits, cb) = counter();
        let handle = timers.create_interval(cb, Duration::ZERO, None);
        assert_eq!(handle.delay(), MIN_PERIOD);
        assert_eq!(timers.advance_to(ms(5)), 5);
        assert_eq!(hits.get(), 5);
    }

    #[test]
    fn interval_at_end_of_time_fires_once() {
        let timers = Rc::new(timers());
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let t = Rc::downgrade(&timers);
        let handle = timers.create_interval(
            move || {
                h.set(h.get() + 1);
                if h.get() == 1000 {
                    if let Some(t) = t.upgrade() {
                        t.clear_interval(&"far".into());
                    }
                }
            },
            Duration::MAX,
            Some("far".into()),
        );
        assert_eq!(timers.advance_to(Duration::MAX), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(timers.advance_to(Duration::MAX), 0);
        assert!(handle.is_active());
        assert!(handle.clear());
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn long_stall_is_coalesced() {
        let timers = timers();
        let (hits, cb) = counter();
        let handle = timers.create_interval(cb, ms(1), None);
        assert_eq!(timers.advance_by(Duration::from_secs(3600)), MAX_CATCH_UP as usize);
        assert_eq!(hits.get(), MAX_CATCH_UP);
        // Resumes on the next period boundary, not the backlog.
        assert_eq!(timers.advance_by(ms(1)), 1);
        assert_eq!(timers.advance_by(ms(3)), 3);
        assert!(handle.is_active());
    }

    #[test]
    fn next_due_overflow_and_skip() {
        assert_eq!(next_due(ms(10), ms(10), 1, ms(100)), Some(ms(20)));
        assert_eq!(next_due(ms(10), ms(10), MAX_CATCH_UP, ms(100)), Some(ms(110)));
        assert_eq!(next_due(ms(10), ms(10), MAX_CATCH_UP, ms(15)), Some(ms(20)));
        assert_eq!(next_due(Duration::MAX, ms(1), 1, Duration::MAX), None);
        assert_eq!(duration_from_nanos(1_500_000_000), Some(Duration::new(1, 500_000_000)));
        assert_eq!(duration_from_nanos(u128::MAX), None);
    }

    #[test]
    fn due_order_across_kinds() {
        let timers = timers();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        timers.create_timeout(move || o.borrow_mut().push("t25"), ms(25), None);
        let o = Rc::clone(&order);
        timers.create_interval(move || o.borrow_mut().push("i10"), ms(10), None);
        timers.advance_to(ms(30));
        assert_eq!(*order.borrow(), vec!["i10", "i10", "t25", "i10"]);
    }

    #[test]
    fn same_id_replaces() {
        let timers = timers();
        let (first_hits, first) = counter();
        let (second_hits, second) = counter();
        let old = timers.create_timeout(first, ms(10), Some("debounce".into()));
        let new = timers.create_timeout(second, ms(10), Some("debounce".into()));
        assert!(!old.is_active());
        assert!(new.is_active());
        assert_eq!(timers.counts().timeouts, 1);
        timers.advance_to(ms(10));
        assert_eq!(first_hits.get(), 0);
        assert_eq!(second_hits.get(), 1);
    }

    #[test]
    fn same_id_in_each_kind_is_independent() {
        let timers = timers();
        let (_, a) = counter();
        let (_, b) = counter();
        timers.create_timeout(a, ms(10), Some("sync".into()));
        timers.create_interval(b, ms(10), Some("sync".into()));
        assert_eq!(
            timers.counts(),
            TimerCounts {
                timeouts: 1,
                intervals: 1,
                total: 2
            }
        );
        assert!(timers.clear_timeout(&"sync".into()));
        assert_eq!(timers.counts().intervals, 1);
    }

    #[test]
    fn restart_reschedules_from_now() {
        let timers = timers();
        let (hits, cb) = counter();
        let mut handle = timers.create_timeout(cb, ms(50), Some("save".into()));
        timers.advance_to(ms(40));
        assert!(handle.restart(None));
        assert_eq!(timers.advance_to(ms(60)), 0);
        assert_eq!(timers.advance_to(ms(90)), 1);
        assert_eq!(hits.get(), 1);

        // A fired timeout can be started again, with a new delay.
        assert!(handle.restart(Some(ms(5))));
        assert_eq!(handle.delay(), ms(5));
        assert_eq!(timers.advance_to(ms(95)), 1);
        assert_eq!(hits.get(), 2);
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn callback_can_clear_its_own_interval() {
        let timers = Rc::new(timers());
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let t = Rc::downgrade(&timers);
        timers.create_interval(
            move || {
                h.set(h.get() + 1);
                if h.get() == 2 {
                    if let Some(t) = t.upgrade() {
                        t.clear_interval(&"tick".into());
                    }
                }
            },
            ms(10),
            Some("tick".into()),
        );
        assert_eq!(timers.advance_to(ms(100)), 2);
        assert_eq!(hits.get(), 2);
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn callback_can_schedule_follow_up() {
        let timers = Rc::new(timers());
        let (hits, mut follow) = counter();
        let t = Rc::downgrade(&timers);
        let mut follow_once = Some(move || follow());
        timers.create_timeout(
            move || {
                if let (Some(t), Some(cb)) = (t.upgrade(), follow_once.take()) {
                    t.create_timeout(cb, ms(5), None);
                }
            },
            ms(10),
            None,
        );
        assert_eq!(timers.advance_to(ms(20)), 2);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn clock_does_not_go_backwards() {
        let timers = timers();
        let (_, cb) = counter();
        timers.create_timeout(cb, ms(10), None);
        timers.advance_to(ms(5));
        assert_eq!(timers.advance_to(ms(1)), 0);
        assert_eq!(timers.now(), ms(5));
        assert_eq!(timers.advance_by(ms(5)), 1);
    }

    #[test]
    fn clear_all_and_drop() {
        let timers = timers();
        let (hits, a) = counter();
        let (_, b) = counter();
        timers.create_timeout(a, ms(10), None);
        let interval = timers.create_interval(b, ms(10), None);
        let report = timers.clear_all();
        assert_eq!(report.attempted, 2);
        assert_eq!(timers.active_count(), 0);
        timers.advance_to(ms(100));
        assert_eq!(hits.get(), 0);

        let (_, c) = counter();
        let late = timers.create_timeout(c, ms(10), None);
        drop(timers);
        assert!(!late.is_active());
        assert!(!interval.is_active());
    }

    #[test]
    fn debounce_settles_on_last_value() {
        let timers = timers();
        let mut query = timers.debounce(String::from("initial"), ms(500));
        assert_eq!(query.get(), "initial");

        assert!(query.set(String::from("change1")));
        timers.advance_by(ms(250));
        assert!(query.set(String::from("change2")));
        timers.advance_by(ms(250));
        assert_eq!(query.get(), "initial");
        assert!(query.is_pending());

        timers.advance_by(ms(250));
        assert_eq!(query.get(), "change2");
        assert!(!query.is_pending());
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn debounce_cancel_and_scope_end() {
        let timers = timers();
        let mut width = timers.debounce(0u32, ms(100));
        width.set(640);
        assert!(width.cancel());
        timers.advance_by(ms(200));
        assert_eq!(width.get(), 0);

        width.set(800);
        timers.close();
        timers.advance_by(ms(200));
        assert_eq!(width.get(), 0);
        assert!(!width.set(1024));
        assert!(!width.is_pending());
    }

    #[test]
    fn clock_view_does_not_keep_manager_alive() {
        let timers = timers();
        let clock = timers.clock();
        timers.advance_to(ms(42));
        assert_eq!(clock.now(), Some(ms(42)));
        drop(timers);
        assert_eq!(clock.now(), None);
    }

    #[test]
    fn restart_after_manager_dropped_fails() {
        let timers = timers();
        let (_, cb) = counter();
        let mut handle = timers.create_timeout(cb, ms(10), None);
        drop(timers);
        assert!(!handle.restart(None));
    }
}
