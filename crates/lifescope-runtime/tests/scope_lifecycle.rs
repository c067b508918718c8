//! End-to-end lifecycle checks across the specializations of one scope.
//!
//! 1. Three registrations `a`, `b`, `c` are all torn down by `remove_all`.
//! 2. Re-registering `x` tears the first entry down before storing the second.
//! 3. A failing listener teardown does not stop the other two.
//! 4. A settled request leaves the registry without being canceled.
//! 5. Cancelling twice is observably the same as cancelling once.
//! 6. Unmounting a busy scope ends every resource exactly once.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use lifescope_core::diagnostics::{DiagnosticsSinkConfig, MemoryLog};
use lifescope_core::{CancelReason, Canceled, LifecycleConfig, Registry, TeardownError};
use lifescope_runtime::{
    EventBus, EventTarget, ListenerCallback, ListenerError, ListenerOptions, RequestManager,
    ResourceScope, listener,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn quiet_scope(name: &str) -> ResourceScope {
    ResourceScope::mount_with_config(name, LifecycleConfig::quiet())
}

// ── 1 + 2. Registry scenarios ─────────────────────────────────────────────

#[test]
fn remove_all_over_three_entries() {
    let registry = Registry::with_config("scenario", &LifecycleConfig::quiet());
    let fired = Rc::new(RefCell::new(Vec::new()));
    for id in ["a", "b", "c"] {
        let fired = Rc::clone(&fired);
        registry.register_fn(Some(id.into()), move || fired.borrow_mut().push(id));
    }
    assert_eq!(registry.active_count(), 3);

    let report = registry.remove_all();
    assert_eq!(report.attempted, 3);
    assert_eq!(registry.active_count(), 0);
    let mut fired = fired.borrow().clone();
    fired.sort_unstable();
    assert_eq!(fired, vec!["a", "b", "c"]);
}

#[test]
fn replacement_runs_first_teardown_before_storing_second() {
    let registry = Rc::new(Registry::with_config("scenario", &LifecycleConfig::quiet()));
    let log = Rc::new(RefCell::new(Vec::new()));

    let first_log = Rc::clone(&log);
    let weak = Rc::downgrade(&registry);
    registry.register_fn(Some("x".into()), move || {
        let stored = weak
            .upgrade()
            .map(|registry| registry.active_count())
            .unwrap_or_default();
        first_log.borrow_mut().push(format!("t1 ran, {stored} stored"));
    });
    let second_log = Rc::clone(&log);
    let second = registry.register_fn(Some("x".into()), move || {
        second_log.borrow_mut().push("t2 ran".to_owned());
    });
    log.borrow_mut().push("t2 stored".to_owned());

    assert_eq!(*log.borrow(), vec!["t1 ran, 0 stored", "t2 stored"]);
    assert_eq!(registry.active_count(), 1);
    assert!(second.is_active());
}

// ── 3. Failing listener teardown ──────────────────────────────────────────

/// Element whose detach throws for one event type.
struct DetachedElement {
    bus: EventBus<()>,
    broken: &'static str,
}

impl EventTarget<()> for DetachedElement {
    fn add_listener(
        &self,
        event_type: &str,
        callback: &ListenerCallback<()>,
        options: ListenerOptions,
    ) -> Result<(), ListenerError> {
        self.bus.add_listener(event_type, callback, options)
    }

    fn remove_listener(
        &self,
        event_type: &str,
        callback: &ListenerCallback<()>,
        options: ListenerOptions,
    ) -> Result<bool, ListenerError> {
        if event_type == self.broken {
            return Err(ListenerError::new(event_type, "element no longer in document"));
        }
        self.bus.remove_listener(event_type, callback, options)
    }
}

#[test]
fn failing_listener_teardown_is_isolated() {
    let scope = quiet_scope("form");
    let element = Rc::new(DetachedElement {
        bus: EventBus::new(),
        broken: "change",
    });
    for event_type in ["input", "change", "submit"] {
        scope
            .listeners()
            .add_event_listener(
                &element,
                event_type,
                listener(|_: &()| {}),
                ListenerOptions::new(),
                Some(event_type.into()),
            )
            .unwrap();
    }

    let report = scope.listeners().remove_all();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded(), 2);
    let failure: &TeardownError = &report.failures[0];
    assert_eq!(failure.id().map(|id| id.as_str()), Some("change"));
    assert_eq!(scope.listeners().active_count(), 0);
    assert_eq!(element.bus.listener_count("input"), 0);
    assert_eq!(element.bus.listener_count("submit"), 0);
}

// ── 4 + 5. Request settlement and cancellation ────────────────────────────

#[test]
fn settled_request_leaves_without_cancel() {
    let requests = RequestManager::with_config(&LifecycleConfig::quiet());
    let handle = requests.create_request(
        |signal| async move {
            signal.check()?;
            Ok::<_, Canceled>("profile")
        },
        Some("profile".into()),
    );
    let canceler = handle.canceler();
    assert_eq!(requests.active_count(), 1);

    let body = pollster::block_on(handle.into_future());
    assert_eq!(body, Ok("profile"));
    assert_eq!(requests.active_count(), 0);
    assert!(!canceler.is_canceled());
    assert!(!canceler.cancel());
    assert!(!canceler.is_canceled());
}

#[test]
fn failed_request_also_leaves() {
    let requests = RequestManager::with_config(&LifecycleConfig::quiet());
    let handle = requests.create_request(
        |_signal| async { Err::<(), _>("503 Service Unavailable") },
        None,
    );
    assert_eq!(
        pollster::block_on(handle.into_future()),
        Err("503 Service Unavailable")
    );
    assert_eq!(requests.counts().requests, 0);
    assert_eq!(requests.counts().pending, 0);
}

proptest! {
    #[test]
    fn repeated_cancel_matches_single_cancel(extra in 0usize..6) {
        let requests = RequestManager::with_config(&LifecycleConfig::quiet());
        let aborts = Rc::new(Cell::new(0u32));
        let a = Rc::clone(&aborts);
        let handle = requests.create_request(
            move |signal| {
                signal.on_cancel(move |_| a.set(a.get() + 1));
                async move {
                    signal.cancelled().await;
                    Err::<(), _>(Canceled)
                }
            },
            None,
        );
        prop_assert!(handle.cancel());
        for _ in 0..extra {
            prop_assert!(!handle.cancel());
        }
        prop_assert!(handle.is_canceled());
        prop_assert_eq!(handle.canceler().reason(), Some(CancelReason::Manual));
        prop_assert_eq!(aborts.get(), 1);
        prop_assert_eq!(requests.active_count(), 0);
        prop_assert_eq!(pollster::block_on(handle.into_future()), Err(Canceled));
    }
}

// ── 6. Scope end ──────────────────────────────────────────────────────────

#[test]
fn unmount_ends_every_resource_once() {
    let log = MemoryLog::new();
    let config = LifecycleConfig::quiet().with_sink(DiagnosticsSinkConfig::memory(log.clone()));
    let scope = ResourceScope::mount_with_config("dashboard", config);
    let bus = Rc::new(EventBus::<u32>::new());

    let ticks = Rc::new(Cell::new(0u32));
    let t = Rc::clone(&ticks);
    scope
        .timers()
        .create_interval(move || t.set(t.get() + 1), Duration::from_millis(250), Some("refresh".into()));
    scope
        .listeners()
        .add_event_listener(&bus, "visibilitychange", listener(|_: &u32| {}), ListenerOptions::new(), None)
        .unwrap();
    let request = scope.requests().create_request(
        |signal| async move {
            signal.cancelled().await;
            Err::<(), _>(Canceled)
        },
        Some("stats".into()),
    );

    assert_eq!(scope.timers().advance_to(Duration::from_secs(1)), 4);
    assert_eq!(ticks.get(), 4);

    let report = scope.unmount();
    assert_eq!(report.attempted, 3);
    assert!(report.is_clean());
    assert_eq!(bus.total_listeners(), 0);
    assert_eq!(request.canceler().reason(), Some(CancelReason::ScopeEnded));

    let kinds: Vec<String> = log
        .lines()
        .iter()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|event| event["kind"].as_str().map(str::to_owned))
        .collect();
    for expected in ["timer_cleared", "listener_removed", "request_canceled", "closed"] {
        assert!(kinds.iter().any(|k| k == expected), "missing {expected} in {kinds:?}");
    }
}
