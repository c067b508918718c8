#![forbid(unsafe_code)]

//! Event-listener subscriptions bound to a scope.
//!
//! # Design
//!
//! The platform side is abstracted by [`EventTarget`]: attach and detach a
//! `(event_type, callback, options)` tuple. Detaching only succeeds with the
//! exact tuple used to attach, so the manager stores the caller's
//! [`ListenerCallback`] `Rc` as-is and hands that same pointer back on
//! removal. Callback identity is pointer identity.
//!
//! [`EventBus`] is an in-process target with the usual DOM rules: duplicate
//! tuples are ignored, `once` listeners detach themselves before running,
//! and `capture` is part of the identity while `once`/`passive` are not.
//!
//! # Failure Modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | Target reports no match on removal | Bookkeeping cleared, logged at `debug` |
//! | Target errors on removal | `TeardownError`, entry still removed |
//! | Target errors on attach | `add_event_listener` returns the error, nothing registered |

use std::cell::RefCell;
use std::rc::Rc;

use lifescope_core::diagnostics::LifecycleEventKind;
use lifescope_core::{
    EntryHandle, LifecycleConfig, Registry, ResourceId, TeardownError, TeardownReport,
};

/// Registry category for listeners.
pub const LISTENER_CATEGORY: &str = "listener";

/// Shared listener callback. Its pointer is its identity.
pub type ListenerCallback<E> = Rc<dyn Fn(&E)>;

/// Wrap a closure as a [`ListenerCallback`].
pub fn listener<E, F>(f: F) -> ListenerCallback<E>
where
    F: Fn(&E) + 'static,
{
    Rc::new(f)
}

fn same_callback<E: ?Sized>(a: &Rc<E>, b: &Rc<E>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Listener options, mirroring DOM `AddEventListenerOptions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ListenerOptions {
    /// Listen in the capture phase. Part of the listener identity.
    pub capture: bool,
    /// Detach after the first dispatch.
    pub once: bool,
    /// The listener promises not to cancel the event.
    pub passive: bool,
}

impl ListenerOptions {
    /// Default options.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capture: false,
            once: false,
            passive: false,
        }
    }

    /// Set capture.
    #[must_use]
    pub const fn capture(mut self, value: bool) -> Self {
        self.capture = value;
        self
    }

    /// Set once.
    #[must_use]
    pub const fn once(mut self, value: bool) -> Self {
        self.once = value;
        self
    }

    /// Set passive.
    #[must_use]
    pub const fn passive(mut self, value: bool) -> Self {
        self.passive = value;
        self
    }
}

/// Platform-level failure to attach or detach a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerError {
    event_type: String,
    message: String,
}

impl ListenerError {
    /// Error for `event_type` with a message.
    #[must_use]
    pub fn new(event_type: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_owned(),
            message: message.into(),
        }
    }

    /// Event type the failed call was for.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl core::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} listener: {}", self.event_type, self.message)
    }
}

impl std::error::Error for ListenerError {}

/// Something listeners can be attached to (window, document, element, bus).
pub trait EventTarget<E> {
    /// Attach a listener.
    fn add_listener(
        &self,
        event_type: &str,
        callback: &ListenerCallback<E>,
        options: ListenerOptions,
    ) -> Result<(), ListenerError>;

    /// Detach a listener. `Ok(false)` when no attached listener matched.
    fn remove_listener(
        &self,
        event_type: &str,
        callback: &ListenerCallback<E>,
        options: ListenerOptions,
    ) -> Result<bool, ListenerError>;
}

/// Caller handle for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    entry: EntryHandle,
    event_type: Rc<str>,
}

impl SubscriptionHandle {
    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        self.entry.id()
    }

    /// Event type this subscription listens to.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether the subscription is still tracked.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Detach the listener. Repeated calls are no-ops returning `Ok(false)`.
    pub fn remove(&self) -> Result<bool, TeardownError> {
        self.entry.remove()
    }
}

/// Attaches and tracks the event listeners of one scope.
#[derive(Debug)]
pub struct ListenerManager {
    registry: Registry,
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerManager {
    /// Manager with build-mode default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&LifecycleConfig::default())
    }

    /// Manager with an explicit config.
    #[must_use]
    pub fn with_config(config: &LifecycleConfig) -> Self {
        Self {
            registry: Registry::with_config(LISTENER_CATEGORY, config),
        }
    }

    /// Attach `callback` to `target` and track it under `id`.
    ///
    /// A listener already tracked under `id` is detached first. When `id` is
    /// `None`, one is synthesized as `<event_type>_<millis>_<counter>_<random>`.
    pub fn add_event_listener<E, T>(
        &self,
        target: &Rc<T>,
        event_type: &str,
        callback: ListenerCallback<E>,
        options: ListenerOptions,
        id: Option<ResourceId>,
    ) -> Result<SubscriptionHandle, ListenerError>
    where
        E: 'static,
        T: EventTarget<E> + ?Sized + 'static,
    {
        let diag = Rc::clone(self.registry.diagnostics());
        let event_type: Rc<str> = Rc::from(event_type);
        let id = id.unwrap_or_else(|| self.registry.next_id_with_prefix(&event_type));

        let detach_target = Rc::clone(target);
        let detach_type = Rc::clone(&event_type);
        let detach_callback = Rc::clone(&callback);
        let detach_id = id.clone();
        let detach_diag = Rc::clone(&diag);
        let entry = self.registry.register(Some(id.clone()), move |cause| {
            match detach_target.remove_listener(&detach_type, &detach_callback, options) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        id = detach_id.as_str(),
                        event_type = &*detach_type,
                        "lifescope: listener was no longer attached"
                    );
                }
                Err(err) => return Err(TeardownError::failed(err.to_string())),
            }
            detach_diag.emit(
                LifecycleEventKind::ListenerRemoved,
                Some(&detach_id),
                Some(cause.as_str()),
                0,
            );
            Ok(())
        });

        if !entry.is_active() {
            // Scope already ended; attaching would leak.
            return Ok(SubscriptionHandle { entry, event_type });
        }
        if let Err(err) = target.add_listener(&event_type, &callback, options) {
            entry.release();
            return Err(err);
        }

        diag.emit(
            LifecycleEventKind::ListenerAdded,
            Some(&id),
            Some(&event_type),
            self.registry.active_count(),
        );
        Ok(SubscriptionHandle { entry, event_type })
    }

    /// Detach every tracked listener.
    pub fn remove_all(&self) -> TeardownReport {
        self.registry.remove_all()
    }

    /// Detach everything and refuse new listeners. `Drop` does the same.
    pub fn close(&self) -> TeardownReport {
        self.registry.close()
    }

    /// Number of tracked listeners.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

struct Attached<E> {
    event_type: Rc<str>,
    callback: ListenerCallback<E>,
    options: ListenerOptions,
}

impl<E> Attached<E> {
    fn matches(&self, event_type: &str, callback: &ListenerCallback<E>, capture: bool) -> bool {
        &*self.event_type == event_type
            && self.options.capture == capture
            && same_callback(&self.callback, callback)
    }
}

/// In-process [`EventTarget`] with synchronous dispatch.
pub struct EventBus<E> {
    listeners: RefCell<Vec<Attached<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl<E> EventBus<E> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to listeners of `event_type`, capture listeners first,
    /// each group in attach order. Returns the number of callbacks run.
    pub fn dispatch(&self, event_type: &str, event: &E) -> usize {
        let callbacks: Vec<ListenerCallback<E>> = {
            let mut listeners = self.listeners.borrow_mut();
            let mut ordered: Vec<(bool, ListenerCallback<E>)> = listeners
                .iter()
                .filter(|l| &*l.event_type == event_type)
                .map(|l| (l.options.capture, Rc::clone(&l.callback)))
                .collect();
            ordered.sort_by_key(|(capture, _)| !capture);
            listeners.retain(|l| !(l.options.once && &*l.event_type == event_type));
            ordered.into_iter().map(|(_, cb)| cb).collect()
        };
        for cb in &callbacks {
            cb(event);
        }
        callbacks.len()
    }

    /// Attached listeners for `event_type`.
    #[must_use]
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| &*l.event_type == event_type)
            .count()
    }

    /// Attached listeners across all event types.
    #[must_use]
    pub fn total_listeners(&self) -> usize {
        self.listeners.borrow().len()
    }
}

impl<E> EventTarget<E> for EventBus<E> {
    fn add_listener(
        &self,
        event_type: &str,
        callback: &ListenerCallback<E>,
        options: ListenerOptions,
    ) -> Result<(), ListenerError> {
        let mut listeners = self.listeners.borrow_mut();
        if listeners
            .iter()
            .any(|l| l.matches(event_type, callback, options.capture))
        {
            return Ok(());
        }
        listeners.push(Attached {
            event_type: Rc::from(event_type),
            callback: Rc::clone(callback),
            options,
        });
        Ok(())
    }

    fn remove_listener(
        &self,
        event_type: &str,
        callback: &ListenerCallback<E>,
        options: ListenerOptions,
    ) -> Result<bool, ListenerError> {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|l| !l.matches(event_type, callback, options.capture));
        Ok(listeners.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn manager() -> ListenerManager {
        ListenerManager::with_config(&LifecycleConfig::quiet())
    }

    fn counting() -> (Rc<Cell<u32>>, ListenerCallback<u32>) {
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        (hits, listener(move |_: &u32| h.set(h.get() + 1)))
    }

    /// Bus whose removals fail for one event type.
    struct Flaky {
        bus: EventBus<u32>,
        broken: &'static str,
    }

    impl EventTarget<u32> for Flaky {
        fn add_listener(
            &self,
            event_type: &str,
            callback: &ListenerCallback<u32>,
            options: ListenerOptions,
        ) -> Result<(), ListenerError> {
            self.bus.add_listener(event_type, callback, options)
        }

        fn remove_listener(
            &self,
            event_type: &str,
            callback: &ListenerCallback<u32>,
            options: ListenerOptions,
        ) -> Result<bool, ListenerError> {
            if event_type == self.broken {
                return Err(ListenerError::new(event_type, "target detached from document"));
            }
            self.bus.remove_listener(event_type, callback, options)
        }
    }

    #[test]
    fn add_dispatch_remove() {
        let bus = Rc::new(EventBus::new());
        let listeners = manager();
        let (hits, cb) = counting();
        let handle = listeners
            .add_event_listener(&bus, "resize", cb, ListenerOptions::new(), None)
            .unwrap();
        assert!(handle.is_active());
        assert_eq!(handle.event_type(), "resize");
        assert!(handle.id().as_str().starts_with("resize_"));

        assert_eq!(bus.dispatch("resize", &1), 1);
        assert_eq!(hits.get(), 1);

        assert_eq!(handle.remove(), Ok(true));
        assert_eq!(handle.remove(), Ok(false));
        assert_eq!(bus.dispatch("resize", &2), 0);
        assert_eq!(listeners.active_count(), 0);
    }

    #[test]
    fn same_id_replaces_listener() {
        let bus = Rc::new(EventBus::new());
        let listeners = manager();
        let (first_hits, first) = counting();
        let (second_hits, second) = counting();
        let opts = ListenerOptions::new();
        listeners
            .add_event_listener(&bus, "scroll", first, opts, Some("scroll".into()))
            .unwrap();
        listeners
            .add_event_listener(&bus, "scroll", second, opts, Some("scroll".into()))
            .unwrap();

        assert_eq!(bus.listener_count("scroll"), 1);
        bus.dispatch("scroll", &0);
        assert_eq!(first_hits.get(), 0);
        assert_eq!(second_hits.get(), 1);
        assert_eq!(listeners.active_count(), 1);
    }

    #[test]
    fn reattaching_same_callback_under_same_id_stays_attached() {
        let bus = Rc::new(EventBus::new());
        let listeners = manager();
        let (hits, cb) = counting();
        let opts = ListenerOptions::new();
        let id: ResourceId = "keydown".into();
        listeners
            .add_event_listener(&bus, "keydown", Rc::clone(&cb), opts, Some(id.clone()))
            .unwrap();
        listeners
            .add_event_listener(&bus, "keydown", cb, opts, Some(id))
            .unwrap();
        assert_eq!(bus.dispatch("keydown", &0), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn removal_uses_exact_callback() {
        let bus = Rc::new(EventBus::new());
        let listeners = manager();
        let (_, tracked) = counting();
        let (_, other) = counting();
        let opts = ListenerOptions::new();
        bus.add_listener("click", &other, opts).unwrap();
        let handle = listeners
            .add_event_listener(&bus, "click", tracked, opts, None)
            .unwrap();
        handle.remove().unwrap();
        assert_eq!(bus.listener_count("click"), 1);
    }

    #[test]
    fn capture_is_part_of_identity() {
        let bus: EventBus<u32> = EventBus::new();
        let (_, cb) = counting();
        bus.add_listener("click", &cb, ListenerOptions::new().capture(true))
            .unwrap();
        assert_eq!(
            bus.remove_listener("click", &cb, ListenerOptions::new()),
            Ok(false)
        );
        assert_eq!(
            bus.remove_listener("click", &cb, ListenerOptions::new().capture(true).once(true)),
            Ok(true)
        );
    }

    #[test]
    fn once_listener_mismatch_clears_bookkeeping() {
        let bus = Rc::new(EventBus::new());
        let listeners = manager();
        let (hits, cb) = counting();
        let handle = listeners
            .add_event_listener(&bus, "load", cb, ListenerOptions::new().once(true), None)
            .unwrap();
        bus.dispatch("load", &0);
        bus.dispatch("load", &0);
        assert_eq!(hits.get(), 1);

        // The target already dropped it; removal still clears tracking.
        assert!(handle.is_active());
        assert_eq!(handle.remove(), Ok(true));
        assert_eq!(listeners.active_count(), 0);
    }

    #[test]
    fn capture_listeners_run_first() {
        let bus = EventBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        let bubble = listener(move |_: &u32| o.borrow_mut().push("bubble"));
        let o = Rc::clone(&order);
        let capture = listener(move |_: &u32| o.borrow_mut().push("capture"));
        bus.add_listener("click", &bubble, ListenerOptions::new()).unwrap();
        bus.add_listener("click", &capture, ListenerOptions::new().capture(true))
            .unwrap();
        bus.dispatch("click", &0);
        assert_eq!(*order.borrow(), vec!["capture", "bubble"]);
    }

    #[test]
    fn failing_teardown_does_not_stop_remove_all() {
        let target = Rc::new(Flaky {
            bus: EventBus::new(),
            broken: "blur",
        });
        let listeners = manager();
        let opts = ListenerOptions::new();
        for event_type in ["focus", "blur", "input"] {
            let (_, cb) = counting();
            listeners
                .add_event_listener(&target, event_type, cb, opts, None)
                .unwrap();
        }
        let report = listeners.remove_all();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(listeners.active_count(), 0);
        assert_eq!(target.bus.listener_count("focus"), 0);
        assert_eq!(target.bus.listener_count("input"), 0);
        assert_eq!(target.bus.listener_count("blur"), 1);
    }

    #[test]
    fn attach_failure_registers_nothing() {
        struct Refusing;
        impl EventTarget<u32> for Refusing {
            fn add_listener(
                &self,
                event_type: &str,
                _: &ListenerCallback<u32>,
                _: ListenerOptions,
            ) -> Result<(), ListenerError> {
                Err(ListenerError::new(event_type, "unsupported"))
            }
            fn remove_listener(
                &self,
                _: &str,
                _: &ListenerCallback<u32>,
                _: ListenerOptions,
            ) -> Result<bool, ListenerError> {
                Ok(false)
            }
        }
        let listeners = manager();
        let (_, cb) = counting();
        let err = listeners
            .add_event_listener(&Rc::new(Refusing), "wheel", cb, ListenerOptions::new(), None)
            .unwrap_err();
        assert_eq!(err.event_type(), "wheel");
        assert_eq!(listeners.active_count(), 0);
    }

    #[test]
    fn scope_end_detaches_everything() {
        let bus = Rc::new(EventBus::new());
        {
            let listeners = manager();
            for event_type in ["online", "offline"] {
                let (_, cb) = counting();
                listeners
                    .add_event_listener(&bus, event_type, cb, ListenerOptions::new(), None)
                    .unwrap();
            }
            assert_eq!(bus.total_listeners(), 2);
        }
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn closed_manager_does_not_attach() {
        let bus = Rc::new(EventBus::new());
        let listeners = manager();
        listeners.close();
        let (_, cb) = counting();
        let handle = listeners
            .add_event_listener(&bus, "resize", cb, ListenerOptions::new(), None)
            .unwrap();
        assert!(!handle.is_active());
        assert_eq!(bus.total_listeners(), 0);
    }
}
