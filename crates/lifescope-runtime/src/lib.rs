#![forbid(unsafe_code)]

//! Runtime: requests, event listeners, timers and caches bound to a UI scope.
//!
//! # Role in lifescope
//! Each manager here is a thin specialization of
//! [`lifescope_core::Registry`]: it decides what "tear down" means for its
//! resource kind (abort a request, detach a listener, clear a timer) and
//! leaves ownership, replacement and scope-end semantics to the registry.
//!
//! # Primary responsibilities
//! - **RequestManager**: cancellable async operations; settled requests
//!   leave the registry on their own.
//! - **ListenerManager**: subscriptions on any [`EventTarget`], detached with
//!   the exact callback they were attached with.
//! - **TimerManager**: timeouts, intervals and debounced values on a
//!   host-driven clock.
//! - **CacheManager**: age- and size-bounded caches, cleaned on the scope's
//!   timers and saved to an optional store when the scope ends.
//! - **ResourceScope**: all of the above for one component, with forced
//!   cleanup and memory-pressure handling.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use std::time::Duration;
//! use lifescope_core::LifecycleConfig;
//! use lifescope_runtime::{EventBus, ListenerOptions, ResourceScope, listener};
//!
//! let bus = Rc::new(EventBus::<u32>::new());
//! let scope = ResourceScope::mount_with_config("sidebar", LifecycleConfig::quiet());
//! scope
//!     .listeners()
//!     .add_event_listener(&bus, "resize", listener(|_: &u32| {}), ListenerOptions::new(), None)
//!     .unwrap();
//! scope.timers().create_interval(|| {}, Duration::from_secs(1), None);
//! assert_eq!(scope.active_resource_counts().total(), 2);
//!
//! drop(scope);
//! assert_eq!(bus.total_listeners(), 0);
//! ```

pub mod cache;
pub mod listener;
pub mod request;
pub mod scope;
pub mod timer;

pub use cache::{
    Cache, CacheConfig, CacheManager, CacheStats, CacheStore, CacheStoreError, MemoryCacheStore,
    StoredEntry,
};
#[cfg(feature = "cache-persistence")]
pub use cache::JsonFileStore;
pub use listener::{
    EventBus, EventTarget, ListenerCallback, ListenerError, ListenerManager, ListenerOptions,
    SubscriptionHandle, listener,
};
pub use request::{RequestCanceler, RequestCounts, RequestFuture, RequestHandle, RequestManager};
pub use scope::{MemoryPressure, ResourceCounts, ResourceScope};
pub use timer::{Debounced, TimerClock, TimerCounts, TimerHandle, TimerKind, TimerManager};
