#![forbid(unsafe_code)]

//! Core: scoped resource registry, cancellation, configuration, diagnostics.
//!
//! # Role in lifescope
//! `lifescope-core` owns the generic lifecycle contract. A [`Registry`] keeps
//! the teardown actions of one UI scope (a mounted component, a hook
//! instance) and guarantees each runs at most once, and that all of them run
//! when the scope ends.
//!
//! # Primary responsibilities
//! - **Registry**: replace-with-cleanup registration, idempotent removal,
//!   failure-isolated bulk teardown, close-on-drop.
//! - **CancelSignal**: cooperative cancellation observed by async operations.
//! - **LifecycleConfig**: build-mode defaults with environment overrides.
//! - **Diagnostics**: `tracing` events and an optional JSONL sink.
//!
//! # How it fits in the system
//! `lifescope-runtime` builds the request, event-listener, timer and cache
//! specializations on top of [`Registry`], and bundles them per scope.
//!
//! [`Registry`]: registry::Registry

pub mod cancel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod id;
pub mod logging;
pub mod registry;

pub use cancel::{CancelController, CancelReason, CancelSignal};
pub use config::LifecycleConfig;
pub use error::{Canceled, TeardownError, TeardownErrorKind, TeardownReport};
pub use id::ResourceId;
pub use registry::{EntryHandle, Registry, RegistryStats, TeardownCause};
