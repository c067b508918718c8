#![forbid(unsafe_code)]

//! Cancellable requests bound to a scope.
//!
//! [`RequestManager::create_request`] hands the operation a [`CancelSignal`]
//! and registers the signal's abort as the registry teardown. The returned
//! [`RequestHandle`] can cancel the request and yields the operation's
//! future.
//!
//! # Contract
//!
//! - Cancellation is cooperative. Cancelling flips the signal and removes the
//!   entry; it does not stop the future. The operation decides what to return
//!   once it observes the signal (`check()`, `cancelled().await`, `on_cancel`).
//! - A future that settles, with success or failure, releases its entry
//!   without touching the signal.
//! - Cancelling after settlement, or twice, is a no-op.
//! - Dropping an unsettled [`RequestFuture`] cancels it with
//!   [`CancelReason::Dropped`].
//! - Reusing an id aborts the previous request under that id.
//!
//! # Example
//!
//! ```
//! use lifescope_runtime::request::RequestManager;
//!
//! let requests = RequestManager::new();
//! let handle = requests.create_request(
//!     |signal| async move {
//!         signal.check()?;
//!         Ok::<_, lifescope_core::Canceled>(42)
//!     },
//!     Some("search".into()),
//! );
//! assert_eq!(requests.active_count(), 1);
//! assert_eq!(pollster::block_on(handle.into_future()), Ok(42));
//! assert_eq!(requests.active_count(), 0);
//! ```

use std::cell::Cell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use lifescope_core::diagnostics::{Diagnostics, LifecycleEventKind};
use lifescope_core::{
    CancelController, CancelReason, CancelSignal, EntryHandle, LifecycleConfig, Registry,
    ResourceId, TeardownCause, TeardownReport,
};

/// Registry category for requests.
pub const REQUEST_CATEGORY: &str = "request";

fn reason_for(cause: TeardownCause) -> CancelReason {
    match cause {
        TeardownCause::Removed => CancelReason::Manual,
        TeardownCause::Replaced => CancelReason::Replaced,
        TeardownCause::Cleared => CancelReason::CancelAll,
        TeardownCause::ScopeEnded => CancelReason::ScopeEnded,
    }
}

/// Live request counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    /// Requests still registered (not settled, not canceled).
    pub requests: usize,
    /// Futures neither settled nor dropped. Canceled futures stay pending
    /// until the operation returns.
    pub pending: usize,
}

/// Creates and tracks the requests of one scope.
#[derive(Debug)]
pub struct RequestManager {
    registry: Registry,
    pending: Rc<Cell<usize>>,
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    /// Manager with build-mode default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&LifecycleConfig::default())
    }

    /// Manager with an explicit config.
    #[must_use]
    pub fn with_config(config: &LifecycleConfig) -> Self {
        Self {
            registry: Registry::with_config(REQUEST_CATEGORY, config),
            pending: Rc::new(Cell::new(0)),
        }
    }

    /// Start a request.
    ///
    /// `operation` is invoked right away with the request's signal. When this
    /// manager's scope has already ended, the signal it receives is canceled
    /// with [`CancelReason::ScopeEnded`].
    pub fn create_request<T, F, Fut>(&self, operation: F, id: Option<ResourceId>) -> RequestHandle<T>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let controller = CancelController::new();
        let diag = Rc::clone(self.registry.diagnostics());
        let id = id.unwrap_or_else(|| self.registry.next_id());

        let abort = controller.clone();
        let abort_diag = Rc::clone(&diag);
        let abort_id = id.clone();
        let entry = self.registry.register(Some(id.clone()), move |cause| {
            let reason = reason_for(cause);
            if abort.cancel(reason) {
                abort_diag.emit(
                    LifecycleEventKind::RequestCanceled,
                    Some(&abort_id),
                    Some(reason.as_str()),
                    0,
                );
            }
            Ok(())
        });

        diag.emit(
            LifecycleEventKind::RequestCreated,
            Some(&id),
            None,
            self.registry.active_count(),
        );
        self.pending.set(self.pending.get() + 1);

        let future = RequestFuture {
            inner: Box::pin(operation(controller.signal())),
            entry: entry.clone(),
            controller: controller.clone(),
            pending: Rc::clone(&self.pending),
            diag,
            settled: false,
        };

        RequestHandle {
            canceler: RequestCanceler {
                entry,
                signal: controller.signal(),
            },
            future,
        }
    }

    /// Cancel every live request of this manager.
    pub fn cancel_all(&self) -> TeardownReport {
        self.registry.remove_all()
    }

    /// Cancel every live request and refuse new ones. `Drop` does the same.
    pub fn close(&self) -> TeardownReport {
        self.registry.close()
    }

    /// Number of registered requests.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Registered and pending counts.
    #[must_use]
    pub fn counts(&self) -> RequestCounts {
        RequestCounts {
            requests: self.registry.active_count(),
            pending: self.pending.get(),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Cloneable cancel capability for one request.
///
/// Stays usable while the request's future is being awaited elsewhere.
#[derive(Debug, Clone)]
pub struct RequestCanceler {
    entry: EntryHandle,
    signal: CancelSignal,
}

impl RequestCanceler {
    /// Request id.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        self.entry.id()
    }

    /// Cancel the request. Returns `true` when this call canceled it.
    ///
    /// No-op once the request settled, was canceled, or was replaced.
    pub fn cancel(&self) -> bool {
        // The request teardown never fails.
        matches!(self.entry.remove(), Ok(true))
    }

    /// Current value of the cancel signal.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.signal.is_canceled()
    }

    /// Why the request was canceled, if it was.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.signal.reason()
    }

    /// Whether the request is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }
}

/// Caller handle for one request.
///
/// Awaiting the handle (it implements [`IntoFuture`]) awaits the operation.
#[must_use = "dropping a request handle cancels the request"]
pub struct RequestHandle<T> {
    canceler: RequestCanceler,
    future: RequestFuture<T>,
}

impl<T> std::fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", self.canceler.id())
            .field("canceled", &self.canceler.is_canceled())
            .field("settled", &self.future.settled)
            .finish()
    }
}

impl<T> RequestHandle<T> {
    /// Request id.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        self.canceler.id()
    }

    /// Cancel the request. Idempotent; see [`RequestCanceler::cancel`].
    pub fn cancel(&self) -> bool {
        self.canceler.cancel()
    }

    /// Current value of the cancel signal.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceler.is_canceled()
    }

    /// Whether the request is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.canceler.is_active()
    }

    /// A cancel capability that outlives `into_future`.
    #[must_use]
    pub fn canceler(&self) -> RequestCanceler {
        self.canceler.clone()
    }

    /// The operation's future, for polling in place.
    pub fn future(&mut self) -> &mut RequestFuture<T> {
        &mut self.future
    }
}

impl<T> IntoFuture for RequestHandle<T> {
    type Output = T;
    type IntoFuture = RequestFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

/// Completion future of a request.
#[must_use = "futures do nothing unless polled"]
pub struct RequestFuture<T> {
    inner: Pin<Box<dyn Future<Output = T>>>,
    entry: EntryHandle,
    controller: CancelController,
    pending: Rc<Cell<usize>>,
    diag: Rc<Diagnostics>,
    settled: bool,
}

impl<T> std::fmt::Debug for RequestFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("id", self.entry.id())
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl<T> RequestFuture<T> {
    /// Whether the operation has returned.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    fn finish(&mut self) {
        self.settled = true;
        self.pending.set(self.pending.get().saturating_sub(1));
    }
}

impl<T> Future for RequestFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let output = std::task::ready!(this.inner.as_mut().poll(cx));
        if !this.settled {
            this.finish();
            let released = this.entry.release();
            this.diag.emit(
                LifecycleEventKind::RequestSettled,
                Some(this.entry.id()),
                Some(if released { "completed" } else { "completed_after_cancel" }),
                0,
            );
        }
        Poll::Ready(output)
    }
}

impl<T> Drop for RequestFuture<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.finish();
        if self.entry.release() && self.controller.cancel(CancelReason::Dropped) {
            self.diag.emit(
                LifecycleEventKind::RequestCanceled,
                Some(self.entry.id()),
                Some(CancelReason::Dropped.as_str()),
                0,
            );
        }
    }
}
