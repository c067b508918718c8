#![forbid(unsafe_code)]

//! Cooperative cancellation signal.
//!
//! A [`CancelController`] owns the right to cancel; the [`CancelSignal`] it
//! hands out is what an operation observes. Cancelling only flips the signal,
//! wakes tasks awaiting [`CancelSignal::cancelled`], and runs registered
//! `on_cancel` callbacks. Nothing is preempted: an operation that never looks
//! at its signal runs to completion.
//!
//! # Invariants
//!
//! 1. The signal starts un-canceled and becomes canceled at most once.
//! 2. The first [`CancelReason`] wins; later cancels are no-ops.
//! 3. Every `on_cancel` callback runs exactly once, either at cancellation or
//!    immediately on registration if the signal is already canceled.
//! 4. Callbacks and wakers run after the interior borrow is released, so a
//!    callback may inspect or clone the signal.
//!
//! # Example
//!
//! ```
//! use lifescope_core::cancel::{CancelController, CancelReason};
//!
//! let controller = CancelController::new();
//! let signal = controller.signal();
//! assert!(signal.check().is_ok());
//!
//! assert!(controller.cancel(CancelReason::Manual));
//! assert!(!controller.cancel(CancelReason::ScopeEnded));
//! assert_eq!(signal.reason(), Some(CancelReason::Manual));
//! assert!(signal.check().is_err());
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::Canceled;

/// Why a signal was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Explicit cancel through a handle.
    Manual,
    /// A newer resource was registered under the same id.
    Replaced,
    /// A bulk cancel (`cancel_all`, forced cleanup).
    CancelAll,
    /// The owning scope ended.
    ScopeEnded,
    /// The future was dropped before it settled.
    Dropped,
}

impl CancelReason {
    /// Stable name used in logs and JSONL diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Replaced => "replaced",
            Self::CancelAll => "cancel_all",
            Self::ScopeEnded => "scope_ended",
            Self::Dropped => "dropped",
        }
    }
}

type CancelCallback = Box<dyn FnOnce(CancelReason)>;

struct SignalInner {
    reason: Option<CancelReason>,
    wakers: Vec<Waker>,
    callbacks: Vec<CancelCallback>,
}

/// Read side of a cancellation: observable boolean plus wake-ups.
///
/// Cloning shares the same state.
pub struct CancelSignal {
    inner: Rc<RefCell<SignalInner>>,
}

impl Clone for CancelSignal {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("CancelSignal")
            .field("reason", &inner.reason)
            .field("pending_callbacks", &inner.callbacks.len())
            .finish()
    }
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SignalInner {
                reason: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
            })),
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.borrow().reason.is_some()
    }

    /// The reason recorded by the first cancel, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.borrow().reason
    }

    /// `Err(Canceled)` once canceled. Meant for `?` at an operation's safe points.
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Future that resolves when the signal is canceled.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            signal: self.clone(),
        }
    }

    /// Run `callback` once on cancellation (immediately if already canceled).
    pub fn on_cancel(&self, callback: impl FnOnce(CancelReason) + 'static) {
        let fired = {
            let mut inner = self.inner.borrow_mut();
            match inner.reason {
                Some(reason) => Some(reason),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(reason) = fired {
            callback(reason);
        }
    }

    fn trigger(&self, reason: CancelReason) -> bool {
        let (wakers, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            if inner.reason.is_some() {
                return false;
            }
            inner.reason = Some(reason);
            (
                std::mem::take(&mut inner.wakers),
                std::mem::take(&mut inner.callbacks),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for cb in callbacks {
            cb(reason);
        }
        true
    }
}

/// Write side of a cancellation. Owned by whoever may cancel the operation.
#[derive(Debug, Clone)]
pub struct CancelController {
    signal: CancelSignal,
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelController {
    /// Create a controller with a fresh, un-canceled signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: CancelSignal::new(),
        }
    }

    /// The signal to hand to the operation.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    /// Whether this controller's signal is canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.signal.is_canceled()
    }

    /// Cancel the signal. Returns `true` only for the call that flipped it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.signal.trigger(reason)
    }
}

/// Future returned by [`CancelSignal::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    signal: CancelSignal,
}

impl Future for Cancelled {
    type Output = CancelReason;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.signal.inner.borrow_mut();
        if let Some(reason) = inner.reason {
            return Poll::Ready(reason);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
