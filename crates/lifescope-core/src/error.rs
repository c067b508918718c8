#![forbid(unsafe_code)]

//! Error types shared by the registry and its specializations.
//!
//! Teardown failures never escape a bulk sweep; they are collected into a
//! [`TeardownReport`] and logged. Individual removals return them so the
//! caller can decide.

use crate::id::ResourceId;

/// How a teardown action failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownErrorKind {
    /// The teardown returned an error.
    Failed(String),
    /// The teardown panicked. The payload message is kept when it was a string.
    Panicked(String),
}

/// A teardown action for one registry entry failed.
///
/// The entry is removed regardless; the error only reports a possible leak
/// of the external resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownError {
    id: Option<ResourceId>,
    kind: TeardownErrorKind,
}

impl TeardownError {
    /// Teardown failure with a message. The id is filled in by the registry.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: TeardownErrorKind::Failed(message.into()),
        }
    }

    pub(crate) fn panicked(id: ResourceId, message: String) -> Self {
        Self {
            id: Some(id),
            kind: TeardownErrorKind::Panicked(message),
        }
    }

    #[must_use]
    pub(crate) fn with_id(mut self, id: ResourceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Id of the entry whose teardown failed, if known.
    #[must_use]
    pub fn id(&self) -> Option<&ResourceId> {
        self.id.as_ref()
    }

    /// Failure kind.
    #[must_use]
    pub fn kind(&self) -> &TeardownErrorKind {
        &self.kind
    }
}

impl core::fmt::Display for TeardownError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let id = self.id.as_ref().map_or("<unassigned>", ResourceId::as_str);
        match &self.kind {
            TeardownErrorKind::Failed(msg) => write!(f, "teardown of {id} failed: {msg}"),
            TeardownErrorKind::Panicked(msg) => write!(f, "teardown of {id} panicked: {msg}"),
        }
    }
}

impl std::error::Error for TeardownError {}

/// Returned by [`CancelSignal::check`](crate::cancel::CancelSignal::check)
/// once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl core::fmt::Display for Canceled {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("operation canceled")
    }
}

impl std::error::Error for Canceled {}

/// Outcome of a bulk teardown ([`Registry::remove_all`](crate::registry::Registry::remove_all)
/// or [`Registry::close`](crate::registry::Registry::close)).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Entries whose teardown was invoked.
    pub attempted: usize,
    /// Entries whose teardown failed. Each was still removed.
    pub failures: Vec<TeardownError>,
}

impl TeardownReport {
    /// True when every teardown succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of teardowns that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: TeardownReport) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_id_and_message() {
        let err = TeardownError::failed("socket busy").with_id(ResourceId::from("req-1"));
        assert_eq!(err.to_string(), "teardown of req-1 failed: socket busy");
    }

    #[test]
    fn display_without_id() {
        let err = TeardownError::failed("nope");
        assert_eq!(err.to_string(), "teardown of <unassigned> failed: nope");
    }

    #[test]
    fn report_merge_and_counts() {
        let mut a = TeardownReport {
            attempted: 2,
            failures: vec![TeardownError::failed("x")],
        };
        a.merge(TeardownReport {
            attempted: 3,
            failures: Vec::new(),
        });
        assert_eq!(a.attempted, 5);
        assert_eq!(a.succeeded(), 4);
        assert!(!a.is_clean());
    }
}
