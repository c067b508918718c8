#![forbid(unsafe_code)]

//! Lifecycle diagnostics: `tracing` events plus an optional JSONL sink.
//!
//! Diagnostics are non-contractual. When [`LifecycleConfig::diagnostics`] is
//! off nothing is logged at `debug`; teardown failures are reported at `warn`
//! by the registry either way.
//!
//! JSONL lines go to a [`DiagnosticsSink`]. A sink is a cloneable handle to
//! one open destination; every clone appends to the same writer under one
//! lock, so lines from several registries keep their call order.
//! [`LifecycleConfig::share_sink`] opens the sink once for a whole scope.
//!
//! [`LifecycleConfig::diagnostics`]: crate::config::LifecycleConfig::diagnostics
//! [`LifecycleConfig::share_sink`]: crate::config::LifecycleConfig::share_sink

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;
use web_time::Instant;

use crate::config::LifecycleConfig;
use crate::id::ResourceId;

/// In-memory line buffer, mostly for tests and debug panels.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLog {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("memory log lock poisoned").clone()
    }

    /// Drop all buffered lines.
    pub fn clear(&self) {
        self.lines.lock().expect("memory log lock poisoned").clear();
    }

    fn push_text(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = self.lines.lock().expect("memory log lock poisoned");
        lines.extend(text.lines().map(str::to_owned));
    }
}

/// Publishes each complete line as soon as it is written; a trailing
/// partial line waits for the next newline or `flush`.
struct MemoryLines {
    log: MemoryLog,
    partial: Vec<u8>,
}

impl Write for MemoryLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        if let Some(end) = self.partial.iter().rposition(|&b| b == b'\n') {
            let rest = self.partial.split_off(end + 1);
            self.log.push_text(&self.partial);
            self.partial = rest;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.partial.is_empty() {
            self.log.push_text(&self.partial);
            self.partial.clear();
        }
        Ok(())
    }
}

/// Where JSONL lines end up.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// Process stdout.
    Stdout,
    /// File opened in append mode.
    File(PathBuf),
    /// In-memory buffer.
    Memory(MemoryLog),
}

/// Which sink, if any, to open, and how eagerly to flush it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSinkConfig {
    target: Option<SinkTarget>,
    buffered: bool,
}

impl DiagnosticsSinkConfig {
    /// No sink.
    #[must_use]
    pub fn off() -> Self {
        Self::default()
    }

    /// Lines to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::to(SinkTarget::Stdout)
    }

    /// Lines appended to `path`.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::to(SinkTarget::File(path.into()))
    }

    /// Lines collected in `log`.
    #[must_use]
    pub fn memory(log: MemoryLog) -> Self {
        Self::to(SinkTarget::Memory(log))
    }

    /// Lines to an arbitrary target.
    #[must_use]
    pub fn to(target: SinkTarget) -> Self {
        Self {
            target: Some(target),
            buffered: false,
        }
    }

    /// Buffer output instead of flushing after every line. Buffered lines
    /// are written out on [`DiagnosticsSink::flush`] and when the last
    /// handle to the sink is dropped.
    #[must_use]
    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// Whether a sink will be opened.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Configured target.
    #[must_use]
    pub fn target(&self) -> Option<&SinkTarget> {
        self.target.as_ref()
    }

    /// Whether per-line flushing is off.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Open the configured target. `Ok(None)` when off.
    pub fn open(&self) -> io::Result<Option<DiagnosticsSink>> {
        let Some(target) = &self.target else {
            return Ok(None);
        };
        let out: Box<dyn Write + Send> = match target {
            SinkTarget::Stdout => Box::new(io::stdout()),
            SinkTarget::File(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
            SinkTarget::Memory(log) => Box::new(MemoryLines {
                log: log.clone(),
                partial: Vec::new(),
            }),
        };
        Ok(Some(DiagnosticsSink {
            state: Arc::new(Mutex::new(SinkState {
                out: BufWriter::new(out),
                buffered: self.buffered,
            })),
        }))
    }
}

struct SinkState {
    out: BufWriter<Box<dyn Write + Send>>,
    buffered: bool,
}

impl Drop for SinkState {
    fn drop(&mut self) {
        if let Err(err) = self.out.flush() {
            tracing::warn!(error = %err, "lifescope: diagnostics sink flush on close failed");
        }
    }
}

/// Handle to one open JSONL destination. Clones share the destination.
#[derive(Clone)]
pub struct DiagnosticsSink {
    state: Arc<Mutex<SinkState>>,
}

impl std::fmt::Debug for DiagnosticsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsSink")
            .field("handles", &Arc::strong_count(&self.state))
            .finish_non_exhaustive()
    }
}

impl DiagnosticsSink {
    /// Append `line` and a newline.
    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().expect("diagnostics sink lock poisoned");
        state.out.write_all(line.as_bytes())?;
        state.out.write_all(b"\n")?;
        if !state.buffered {
            state.out.flush()?;
        }
        Ok(())
    }

    /// Push buffered lines through to the destination.
    pub fn flush(&self) -> io::Result<()> {
        self.state.lock().expect("diagnostics sink lock poisoned").out.flush()
    }

    /// True when both handles write to the same destination.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    /// Entry stored in a registry.
    Registered,
    /// Existing entry torn down because its id was reused.
    Replaced,
    /// Entry torn down individually.
    Removed,
    /// Entry dropped without teardown because its resource already finished.
    Released,
    /// Bulk teardown.
    Cleared,
    /// Owning scope ended.
    Closed,
    /// A teardown failed.
    TeardownFailed,
    /// Request started.
    RequestCreated,
    /// Request future settled.
    RequestSettled,
    /// Request canceled.
    RequestCanceled,
    /// Event listener attached.
    ListenerAdded,
    /// Event listener detached.
    ListenerRemoved,
    /// Timer armed.
    TimerCreated,
    /// Timer callback ran.
    TimerFired,
    /// Timer cleared.
    TimerCleared,
    /// Forced cleanup of a whole scope.
    ForcedCleanup,
    /// Cache dropped expired or least recently used entries.
    CacheCleaned,
    /// Cache entries written to its store.
    CachePersisted,
}

impl LifecycleEventKind {
    /// Stable event name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Replaced => "replaced",
            Self::Removed => "removed",
            Self::Released => "released",
            Self::Cleared => "cleared",
            Self::Closed => "closed",
            Self::TeardownFailed => "teardown_failed",
            Self::RequestCreated => "request_created",
            Self::RequestSettled => "request_settled",
            Self::RequestCanceled => "request_canceled",
            Self::ListenerAdded => "listener_added",
            Self::ListenerRemoved => "listener_removed",
            Self::TimerCreated => "timer_created",
            Self::TimerFired => "timer_fired",
            Self::TimerCleared => "timer_cleared",
            Self::ForcedCleanup => "forced_cleanup",
            Self::CacheCleaned => "cache_cleaned",
            Self::CachePersisted => "cache_persisted",
        }
    }
}

/// One JSONL diagnostics line.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    /// Per-source sequence number.
    pub seq: u64,
    /// Microseconds since the first event in this process.
    pub timestamp_us: u64,
    /// Registry category (`request`, `listener`, ...).
    pub category: String,
    /// Event kind.
    pub kind: LifecycleEventKind,
    /// Entry id, when the event concerns one entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Free-form context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Live entries after the event.
    pub active: usize,
}

impl LifecycleEvent {
    /// Serialize to one JSON line.
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

fn timestamp_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

pub(crate) fn open_or_warn(config: &DiagnosticsSinkConfig, category: &str) -> Option<DiagnosticsSink> {
    match config.open() {
        Ok(sink) => sink,
        Err(err) => {
            tracing::warn!(category, error = %err, "lifescope: diagnostics sink unavailable");
            None
        }
    }
}

/// Emits lifecycle events for one registry or specialization.
#[derive(Debug)]
pub struct Diagnostics {
    category: String,
    enabled: bool,
    sink: Option<DiagnosticsSink>,
    seq: std::cell::Cell<u64>,
}

impl Diagnostics {
    /// Build from config. Uses the config's shared sink when it has one,
    /// otherwise opens its own. A sink that fails to open is logged and
    /// skipped.
    #[must_use]
    pub fn new(category: &str, config: &LifecycleConfig) -> Self {
        let sink = config
            .shared_sink()
            .cloned()
            .or_else(|| open_or_warn(&config.sink, category));
        Self {
            category: category.to_owned(),
            enabled: config.diagnostics,
            sink,
            seq: std::cell::Cell::new(0),
        }
    }

    /// Diagnostics that never log.
    #[must_use]
    pub fn silent(category: &str) -> Self {
        Self::new(category, &LifecycleConfig::quiet())
    }

    /// Whether `debug` lifecycle logging is on.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Category tag.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Record one event.
    pub fn emit(
        &self,
        kind: LifecycleEventKind,
        id: Option<&ResourceId>,
        detail: Option<&str>,
        active: usize,
    ) {
        if self.enabled {
            tracing::debug!(
                category = %self.category,
                event = kind.as_str(),
                id = id.map(ResourceId::as_str),
                detail,
                active,
                "lifescope"
            );
        }
        let Some(sink) = &self.sink else {
            return;
        };
        let seq = self.seq.get();
        self.seq.set(seq.saturating_add(1));
        let event = LifecycleEvent {
            seq,
            timestamp_us: timestamp_us(),
            category: self.category.clone(),
            kind,
            id: id.map(|id| id.as_str().to_owned()),
            detail: detail.map(str::to_owned),
            active,
        };
        if let Err(err) = sink.append_line(&event.to_jsonl()) {
            tracing::warn!(category = %self.category, error = %err, "lifescope: diagnostics write failed");
        }
    }
}
