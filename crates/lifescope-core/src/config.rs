#![forbid(unsafe_code)]

//! Lifecycle configuration.
//!
//! Diagnostics default to the build mode: on in debug builds, off in release
//! builds. Environment overrides:
//!
//! | Variable | Effect |
//! |---|---|
//! | `LIFESCOPE_DIAGNOSTICS` | `1`/`true`/`yes`/`on` enables, `0`/`false`/`no`/`off` disables |
//! | `LIFESCOPE_DIAGNOSTICS_FILE` | also append JSONL diagnostics to this path |
//! | `LIFESCOPE_CLEANUP_ON_HIGH_PRESSURE` | force cleanup on high (not only critical) memory pressure |

use std::path::PathBuf;

use crate::diagnostics::{DiagnosticsSink, DiagnosticsSinkConfig, open_or_warn};

/// Environment variable toggling diagnostic logging.
pub const ENV_DIAGNOSTICS: &str = "LIFESCOPE_DIAGNOSTICS";
/// Environment variable naming a JSONL diagnostics file.
pub const ENV_DIAGNOSTICS_FILE: &str = "LIFESCOPE_DIAGNOSTICS_FILE";
/// Environment variable enabling cleanup on high memory pressure.
pub const ENV_CLEANUP_ON_HIGH_PRESSURE: &str = "LIFESCOPE_CLEANUP_ON_HIGH_PRESSURE";

#[inline]
fn env_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration shared by a registry and the specializations built on it.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Emit `debug` events on create/complete/cancel/remove.
    pub diagnostics: bool,
    /// Optional JSONL sink for lifecycle events.
    pub sink: DiagnosticsSinkConfig,
    /// Run a forced cleanup on high memory pressure, not only on critical.
    pub cleanup_on_high_pressure: bool,
    shared: Option<DiagnosticsSink>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            diagnostics: cfg!(debug_assertions),
            sink: DiagnosticsSinkConfig::off(),
            cleanup_on_high_pressure: false,
            shared: None,
        }
    }
}

impl LifecycleConfig {
    /// Build-mode defaults with environment overrides from the process.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build-mode defaults with overrides from a custom lookup.
    #[must_use]
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(enabled) = get_env(ENV_DIAGNOSTICS).as_deref().and_then(env_flag) {
            config.diagnostics = enabled;
        }
        if let Some(path) = get_env(ENV_DIAGNOSTICS_FILE).filter(|p| !p.trim().is_empty()) {
            config.sink = DiagnosticsSinkConfig::file(PathBuf::from(path));
        }
        if let Some(enabled) = get_env(ENV_CLEANUP_ON_HIGH_PRESSURE)
            .as_deref()
            .and_then(env_flag)
        {
            config.cleanup_on_high_pressure = enabled;
        }
        config
    }

    /// Config with diagnostics and sink turned off.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            diagnostics: false,
            sink: DiagnosticsSinkConfig::off(),
            cleanup_on_high_pressure: false,
            shared: None,
        }
    }

    /// Set diagnostic logging.
    #[must_use]
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Set the JSONL sink configuration. Drops any shared sink.
    #[must_use]
    pub fn with_sink(mut self, sink: DiagnosticsSinkConfig) -> Self {
        self.sink = sink;
        self.shared = None;
        self
    }

    /// Open the configured sink once, so every registry built from this
    /// config (and its clones) appends to the same destination. No-op when
    /// already shared or when the sink is off.
    #[must_use]
    pub fn share_sink(mut self) -> Self {
        if self.shared.is_none() {
            self.shared = open_or_warn(&self.sink, "config");
        }
        self
    }

    /// Sink opened by [`share_sink`](Self::share_sink), if any.
    #[must_use]
    pub fn shared_sink(&self) -> Option<&DiagnosticsSink> {
        self.shared.as_ref()
    }

    /// Set cleanup on high memory pressure.
    #[must_use]
    pub fn with_cleanup_on_high_pressure(mut self, enabled: bool) -> Self {
        self.cleanup_on_high_pressure = enabled;
        self
    }
}
