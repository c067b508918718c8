#![forbid(unsafe_code)]

//! Logging setup.
//!
//! Library code only emits `tracing` events. Hosts that want JSON lines on
//! stderr can enable the `tracing-json` feature and call
//! [`init_json_logging`] once at startup. The filter comes from `RUST_LOG`,
//! defaulting to `lifescope=info`.

#[cfg(feature = "tracing-json")]
use tracing_subscriber::EnvFilter;

/// Default filter directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "lifescope=info";

/// Install a JSON `tracing` subscriber. Returns `false` if one was already set.
#[cfg(feature = "tracing-json")]
pub fn init_json_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
