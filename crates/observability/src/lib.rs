//! Tracing and logging (shared setup).

/// Initialize process-wide tracing from `RUST_LOG` and `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
/// An unrecognised `LOG_FORMAT` falls back to the default configuration.
pub fn init() {
    let config = ObservabilityConfig::from_env().unwrap_or_default();
    subscriber::init_with(&config);
}

/// Subscriber configuration and installation.
pub mod subscriber;

pub use subscriber::{LogFormat, ObservabilityConfig, ParseLogFormatError, init_with};
