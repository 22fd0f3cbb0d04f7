//! Tracing subscriber setup
//!
//! The engine only emits `tracing` events; installing a subscriber is left
//! to the embedder. These helpers cover the common case of a fmt subscriber
//! filtered by `RUST_LOG` (default `info`).

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info";

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a text subscriber; silently keeps an existing one
pub fn init() {
    let _ = try_init(DEFAULT_FILTER, LogFormat::Text);
}

/// Install a subscriber using `RUST_LOG`, falling back to `filter`
///
/// Fails if a global subscriber is already set.
pub fn try_init(
    filter: &str,
    format: LogFormat,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(filter));
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_fallback_uses_default() {
        // Must not panic on a malformed directive
        let _filter = env_filter("not a [valid filter");
    }

    #[test]
    fn test_second_init_is_harmless() {
        init();
        init();
        assert!(try_init(DEFAULT_FILTER, LogFormat::Json).is_err());
    }
}
