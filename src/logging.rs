//! Tracing bootstrap for the `studysync` binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,studysync=info";

/// Install the global tracing subscriber, writing to stderr.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `STUDYSYNC_LOG`
/// 3) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    env::var("STUDYSYNC_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
