//! Shared logging initialization for fleetbeat binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level(raw: Option<&str>) -> tracing::Level {
    match raw.unwrap_or("info").to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Level requested through `FLEETBEAT_LOG` (default `info`).
pub fn env_level() -> tracing::Level {
    parse_level(std::env::var("FLEETBEAT_LOG").ok().as_deref())
}

/// Initialize process-level tracing output from `FLEETBEAT_LOG`.
///
/// Safe to call multiple times; only the first call installs a subscriber.
/// Best-effort, never returns an error.
pub fn init() {
    init_with_level(env_level());
}

/// Same as [`init`] with an explicit level (e.g. from a `--verbose` flag).
pub fn init_with_level(level: tracing::Level) {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
    let _ = INIT.set(());
}
