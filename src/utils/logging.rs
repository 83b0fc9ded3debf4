use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Initialize tracing/logging for the application.
///
/// `default_level` comes from configuration; a `RUST_LOG` directive in the
/// environment takes precedence. Unknown level names fall back to `info`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(parse_level(default_level)).into())
        .from_env_lossy();

    // try_init so tests and tools can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub(crate) fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
