//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration: compact output on
/// stderr, no timestamps. `RUST_LOG` takes precedence over `default`.
pub fn initialize_tracing(default: tracing::Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default).into())
        .from_env_lossy();
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // A second call (e.g. from tests) is harmless
    let _ = tracing_subscriber::fmt()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
