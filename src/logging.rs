//! Tracing subscriber setup

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::constants::logging;

/// Build the filter: `RUST_LOG` first, then the configured level for this crate
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let directive = format!("{}={}", logging::CRATE_TARGET, config.level.to_ascii_lowercase());
    let filter = EnvFilter::from_default_env();
    match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(e) => {
            eprintln!("Ignoring invalid log level '{}': {}", config.level, e);
            filter
        }
    }
}

/// Install a global `fmt` subscriber
///
/// Returns `false` if a global subscriber was already installed (for example
/// by a test harness or the embedding application).
pub fn init_logging(config: &LoggingConfig) -> bool {
    fmt()
        .with_env_filter(build_filter(config))
        .with_target(false)
        .with_ansi(config.colored_output)
        .try_init()
        .is_ok()
}
