//! Tracing subscriber setup

use crate::config::LogConfig;
use crate::error::ConfigError;
use tracing_subscriber::EnvFilter;

/// Parse a filter directive such as `info` or `medic_core=debug,info`
pub fn filter_for(directive: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(directive)
        .map_err(|e| ConfigError::Invalid(format!("bad log filter '{directive}': {e}")))
}

/// `RUST_LOG` when set and non-empty, the configured level otherwise
#[must_use]
pub fn pick_directive<'a>(config: &'a LogConfig, rust_log: Option<&'a str>) -> &'a str {
    rust_log
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(&config.level)
}

/// Install the global subscriber; human-readable or JSON lines
pub fn init_tracing(config: &LogConfig) -> Result<(), ConfigError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_for(pick_directive(config, rust_log.as_deref()))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Invalid(format!("cannot install log subscriber: {e}")))
}
