// Tracing setup. RUST_LOG, when set, overrides the configured level for the
// whole process lifetime; otherwise the level from `[logging]` is applied
// through a reload handle once the config file has been read.
use std::sync::OnceLock;

use molar_config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

const FALLBACK_DIRECTIVE: &str = "info";

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Installs the global subscriber at `info` until the config is loaded.
pub fn init_tracing() {
    let filter = if rust_log_set() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FALLBACK_DIRECTIVE))
    } else {
        EnvFilter::new(FALLBACK_DIRECTIVE)
    };

    let (reload_layer, handle) = reload::Layer::new(filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to the configured level. A directive that does not parse keeps
/// the current filter.
pub fn apply_logging_config(config: &LoggingConfig) {
    if rust_log_set() {
        tracing::debug!("RUST_LOG set, ignoring configured log level");
        return;
    }
    let Some(handle) = LOG_RELOAD_HANDLE.get() else {
        return;
    };

    match level_filter(&config.level) {
        Ok(filter) => {
            if let Err(e) = handle.modify(|f| *f = filter) {
                tracing::warn!(error = %e, "failed to apply log level");
            }
        }
        Err(e) => {
            tracing::warn!(level = %config.level, error = %e, "invalid log level, keeping current")
        }
    }
}

fn level_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    let level = level.trim();
    EnvFilter::try_new(if level.is_empty() { FALLBACK_DIRECTIVE } else { level })
}

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some_and(|v| !v.is_empty())
}
