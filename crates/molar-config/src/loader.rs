use std::path::{Path, PathBuf};

use config::{Config, Environment, File};

use crate::{AppConfig, ConfigError};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "molar.toml";

/// Primary naming convention for the KV connection.
pub const REDIS_URL_VARS: [&str; 2] = ["REDIS_URL", "KV_URL"];
pub const REDIS_TOKEN_VARS: [&str; 2] = ["REDIS_TOKEN", "KV_TOKEN"];
pub const SLOW_QUERY_THRESHOLD_VAR: &str = "SLOW_QUERY_THRESHOLD_MS";

pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();
    match path {
        Some(p) => {
            let pathbuf = PathBuf::from(p);
            if pathbuf.exists() {
                builder = builder.add_source(File::from(pathbuf));
            } else {
                tracing::warn!(path = %p, "config file not found, using defaults");
            }
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path));
            }
        }
    }
    // Environment variable overrides, e.g., MOLAR__REDIS__POOL_SIZE=20
    builder = builder.add_source(
        Environment::with_prefix("MOLAR")
            .try_parsing(true)
            .separator("__"),
    );
    let cfg = builder.build()?;
    let mut merged: AppConfig = cfg.try_deserialize()?;

    apply_env_conventions(&mut merged, |name| std::env::var(name).ok());

    merged.validate()?;
    Ok(merged)
}

pub fn load_config_with_default_path<P: AsRef<Path>>(
    path: Option<P>,
) -> Result<AppConfig, ConfigError> {
    let p = path
        .as_ref()
        .map(|p| p.as_ref().to_string_lossy().to_string());
    load_config(p.as_deref())
}

/// Applies the plain (unprefixed) environment variables deployments set for
/// the hosted KV store.
///
/// `REDIS_*` wins over `KV_*` when both are present. An unparseable
/// `SLOW_QUERY_THRESHOLD_MS` is ignored and the configured threshold kept.
pub fn apply_env_conventions(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let first_set = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
    };

    if let Some(url) = first_set(&REDIS_URL_VARS) {
        config.redis.url = Some(url);
    }
    if let Some(token) = first_set(&REDIS_TOKEN_VARS) {
        config.redis.token = Some(token);
    }

    if let Some(raw) = lookup(SLOW_QUERY_THRESHOLD_VAR) {
        match raw.trim().parse::<u64>() {
            Ok(ms) => config.apm.slow_request_threshold_ms = ms,
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "ignoring invalid SLOW_QUERY_THRESHOLD_MS");
            }
        }
    }
}
