//! Configuration for the molar caching and rate-limiting layer.
//!
//! Settings are layered in this order (later wins):
//!
//! 1. Built-in defaults (`Default` impls below)
//! 2. Optional TOML file (`molar.toml` unless a path is given)
//! 3. `MOLAR__SECTION__KEY` environment variables
//! 4. The plain KV connection variables (`REDIS_URL`/`REDIS_TOKEN`, or the
//!    alternate `KV_URL`/`KV_TOKEN` pair) and `SLOW_QUERY_THRESHOLD_MS`
//!
//! See [`loader::load_config`].

pub mod loader;
mod settings;
pub mod ttl;

pub use settings::{
    ApmConfig, AppConfig, CacheConfig, LimiterOverride, LoggingConfig, RateLimitConfig,
    RedisConfig, ServerConfig,
};

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ConfigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
