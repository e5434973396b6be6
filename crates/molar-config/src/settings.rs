use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Backing key-value store connection
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache façade tuning
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rate limiter budgets
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Request telemetry aggregation
    #[serde(default)]
    pub apm: ApmConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::validation("server.port must be > 0"));
        }
        if self.redis.pool_size == 0 {
            return Err(ConfigError::validation("redis.pool_size must be > 0"));
        }
        if self.cache.max_retries == 0 {
            return Err(ConfigError::validation("cache.max_retries must be > 0"));
        }
        if self.cache.max_payload_bytes == 0 {
            return Err(ConfigError::validation("cache.max_payload_bytes must be > 0"));
        }
        if self.cache.scan_batch_size == 0 {
            return Err(ConfigError::validation("cache.scan_batch_size must be > 0"));
        }
        if !(self.cache.swr_refresh_ratio > 0.0 && self.cache.swr_refresh_ratio < 1.0) {
            return Err(ConfigError::validation(
                "cache.swr_refresh_ratio must be between 0 and 1 (exclusive)",
            ));
        }
        for (class, limiter) in &self.rate_limit.overrides {
            if limiter.points == 0 {
                return Err(ConfigError::validation(format!(
                    "rate_limit.overrides.{class}.points must be > 0"
                )));
            }
            if limiter.duration.is_zero() {
                return Err(ConfigError::validation(format!(
                    "rate_limit.overrides.{class}.duration must be > 0"
                )));
            }
        }
        // The URL is only parsed when a connection is actually built; reject garbage early.
        self.redis.connection_url()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `X-Forwarded-For` entries to skip from the right before taking the
    /// client address. `0` takes the entry the nearest proxy appended; raise
    /// it by one for every further proxy in the chain.
    #[serde(default)]
    pub trusted_proxy_hops: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trusted_proxy_hops: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis connection configuration.
///
/// Without a URL the cache and the distributed rate limiter run in degraded
/// mode: every cache read misses and rate limiting uses per-instance counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Set to false to ignore a configured URL
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Connection URL (e.g., "rediss://eu1-example.upstash.io:6379")
    #[serde(default)]
    pub url: Option<String>,

    /// Access token, sent as the connection password
    #[serde(default)]
    pub token: Option<String>,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: None,
            token: None,
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// The URL to connect with, token applied as password.
    ///
    /// Returns `Ok(None)` when the store is disabled or no URL is configured.
    pub fn connection_url(&self) -> Result<Option<String>, ConfigError> {
        let raw = match (&self.url, self.enabled) {
            (Some(url), true) if !url.trim().is_empty() => url.trim(),
            _ => return Ok(None),
        };

        let mut url = url::Url::parse(raw)?;
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            if url.password().is_none() {
                url.set_password(Some(token)).map_err(|()| {
                    ConfigError::validation("redis.url cannot carry a password")
                })?;
            }
        }
        Ok(Some(url.to_string()))
    }

    pub fn is_configured(&self) -> bool {
        self.enabled && self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Attempts for a single GET before it is treated as a miss
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential GET backoff (delay = base * 2^attempt)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Largest serialized payload that will be written
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// SCAN COUNT hint used by pattern invalidation
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// Lifetime of the `:stale` copy kept by the stale-while-revalidate cache
    #[serde(default = "default_swr_stale_ttl_secs")]
    pub swr_stale_ttl_secs: u64,

    /// Fraction of the fresh TTL below which a fresh hit triggers a refresh
    #[serde(default = "default_swr_refresh_ratio")]
    pub swr_refresh_ratio: f64,

    /// TTL of the in-process tier in front of query results
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,

    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_scan_batch_size() -> usize {
    100
}

fn default_swr_stale_ttl_secs() -> u64 {
    86_400
}

fn default_swr_refresh_ratio() -> f64 {
    0.1
}

fn default_local_ttl_secs() -> u64 {
    30
}

fn default_local_max_entries() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            scan_batch_size: default_scan_batch_size(),
            swr_stale_ttl_secs: default_swr_stale_ttl_secs(),
            swr_refresh_ratio: default_swr_refresh_ratio(),
            local_ttl_secs: default_local_ttl_secs(),
            local_max_entries: default_local_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn swr_stale_ttl(&self) -> Duration {
        Duration::from_secs(self.swr_stale_ttl_secs)
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }
}

/// Rate limiting configuration.
///
/// Built-in budgets apply to every limiter class; `overrides` replaces the
/// budget of a class by name (`api`, `auth`, `upload`, `password_reset`,
/// `email_verification`, `invitation`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub overrides: BTreeMap<String, LimiterOverride>,
}

fn default_rate_limit_enabled() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            overrides: BTreeMap::new(),
        }
    }
}

/// Budget for one limiter class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterOverride {
    /// Requests allowed per window.
    pub points: u32,

    /// Window length.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Extra denial period once the budget is exhausted.
    #[serde(default, with = "humantime_serde")]
    pub block_duration: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApmConfig {
    #[serde(default = "default_apm_enabled")]
    pub enabled: bool,

    /// Requests slower than this are logged at warn level
    #[serde(default = "default_slow_request_threshold_ms")]
    pub slow_request_threshold_ms: u64,
}

fn default_apm_enabled() -> bool {
    true
}

fn default_slow_request_threshold_ms() -> u64 {
    500
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            enabled: default_apm_enabled(),
            slow_request_threshold_ms: default_slow_request_threshold_ms(),
        }
    }
}

impl ApmConfig {
    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }
}
