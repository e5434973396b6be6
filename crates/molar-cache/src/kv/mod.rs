//! Key-value client adapter.
//!
//! [`KvClient`] wraps whichever [`KvStore`] backs the process (Redis in
//! production, [`MemoryStore`] for single-instance mode and tests) and owns the
//! policies every caller relies on:
//!
//! - **Lazy connection**: the Redis pool is built on first use from
//!   [`RedisConfig`]; without a URL the client is permanently unavailable.
//! - **Graceful degradation**: every operation returns its empty value
//!   (`None`, `false`, `0`) instead of an error when the store is missing or
//!   failing.
//! - **GET retries**: transport errors are retried with exponential backoff,
//!   then reported as a miss.
//! - **Size guard**: payloads above the configured limit are never written.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, create_redis_pool};

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use molar_config::{CacheConfig, RedisConfig};

use crate::error::KvError;

/// Minimal command set the cache layer needs from a backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// `SET key value EX ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;

    /// `DEL key [key ...]`, returns the number of keys removed.
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Remaining lifetime of a key; `None` if it is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    /// `SCAN cursor MATCH pattern COUNT count`
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), KvError>;

    /// Short backend label for logs and health output.
    fn backend_name(&self) -> &'static str;
}

/// Retry and size policies applied by [`KvClient`].
#[derive(Debug, Clone)]
pub struct KvOptions {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_payload_bytes: usize,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for KvOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            retry_base_delay: config.retry_base_delay(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

enum Source {
    Redis(RedisConfig),
    Store(Arc<dyn KvStore>),
    Unavailable,
}

#[derive(Default)]
struct Resolved {
    store: Option<Arc<dyn KvStore>>,
    pool: Option<Pool>,
}

struct KvInner {
    source: Source,
    resolved: OnceLock<Resolved>,
    options: KvOptions,
}

/// Process-wide handle to the backing store. Cheap to clone.
#[derive(Clone)]
pub struct KvClient {
    inner: Arc<KvInner>,
}

impl fmt::Debug for KvClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvClient")
            .field("options", &self.inner.options)
            .field("initialized", &self.inner.resolved.get().is_some())
            .finish()
    }
}

impl KvClient {
    /// Client that connects to Redis on first use.
    pub fn from_config(redis: &RedisConfig, cache: &CacheConfig) -> Self {
        Self::with_source(Source::Redis(redis.clone()), KvOptions::from(cache))
    }

    /// Client over an already constructed store.
    pub fn with_store(store: Arc<dyn KvStore>, options: KvOptions) -> Self {
        Self::with_source(Source::Store(store), options)
    }

    /// Client for a single-instance deployment backed by process memory.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), KvOptions::default())
    }

    /// Client that behaves as if no store was configured.
    pub fn unavailable() -> Self {
        Self::with_source(Source::Unavailable, KvOptions::default())
    }

    fn with_source(source: Source, options: KvOptions) -> Self {
        Self {
            inner: Arc::new(KvInner {
                source,
                resolved: OnceLock::new(),
                options,
            }),
        }
    }

    pub fn options(&self) -> &KvOptions {
        &self.inner.options
    }

    fn resolved(&self) -> &Resolved {
        self.inner.resolved.get_or_init(|| match &self.inner.source {
            Source::Redis(config) => match create_redis_pool(config) {
                Some(pool) => Resolved {
                    store: Some(Arc::new(RedisStore::new(pool.clone()))),
                    pool: Some(pool),
                },
                None => Resolved::default(),
            },
            Source::Store(store) => Resolved {
                store: Some(Arc::clone(store)),
                pool: None,
            },
            Source::Unavailable => {
                tracing::info!("no key-value store configured, caching disabled");
                Resolved::default()
            }
        })
    }

    fn store(&self) -> Option<&Arc<dyn KvStore>> {
        self.resolved().store.as_ref()
    }

    /// The shared Redis pool, when the client is Redis-backed.
    ///
    /// Lets other components (the distributed rate limiter) reuse the
    /// process-wide connection instead of opening their own.
    pub fn redis_pool(&self) -> Option<Pool> {
        self.resolved().pool.clone()
    }

    /// Whether a store is configured (not whether it is currently reachable).
    pub fn is_available(&self) -> bool {
        self.store().is_some()
    }

    /// Active backend label (`redis`, `memory`, or `none`).
    pub fn backend_name(&self) -> &'static str {
        self.store().map_or("none", |s| s.backend_name())
    }

    /// Round-trips an `EXISTS` on a fixed key; used by health checks.
    pub async fn ping(&self) -> bool {
        match self.store() {
            Some(store) => store.exists("molar:health").await.is_ok(),
            None => false,
        }
    }

    /// Reads a raw payload, retrying transport errors with exponential backoff.
    pub async fn get(&self, key: &str) -> Option<String> {
        let store = self.store()?;
        let options = &self.inner.options;
        let mut attempt: u32 = 0;
        loop {
            match store.get(key).await {
                Ok(value) => return value,
                Err(e) => {
                    attempt += 1;
                    if attempt >= options.max_retries {
                        tracing::warn!(
                            key = %key,
                            attempts = attempt,
                            error = %e,
                            "KV GET failed, treating as cache miss"
                        );
                        return None;
                    }
                    let delay = options.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "KV GET failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Writes a raw payload with a TTL. Returns whether the write took effect.
    pub async fn set(&self, key: &str, payload: &str, ttl: Duration) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        let max = self.inner.options.max_payload_bytes;
        if payload.len() > max {
            tracing::warn!(
                key = %key,
                size = payload.len(),
                max_size = max,
                "payload exceeds cache size limit, skipping write"
            );
            return false;
        }
        match store.set_ex(key, payload, ttl_secs(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "KV SET error");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.delete_many(&[key.to_string()]).await > 0
    }

    /// Batched delete; an empty list issues no command.
    pub async fn delete_many(&self, keys: &[String]) -> u64 {
        match self.try_delete_many(keys).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(keys = keys.len(), error = %e, "KV DEL error");
                0
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        match store.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "KV EXISTS error");
                false
            }
        }
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let store = self.store()?;
        match store.ttl(key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "KV TTL error");
                None
            }
        }
    }

    /// One `SCAN` step. Errors end the iteration (`(0, [])`).
    pub async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> (u64, Vec<String>) {
        match self.try_scan(cursor, pattern, count).await {
            Ok(step) => step,
            Err(e) => {
                tracing::warn!(pattern = %pattern, cursor, error = %e, "KV SCAN error");
                (0, Vec::new())
            }
        }
    }

    pub(crate) async fn try_scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), KvError> {
        let store = self
            .store()
            .ok_or_else(|| KvError::unavailable("no key-value store configured"))?;
        store.scan(cursor, pattern, count).await
    }

    pub(crate) async fn try_delete_many(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let store = self
            .store()
            .ok_or_else(|| KvError::unavailable("no key-value store configured"))?;
        store.del(keys).await
    }
}

/// Whole seconds for `EX`, rounded up and never zero.
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store whose GET fails a configurable number of times before succeeding.
    struct FlakyStore {
        failures_left: AtomicU32,
        calls: AtomicU32,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                inner: MemoryStore::new(),
            }
        }
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(KvError::unavailable("connection reset"));
            }
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
            self.inner.set_ex(key, value, ttl_secs).await
        }

        async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
            self.inner.del(keys).await
        }

        async fn exists(&self, key: &str) -> Result<bool, KvError> {
            self.inner.exists(key).await
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
            self.inner.ttl(key).await
        }

        async fn scan(
            &self,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> Result<(u64, Vec<String>), KvError> {
            self.inner.scan(cursor, pattern, count).await
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_unavailable_client_degrades() {
        let kv = KvClient::unavailable();
        assert!(!kv.is_available());
        assert_eq!(kv.get("k").await, None);
        assert!(!kv.set("k", "v", Duration::from_secs(60)).await);
        assert!(!kv.delete("k").await);
        assert_eq!(kv.delete_many(&["k".to_string()]).await, 0);
        assert!(!kv.exists("k").await);
        assert_eq!(kv.scan(0, "*", 100).await, (0, Vec::new()));
        assert_eq!(kv.backend_name(), "none");
        assert!(kv.redis_pool().is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_redis_is_unavailable() {
        let kv = KvClient::from_config(&RedisConfig::default(), &CacheConfig::default());
        assert!(!kv.is_available());
        assert_eq!(kv.get("anything").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_retries_then_succeeds() {
        let store = Arc::new(FlakyStore::new(2));
        store.inner.set_ex("k", "\"v\"", 60).await.unwrap();
        let kv = KvClient::with_store(store.clone(), KvOptions::default());

        assert_eq!(kv.get("k").await.as_deref(), Some("\"v\""));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_gives_up_after_max_retries() {
        let store = Arc::new(FlakyStore::new(10));
        store.inner.set_ex("k", "\"v\"", 60).await.unwrap();
        let kv = KvClient::with_store(store.clone(), KvOptions::default());

        let started = tokio::time::Instant::now();
        assert_eq!(kv.get("k").await, None);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff between the three attempts
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_size_guard_rejects_large_payload() {
        let options = KvOptions {
            max_payload_bytes: 16,
            ..KvOptions::default()
        };
        let kv = KvClient::with_store(Arc::new(MemoryStore::new()), options);

        assert!(kv.set("small", "0123456789", Duration::from_secs(60)).await);
        assert!(!kv.set("large", &"x".repeat(17), Duration::from_secs(60)).await);
        assert_eq!(kv.get("large").await, None);
        assert!(kv.exists("small").await);
    }

    #[tokio::test]
    async fn test_delete_many_empty_is_zero() {
        let kv = KvClient::in_memory();
        assert_eq!(kv.delete_many(&[]).await, 0);
    }

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
