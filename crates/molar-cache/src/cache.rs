//! Typed read-through cache over [`KvClient`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use molar_config::{CacheConfig, RedisConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::error::FetchError;
use crate::kv::KvClient;
use crate::metrics;
use crate::stampede::{Joined, StampedeGuard};

const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

pub(crate) struct CacheInner {
    pub(crate) kv: KvClient,
    pub(crate) stampede: StampedeGuard,
    pub(crate) scan_batch_size: usize,
}

/// Cache façade: typed values, single-flight misses, pattern invalidation.
///
/// Construct once per process and clone where needed; clones share the
/// store handle and the in-flight fetch map.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("kv", &self.inner.kv)
            .field("in_flight", &self.inner.stampede.in_flight())
            .finish()
    }
}

impl Cache {
    pub fn new(kv: KvClient) -> Self {
        Self::with_scan_batch_size(kv, DEFAULT_SCAN_BATCH_SIZE)
    }

    pub fn with_scan_batch_size(kv: KvClient, scan_batch_size: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                kv,
                stampede: StampedeGuard::default(),
                scan_batch_size: scan_batch_size.max(1),
            }),
        }
    }

    /// Redis-backed cache that connects lazily on first use.
    pub fn from_config(redis: &RedisConfig, cache: &CacheConfig) -> Self {
        Self::with_scan_batch_size(KvClient::from_config(redis, cache), cache.scan_batch_size)
    }

    pub fn kv(&self) -> &KvClient {
        &self.inner.kv
    }

    pub fn is_available(&self) -> bool {
        self.inner.kv.is_available()
    }

    /// Number of `get_or_set` fetches currently running in this process.
    pub fn in_flight(&self) -> usize {
        self.inner.stampede.in_flight()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(payload) = self.inner.kv.get(key).await else {
            metrics::record_cache_miss("kv");
            return None;
        };
        match codec::decode(&payload) {
            Ok(value) => {
                metrics::record_cache_hit("kv");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable cache entry, evicting");
                self.inner.kv.delete(key).await;
                metrics::record_cache_miss("kv");
                None
            }
        }
    }

    /// Stores `value` for `ttl`. Returns `false` if the write was skipped.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let payload = match codec::encode(value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode cache value");
                metrics::record_write_skipped();
                return false;
            }
        };
        let written = self.inner.kv.set(key, &payload, ttl).await;
        if !written {
            metrics::record_write_skipped();
        }
        written
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.kv.delete(key).await
    }

    pub async fn delete_many(&self, keys: &[String]) -> u64 {
        self.inner.kv.delete_many(keys).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.inner.kv.exists(key).await
    }

    /// Returns the cached value for `key`, or runs `fetcher` and caches its result.
    ///
    /// Concurrent misses for the same key in this process share one fetch:
    /// the first caller starts it on a spawned task, later callers wait for
    /// the same outcome. The spawned fetch also writes the value, so the
    /// entry lands even if every caller is cancelled.
    ///
    /// Only the fetcher's error is returned; store failures degrade to a
    /// miss or a skipped write.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }

        match self.inner.stampede.join(key) {
            Joined::Follower(flight) => {
                metrics::record_cache_fetch("follower");
                let shared = flight.await?;
                match shared.downcast::<T>() {
                    Ok(value) => Ok(T::clone(&value)),
                    Err(_) => {
                        tracing::warn!(
                            key = %key,
                            "in-flight fetch produced a different type, fetching directly"
                        );
                        fetcher().await.map_err(FetchError::failed)
                    }
                }
            }
            Joined::Leader(lease) => {
                metrics::record_cache_fetch("leader");
                let pending = fetcher();
                let cache = self.clone();
                let owned_key = key.to_string();
                let flight = lease.run(async move {
                    let value = pending.await.map_err(FetchError::failed)?;
                    cache.set(&owned_key, &value, ttl).await;
                    Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
                });
                let shared = flight.await?;
                shared
                    .downcast::<T>()
                    .map(|value| T::clone(&value))
                    .map_err(|_| FetchError::Aborted("fetch produced an unexpected type".into()))
            }
        }
    }
}
