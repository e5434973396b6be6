//! Stale-while-revalidate cache.
//!
//! Every value is written twice: `<key>:fresh` with the caller's TTL and
//! `<key>:stale` with a much longer one. Readers are served from whichever
//! copy exists while a background task refreshes both.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use molar_config::CacheConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::Cache;
use crate::error::FetchError;
use crate::metrics;

const FRESH_SUFFIX: &str = ":fresh";
const STALE_SUFFIX: &str = ":stale";

#[derive(Clone)]
pub struct SwrCache {
    cache: Cache,
    stale_ttl: Duration,
    refresh_ratio: f64,
    refreshing: Arc<DashMap<String, ()>>,
}

impl SwrCache {
    pub fn new(cache: Cache, config: &CacheConfig) -> Self {
        Self::with_options(cache, config.swr_stale_ttl(), config.swr_refresh_ratio)
    }

    pub fn with_options(cache: Cache, stale_ttl: Duration, refresh_ratio: f64) -> Self {
        Self {
            cache,
            stale_ttl,
            refresh_ratio: refresh_ratio.clamp(0.0, 1.0),
            refreshing: Arc::new(DashMap::new()),
        }
    }

    pub fn fresh_key(key: &str) -> String {
        format!("{key}{FRESH_SUFFIX}")
    }

    pub fn stale_key(key: &str) -> String {
        format!("{key}{STALE_SUFFIX}")
    }

    /// Whether a background refresh for `key` is running in this process.
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.refreshing.contains_key(key)
    }

    /// Serves `key` from the fresh or stale copy, fetching inline only when
    /// neither exists.
    ///
    /// A fresh hit close to expiry (remaining TTL below `refresh_ratio` of
    /// `fresh_ttl`) and every stale hit start a background refresh. Refresh
    /// failures are logged; only an inline fetch error is returned.
    pub async fn get<T, F, Fut, E>(
        &self,
        key: &str,
        fresh_ttl: Duration,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let fresh_key = Self::fresh_key(key);
        if let Some(value) = self.cache.get::<T>(&fresh_key).await {
            if self.near_expiry(&fresh_key, fresh_ttl).await {
                tracing::debug!(key = %key, "fresh entry near expiry, refreshing");
                self.spawn_refresh(key, fresh_ttl, fetcher);
            }
            return Ok(value);
        }

        if let Some(value) = self.cache.get::<T>(&Self::stale_key(key)).await {
            metrics::record_cache_hit("stale");
            tracing::debug!(key = %key, "serving stale entry");
            self.spawn_refresh(key, fresh_ttl, fetcher);
            return Ok(value);
        }

        let value = fetcher().await.map_err(FetchError::failed)?;
        write_both(&self.cache, key, &value, fresh_ttl, self.stale_ttl).await;
        Ok(value)
    }

    /// Removes both copies of `key`.
    pub async fn invalidate(&self, key: &str) -> u64 {
        self.cache
            .delete_many(&[Self::fresh_key(key), Self::stale_key(key)])
            .await
    }

    async fn near_expiry(&self, fresh_key: &str, fresh_ttl: Duration) -> bool {
        match self.cache.kv().ttl(fresh_key).await {
            Some(remaining) => {
                remaining.as_secs_f64() < fresh_ttl.as_secs_f64() * self.refresh_ratio
            }
            None => false,
        }
    }

    fn spawn_refresh<T, F, Fut, E>(&self, key: &str, fresh_ttl: Duration, fetcher: F)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        if self.refreshing.insert(key.to_string(), ()).is_some() {
            return;
        }
        let guard = RefreshGuard {
            refreshing: Arc::clone(&self.refreshing),
            key: key.to_string(),
        };
        let cache = self.cache.clone();
        let stale_ttl = self.stale_ttl;

        tokio::spawn(async move {
            let key = guard.key.as_str();
            match fetcher().await {
                Ok(value) => {
                    write_both(&cache, key, &value, fresh_ttl, stale_ttl).await;
                    tracing::debug!(key = %key, "background refresh complete");
                }
                Err(e) => {
                    let e: Box<dyn StdError + Send + Sync> = e.into();
                    tracing::warn!(key = %key, error = %e, "background refresh failed");
                }
            }
        });
    }
}

async fn write_both<T: Serialize + ?Sized>(
    cache: &Cache,
    key: &str,
    value: &T,
    fresh_ttl: Duration,
    stale_ttl: Duration,
) {
    cache.set(&SwrCache::fresh_key(key), value, fresh_ttl).await;
    cache
        .set(&SwrCache::stale_key(key), value, stale_ttl.max(fresh_ttl))
        .await;
}

struct RefreshGuard {
    refreshing: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}
