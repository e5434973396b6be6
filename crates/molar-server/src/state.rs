use molar_cache::{ApmService, Cache, KvClient, QueryCache};
use molar_config::AppConfig;
use molar_ratelimit::RateLimiter;

/// Shared handles passed to every handler and middleware.
///
/// Built once at startup; every field is a cheap clone over shared state.
#[derive(Clone, Debug)]
pub struct AppState {
    pub cache: Cache,
    pub query_cache: QueryCache,
    pub limiter: RateLimiter,
    pub apm: ApmService,
    /// Proxy hops to skip from the right of `X-Forwarded-For`.
    pub trusted_proxy_hops: usize,
}

impl AppState {
    /// Redis-backed state. The connection is opened lazily; without a
    /// configured URL the cache always misses and the limiter counts in
    /// process memory.
    pub fn from_config(config: &AppConfig) -> Self {
        let kv = KvClient::from_config(&config.redis, &config.cache);
        let limiter = RateLimiter::from_pool(kv.redis_pool(), &config.rate_limit);
        Self::assemble(kv, limiter, config)
    }

    /// Single-instance state with every store held in process memory.
    pub fn in_memory(config: &AppConfig) -> Self {
        let kv = KvClient::with_store(
            std::sync::Arc::new(molar_cache::MemoryStore::new()),
            (&config.cache).into(),
        );
        let limiter = RateLimiter::in_memory(&config.rate_limit);
        Self::assemble(kv, limiter, config)
    }

    fn assemble(kv: KvClient, limiter: RateLimiter, config: &AppConfig) -> Self {
        let cache = Cache::with_scan_batch_size(kv, config.cache.scan_batch_size);
        Self {
            query_cache: QueryCache::new(cache.clone(), &config.cache),
            apm: ApmService::new(cache.clone(), &config.apm),
            limiter,
            cache,
            trusted_proxy_hops: config.server.trusted_proxy_hops,
        }
    }
}
