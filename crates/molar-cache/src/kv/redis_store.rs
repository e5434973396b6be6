//! Redis-backed [`KvStore`].

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use molar_config::RedisConfig;
use redis::AsyncCommands;

use super::KvStore;
use crate::error::KvError;

/// Create a Redis pool from configuration.
///
/// Pool creation does not open a connection; the first command does. Returns
/// `None` (and logs why) when Redis is disabled, unconfigured or the URL is
/// unusable, which callers treat as "store unavailable".
pub fn create_redis_pool(config: &RedisConfig) -> Option<Pool> {
    let url = match config.connection_url() {
        Ok(Some(url)) => url,
        Ok(None) => {
            tracing::info!("Redis not configured, caching disabled");
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Invalid Redis URL, caching disabled");
            return None;
        }
    };

    let mut redis_config = deadpool_redis::Config::from_url(url);
    let timeout = Duration::from_millis(config.timeout_ms);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => {
            tracing::info!(pool_size = config.pool_size, "Redis pool created");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create Redis pool, caching disabled");
            None
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, KvError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.del::<_, u64>(keys.to_vec()).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn().await?;
        // -2: missing, -1: no expiry
        let secs: i64 = conn.ttl(key).await?;
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), KvError> {
        let mut conn = self.conn().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
