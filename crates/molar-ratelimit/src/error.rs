use thiserror::Error;

/// Backend failures. The limiter never surfaces these to callers; they
/// trigger the fallback backend or a fail-open decision.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Unexpected script reply: {0}")]
    Reply(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}
