use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by a backing store.
///
/// These never escape the cache façade; they are logged and turned into a
/// miss, a `false` write or a partial count.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl KvError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Errors converting values to and from their cached wire form.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of the caller-supplied fetch behind `get_or_set`.
///
/// Cloneable so that every deduplicated waiter receives the same error.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(Arc<dyn StdError + Send + Sync>),

    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    pub fn failed(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Failed(Arc::from(err.into()))
    }

    /// The error returned by the fetcher, if the fetch ran to completion.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Failed(err) => Some(err.as_ref()),
            Self::Aborted(_) => None,
        }
    }
}
