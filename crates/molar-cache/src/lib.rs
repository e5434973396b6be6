//! Caching layer for the Molar practice-management platform.
//!
//! - [`KvClient`]: lazily connected Redis (or in-memory) store that degrades to
//!   "always miss" instead of failing callers.
//! - [`Cache`]: typed façade with date-aware serialization, single-flight
//!   `get_or_set` and SCAN-based pattern invalidation.
//! - [`SwrCache`]: stale-while-revalidate variant with background refresh.
//! - [`QueryCache`]: deterministic keys for tenant records, listings and
//!   reports, with a short-lived in-process tier.
//! - [`ApmService`]: request statistics aggregated into time buckets.

pub mod apm;
pub mod cache;
pub mod codec;
pub mod error;
mod invalidation;
pub mod kv;
pub mod metrics;
pub mod pattern;
pub mod query;
mod stampede;
pub mod swr;

pub use apm::{
    ApmService, Granularity, HistoryError, HistorySink, NoopHistory, RequestSample, StatsBucket,
};
pub use cache::Cache;
pub use codec::CacheValue;
pub use error::{CodecError, FetchError, KvError};
pub use kv::{KvClient, KvOptions, KvStore, MemoryStore, RedisStore};
pub use query::{EntityKind, QueryCache, build_key, filter_digest};
pub use swr::SwrCache;

pub use molar_config::ttl;
