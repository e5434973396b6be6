//! Domain query cache.
//!
//! Builds deterministic keys for tenant-scoped records, listings and
//! analytics reports, and keeps a short-lived in-process copy of recently
//! served payloads in front of the shared store.
//!
//! Key layout:
//!
//! | Query | Key |
//! |---|---|
//! | one record | `query:tenant:<tenant>:<kind>:<id>` |
//! | listing | `query:tenant:<tenant>:<kind>:list:<filter digest>` |
//! | tenant report | `query:tenant:<tenant>:analytics:<report>:<params digest>` |
//! | platform report | `query:platform:analytics:<report>:<params digest>` |

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use molar_config::{CacheConfig, ttl};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::codec;
use crate::error::{CodecError, FetchError};
use crate::metrics;
use crate::pattern::KeyPattern;

const KEY_PREFIX: &str = "query";
const DIGEST_HEX_LEN: usize = 16;

/// Tenant-scoped record types served through the query cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patients,
    Appointments,
    Treatments,
    Invoices,
    Inventory,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Patients,
        EntityKind::Appointments,
        EntityKind::Treatments,
        EntityKind::Invoices,
        EntityKind::Inventory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patients => "patients",
            EntityKind::Appointments => "appointments",
            EntityKind::Treatments => "treatments",
            EntityKind::Invoices => "invoices",
            EntityKind::Inventory => "inventory",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Joins `prefix` and `parts` with `:`, keeping only `[A-Za-z0-9_-]` in each part.
pub fn build_key<I, S>(prefix: &str, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::from(prefix);
    for part in parts {
        key.push(':');
        key.extend(
            part.as_ref()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-'),
        );
    }
    key
}

/// Short stable digest of a filter or parameter object.
///
/// Object keys are sorted before hashing, so field order does not matter.
pub fn filter_digest<F: Serialize + ?Sized>(filter: &F) -> Result<String, CodecError> {
    let canonical = canonicalize(serde_json::to_value(filter)?);
    let bytes = serde_json::to_vec(&canonical)?;
    let mut digest = hex::encode(Sha256::digest(&bytes));
    digest.truncate(DIGEST_HEX_LEN);
    Ok(digest)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut entries: Vec<(String, Value)> = fields.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// TTLs per query family.
#[derive(Debug, Clone)]
pub struct QueryTtls {
    pub entity: Duration,
    pub list: Duration,
    pub analytics: Duration,
    pub platform_analytics: Duration,
}

impl Default for QueryTtls {
    fn default() -> Self {
        Self {
            entity: ttl::MEDIUM,
            list: ttl::SHORT,
            analytics: ttl::MEDIUM,
            platform_analytics: ttl::LONG,
        }
    }
}

/// Query-result cache with a per-process local tier in front of the shared store.
///
/// Invalidation only reaches this process's local tier. Other instances keep
/// serving their local copy for up to `local_ttl_secs` after a mutation.
#[derive(Clone)]
pub struct QueryCache {
    cache: Cache,
    local: moka::future::Cache<String, Arc<str>>,
    /// Bumped by every invalidation; lets a slow read notice it raced one.
    generation: Arc<AtomicU64>,
    ttls: QueryTtls,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("local_entries", &self.local.entry_count())
            .field("ttls", &self.ttls)
            .finish()
    }
}

impl QueryCache {
    pub fn new(cache: Cache, config: &CacheConfig) -> Self {
        Self::with_local_tier(cache, config.local_ttl(), config.local_max_entries)
    }

    pub fn with_local_tier(cache: Cache, local_ttl: Duration, max_entries: u64) -> Self {
        Self {
            cache,
            local: moka::future::Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(local_ttl)
                .build(),
            generation: Arc::new(AtomicU64::new(0)),
            ttls: QueryTtls::default(),
        }
    }

    pub fn with_ttls(mut self, ttls: QueryTtls) -> Self {
        self.ttls = ttls;
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn entity_key(tenant: &str, kind: EntityKind, id: &str) -> String {
        build_key(KEY_PREFIX, ["tenant", tenant, kind.as_str(), id])
    }

    pub fn entity_list_key(tenant: &str, kind: EntityKind, digest: &str) -> String {
        build_key(KEY_PREFIX, ["tenant", tenant, kind.as_str(), "list", digest])
    }

    pub fn analytics_key(tenant: &str, report: &str, digest: &str) -> String {
        build_key(KEY_PREFIX, ["tenant", tenant, "analytics", report, digest])
    }

    pub fn platform_analytics_key(report: &str, digest: &str) -> String {
        build_key(KEY_PREFIX, ["platform", "analytics", report, digest])
    }

    /// One record of a tenant.
    pub async fn entity<T, F, Fut, E>(
        &self,
        tenant: &str,
        kind: EntityKind,
        id: &str,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        let key = Self::entity_key(tenant, kind, id);
        self.cached(&key, self.ttls.entity, fetcher).await
    }

    /// A filtered listing of one record type within a tenant.
    pub async fn entity_list<T, P, F, Fut, E>(
        &self,
        tenant: &str,
        kind: EntityKind,
        filter: &P,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        match filter_digest(filter) {
            Ok(digest) => {
                let key = Self::entity_list_key(tenant, kind, &digest);
                self.cached(&key, self.ttls.list, fetcher).await
            }
            Err(e) => uncached(tenant, kind.as_str(), e, fetcher).await,
        }
    }

    /// A tenant dashboard report.
    pub async fn analytics<T, P, F, Fut, E>(
        &self,
        tenant: &str,
        report: &str,
        params: &P,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        match filter_digest(params) {
            Ok(digest) => {
                let key = Self::analytics_key(tenant, report, &digest);
                self.cached(&key, self.ttls.analytics, fetcher).await
            }
            Err(e) => uncached(tenant, report, e, fetcher).await,
        }
    }

    /// A cross-tenant report for platform administrators.
    pub async fn platform_analytics<T, P, F, Fut, E>(
        &self,
        report: &str,
        params: &P,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        match filter_digest(params) {
            Ok(digest) => {
                let key = Self::platform_analytics_key(report, &digest);
                self.cached(&key, self.ttls.platform_analytics, fetcher).await
            }
            Err(e) => uncached("platform", report, e, fetcher).await,
        }
    }

    /// Local tier first, then the shared cache with single-flight fetch.
    pub async fn cached<T, F, Fut, E>(
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
        if let Some(payload) = self.local.get(key).await {
            match codec::decode::<T>(&payload) {
                Ok(value) => {
                    metrics::record_cache_hit("local");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "dropping undecodable local entry");
                    self.local.invalidate(key).await;
                }
            }
        }
        metrics::record_cache_miss("local");

        let generation = self.generation.load(Ordering::SeqCst);
        let value = self.cache.get_or_set(key, ttl, fetcher).await?;
        match codec::encode(&value) {
            Ok(payload) => {
                self.local.insert(key.to_string(), Arc::from(payload)).await;
                // An invalidation ran while we were reading; the value may predate it.
                if self.generation.load(Ordering::SeqCst) != generation {
                    self.local.invalidate(key).await;
                }
            }
            Err(e) => tracing::debug!(key = %key, error = %e, "not keeping local copy"),
        }
        Ok(value)
    }

    /// Drops one record plus every listing and report that may include it.
    pub async fn invalidate_entity(&self, tenant: &str, kind: EntityKind, id: &str) -> u64 {
        let patterns = [
            Self::entity_key(tenant, kind, id),
            format!("{}:*", build_key(KEY_PREFIX, ["tenant", tenant, kind.as_str(), "list"])),
            format!("{}:*", build_key(KEY_PREFIX, ["tenant", tenant, "analytics"])),
            format!("{}:*", build_key(KEY_PREFIX, ["platform", "analytics"])),
        ];
        let deleted = self.invalidate_patterns(&patterns).await;
        tracing::debug!(tenant = %tenant, kind = %kind, id = %id, deleted, "invalidated entity");
        deleted
    }

    /// Drops everything cached for a tenant.
    pub async fn invalidate_tenant(&self, tenant: &str) -> u64 {
        let pattern = format!("{}:*", build_key(KEY_PREFIX, ["tenant", tenant]));
        let deleted = self.invalidate_patterns(&[pattern]).await;
        tracing::info!(tenant = %tenant, deleted, "invalidated tenant cache");
        deleted
    }

    pub async fn invalidate_platform_analytics(&self) -> u64 {
        let pattern = format!("{}:*", build_key(KEY_PREFIX, ["platform", "analytics"]));
        self.invalidate_patterns(&[pattern]).await
    }

    /// Shared store first, then the local tier, so a concurrent miss cannot
    /// refill the local tier from a store entry that is about to go away.
    async fn invalidate_patterns(&self, patterns: &[String]) -> u64 {
        let deleted = self.cache.delete_by_patterns(patterns).await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.evict_local(patterns).await;
        deleted
    }

    async fn evict_local(&self, patterns: &[String]) {
        let matchers: Vec<KeyPattern> = patterns
            .iter()
            .filter_map(|p| match KeyPattern::new(p) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid invalidation pattern");
                    None
                }
            })
            .collect();

        let stale: Vec<Arc<String>> = self
            .local
            .iter()
            .filter(|(key, _)| matchers.iter().any(|m| m.matches(key)))
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            self.local.invalidate(key.as_str()).await;
        }
    }
}

async fn uncached<T, F, Fut, E>(
    scope: &str,
    what: &str,
    err: CodecError,
    fetcher: F,
) -> Result<T, FetchError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    tracing::warn!(scope = %scope, query = %what, error = %err, "unhashable query parameters, bypassing cache");
    fetcher().await.map_err(FetchError::failed)
}
