//! Layered rate limiter: distributed backend first, in-memory fallback,
//! then allow.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use metrics::counter;
use molar_config::RateLimitConfig;
use time::OffsetDateTime;

use crate::backend::{RateLimitBackend, RateLimitDecision};
use crate::class::{LimiterClass, RatePolicy};
use crate::memory::MemoryBackend;
use crate::redis_backend::RedisBackend;

pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";

/// Response header names carried by every rate-limited response.
pub mod headers {
    pub const RETRY_AFTER: &str = "Retry-After";
    pub const LIMIT: &str = "X-RateLimit-Limit";
    pub const REMAINING: &str = "X-RateLimit-Remaining";
    pub const RESET: &str = "X-RateLimit-Reset";
}

/// Answer to one [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// When the next point frees up (or the block ends).
    pub reset_at: OffsetDateTime,
    /// Set only on denial.
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    fn from_decision(decision: RateLimitDecision, policy: &RatePolicy) -> Self {
        Self {
            allowed: decision.allowed,
            remaining: decision.remaining,
            limit: policy.points,
            reset_at: OffsetDateTime::now_utc() + decision.reset_after,
            retry_after: (!decision.allowed).then_some(decision.retry_after),
        }
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` (whole seconds, rounded
    /// up) on denial. `X-RateLimit-Reset` is a Unix timestamp in seconds.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(4);
        if let Some(wait) = self.retry_after {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            out.push((headers::RETRY_AFTER, secs.max(1).to_string()));
        }
        out.push((headers::LIMIT, self.limit.to_string()));
        out.push((headers::REMAINING, self.remaining.to_string()));
        out.push((headers::RESET, self.reset_at.unix_timestamp().to_string()));
        out
    }
}

struct LimiterInner {
    primary: Option<Arc<dyn RateLimitBackend>>,
    fallback: Arc<dyn RateLimitBackend>,
    policies: HashMap<LimiterClass, RatePolicy>,
    enabled: bool,
}

/// Per-class sliding-window limiter. Cheap to clone.
///
/// Requests are counted by the primary backend when one is configured. If it
/// is missing or fails, the in-memory fallback counts instead; if that fails
/// too, the request is allowed. Windows are not shared between backends, so
/// switching backends starts a client from a fresh window.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("primary", &self.inner.primary.as_ref().map(|b| b.name()))
            .field("fallback", &self.inner.fallback.name())
            .field("enabled", &self.inner.enabled)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(primary: Option<Arc<dyn RateLimitBackend>>, config: &RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                primary,
                fallback: Arc::new(MemoryBackend::new()),
                policies: resolve_policies(config),
                enabled: config.enabled,
            }),
        }
    }

    /// Redis-backed limiter sharing the cache's connection pool; in-memory
    /// only when no pool is available.
    pub fn from_pool(pool: Option<Pool>, config: &RateLimitConfig) -> Self {
        let primary = pool.map(|pool| Arc::new(RedisBackend::new(pool)) as Arc<dyn RateLimitBackend>);
        if primary.is_none() {
            tracing::info!("no shared store for rate limiting, using in-memory windows");
        }
        Self::new(primary, config)
    }

    pub fn in_memory(config: &RateLimitConfig) -> Self {
        Self::new(None, config)
    }

    /// Replaces the fallback backend.
    pub fn with_fallback(self, fallback: Arc<dyn RateLimitBackend>) -> Self {
        let inner = LimiterInner {
            primary: self.inner.primary.clone(),
            fallback,
            policies: self.inner.policies.clone(),
            enabled: self.inner.enabled,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn policy(&self, class: LimiterClass) -> RatePolicy {
        self.inner
            .policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }

    /// Counts one request by `identifier` against `class`.
    pub async fn check(&self, identifier: &str, class: LimiterClass) -> RateLimitResult {
        let policy = self.policy(class);
        if !self.inner.enabled {
            return RateLimitResult::from_decision(RateLimitDecision::fail_open(&policy), &policy);
        }

        let key = format!("{}:{}", class.as_str(), identifier);
        let (decision, backend) = self.consume(&key, &policy).await;

        counter!(
            RATE_LIMIT_DECISIONS_TOTAL,
            "class" => class.as_str(),
            "backend" => backend,
            "outcome" => if decision.allowed { "allowed" } else { "denied" }
        )
        .increment(1);

        if !decision.allowed {
            tracing::debug!(
                identifier = %identifier,
                class = %class,
                backend,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
        }
        RateLimitResult::from_decision(decision, &policy)
    }

    async fn consume(&self, key: &str, policy: &RatePolicy) -> (RateLimitDecision, &'static str) {
        if let Some(primary) = &self.inner.primary {
            match primary.consume(key, policy).await {
                Ok(decision) => return (decision, primary.name()),
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        backend = primary.name(),
                        error = %e,
                        "rate limit backend failed, using fallback"
                    );
                }
            }
        }

        let fallback = &self.inner.fallback;
        match fallback.consume(key, policy).await {
            Ok(decision) => (decision, fallback.name()),
            Err(e) => {
                tracing::error!(
                    key = %key,
                    error = %e,
                    "fallback rate limiter failed, allowing request"
                );
                (RateLimitDecision::fail_open(policy), "none")
            }
        }
    }
}

fn resolve_policies(config: &RateLimitConfig) -> HashMap<LimiterClass, RatePolicy> {
    let mut policies: HashMap<LimiterClass, RatePolicy> = LimiterClass::ALL
        .into_iter()
        .map(|class| (class, class.default_policy()))
        .collect();

    for (name, budget) in &config.overrides {
        match name.parse::<LimiterClass>() {
            Ok(class) => {
                policies.insert(class, RatePolicy::from(budget));
            }
            Err(e) => tracing::warn!(error = %e, "ignoring rate limit override"),
        }
    }
    policies
}
