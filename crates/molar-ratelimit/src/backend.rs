use std::time::Duration;

use async_trait::async_trait;

use crate::class::RatePolicy;
use crate::error::RateLimitError;

/// Outcome of consuming one point from a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Points left in the window after this request.
    pub remaining: u32,
    /// Time until the next point frees up (or the block ends).
    pub reset_after: Duration,
    /// How long a denied caller should wait; zero when allowed.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Decision used when no backend could answer.
    pub fn fail_open(policy: &RatePolicy) -> Self {
        Self {
            allowed: true,
            remaining: policy.points,
            reset_after: policy.duration,
            retry_after: Duration::ZERO,
        }
    }
}

/// Storage for sliding windows keyed by `<class>:<identifier>`.
///
/// Backends keep independent state; a key's window in one backend is
/// unknown to the others.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Records one request against `key` if the budget allows it.
    async fn consume(
        &self,
        key: &str,
        policy: &RatePolicy,
    ) -> Result<RateLimitDecision, RateLimitError>;

    fn name(&self) -> &'static str;
}
