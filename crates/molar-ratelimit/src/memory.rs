//! In-process sliding windows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::backend::{RateLimitBackend, RateLimitDecision};
use crate::class::RatePolicy;
use crate::error::RateLimitError;

/// Minimum clock time between two sweeps of idle windows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Window {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    /// Window length of the policy that last touched this key.
    span: Duration,
}

impl Window {
    fn new(span: Duration) -> Self {
        Self {
            hits: VecDeque::new(),
            blocked_until: None,
            span,
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if oldest + self.span <= now {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    fn next_free(&self, now: Instant) -> Duration {
        self.hits
            .front()
            .map(|&oldest| (oldest + self.span).saturating_duration_since(now))
            .unwrap_or(self.span)
    }

    fn is_idle(&self) -> bool {
        self.hits.is_empty() && self.blocked_until.is_none()
    }
}

/// DashMap of per-key windows. Timestamps use `tokio::time::Instant`, so a
/// paused test clock drives window expiry.
///
/// Keys whose windows have emptied are swept from the map during `consume`,
/// at most once per [`SWEEP_INTERVAL`], so the map tracks only identifiers
/// seen within their own window.
#[derive(Debug)]
pub struct MemoryBackend {
    windows: DashMap<String, Window>,
    epoch: Instant,
    last_sweep_ms: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            epoch: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Forgets keys with no hits left in their window and no active block.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.evict(now);
            !window.is_idle()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Runs [`Self::purge_idle`] if the last sweep is older than the interval.
    /// Only one caller wins the sweep when several race.
    fn maybe_sweep(&self, now: Instant) {
        let now_ms = millis(now.saturating_duration_since(self.epoch));
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < millis(SWEEP_INTERVAL) {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let removed = self.purge_idle();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.windows.len(), "purged idle rate limit windows");
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    async fn consume(
        &self,
        key: &str,
        policy: &RatePolicy,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now = Instant::now();
        // Must run before the entry guard below is taken.
        self.maybe_sweep(now);

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(policy.duration));
        window.span = policy.duration;
        window.evict(now);

        if let Some(until) = window.blocked_until {
            let wait = until.saturating_duration_since(now);
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after: wait,
                retry_after: wait,
            });
        }

        let used = u32::try_from(window.hits.len()).unwrap_or(u32::MAX);
        if used < policy.points {
            window.hits.push_back(now);
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: policy.points - used - 1,
                reset_after: window.next_free(now),
                retry_after: Duration::ZERO,
            });
        }

        let wait = match policy.block_duration {
            Some(block) => {
                window.blocked_until = Some(now + block);
                block
            }
            None => window.next_free(now),
        };
        Ok(RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_after: wait,
            retry_after: wait,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_boundary() {
        let backend = MemoryBackend::new();
        let policy = RatePolicy::new(5, Duration::from_secs(60));

        for expected_remaining in (0..5).rev() {
            let d = backend.consume("api:1.2.3.4", &policy).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = backend.consume("api:1.2.3.4", &policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(60)).await;

        let again = backend.consume("api:1.2.3.4", &policy).await.unwrap();
        assert!(again.allowed);
        assert_eq!(again.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let backend = MemoryBackend::new();
        let policy = RatePolicy::new(2, Duration::from_secs(10));

        backend.consume("k", &policy).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        backend.consume("k", &policy).await.unwrap();

        let denied = backend.consume("k", &policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend.consume("k", &policy).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_duration_extends_denial() {
        let backend = MemoryBackend::new();
        let policy =
            RatePolicy::new(3, Duration::from_secs(60)).with_block(Duration::from_secs(900));

        for _ in 0..3 {
            assert!(backend.consume("k", &policy).await.unwrap().allowed);
        }
        let denied = backend.consume("k", &policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(900));

        // The window has long emptied but the block still holds.
        tokio::time::advance(Duration::from_secs(600)).await;
        let still = backend.consume("k", &policy).await.unwrap();
        assert!(!still.allowed);
        assert_eq!(still.retry_after, Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(backend.consume("k", &policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let backend = MemoryBackend::new();
        let policy = RatePolicy::new(1, Duration::from_secs(60));

        assert!(backend.consume("auth:a", &policy).await.unwrap().allowed);
        assert!(backend.consume("auth:b", &policy).await.unwrap().allowed);
        assert!(!backend.consume("auth:a", &policy).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle() {
        let backend = MemoryBackend::new();
        let policy = RatePolicy::new(5, Duration::from_secs(10));
        backend.consume("old", &policy).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        backend.consume("new", &policy).await.unwrap();

        assert_eq!(backend.purge_idle(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_windows_swept_during_consume() {
        let backend = MemoryBackend::new();
        let policy = RatePolicy::new(5, Duration::from_secs(60));

        for i in 0..1_000 {
            backend.consume(&format!("api:10.0.{}.{}", i / 256, i % 256), &policy).await.unwrap();
        }
        assert_eq!(backend.len(), 1_000);

        // Still inside the sweep interval: nothing is dropped.
        tokio::time::advance(Duration::from_secs(10)).await;
        backend.consume("api:fresh-1", &policy).await.unwrap();
        assert_eq!(backend.len(), 1_001);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        backend.consume("api:fresh-2", &policy).await.unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_blocked_keys() {
        let backend = MemoryBackend::new();
        let policy =
            RatePolicy::new(1, Duration::from_secs(60)).with_block(Duration::from_secs(900));

        backend.consume("reset:ana", &policy).await.unwrap();
        assert!(!backend.consume("reset:ana", &policy).await.unwrap().allowed);

        // Hits expired, block still active.
        tokio::time::advance(Duration::from_secs(120)).await;
        backend.consume("reset:other", &policy).await.unwrap();
        assert_eq!(backend.len(), 2);
        assert!(!backend.consume("reset:ana", &policy).await.unwrap().allowed);
    }
}
