//! Shared TTL presets for cache entries.

use std::time::Duration;

/// Volatile listings (today's schedule, search results).
pub const SHORT: Duration = Duration::from_secs(60);
/// Entity detail pages and tenant dashboards.
pub const MEDIUM: Duration = Duration::from_secs(300);
pub const LONG: Duration = Duration::from_secs(3600);
/// Reference data and platform-wide analytics.
pub const VERY_LONG: Duration = Duration::from_secs(86_400);
