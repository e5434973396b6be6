//! Cache counters.
//!
//! Emitted through the `metrics` facade; nothing is recorded until the host
//! process installs a recorder (the server installs the Prometheus exporter).

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_FETCHES_TOTAL: &str = "cache_fetches_total";
    pub const CACHE_WRITES_SKIPPED_TOTAL: &str = "cache_writes_skipped_total";
    pub const CACHE_KEYS_INVALIDATED_TOTAL: &str = "cache_keys_invalidated_total";
}

/// Record a cache hit. `tier` is `kv`, `local` or `stale`.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

pub fn record_cache_miss(tier: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier).increment(1);
}

/// Record a fetch started on a miss. `role` is `leader` or `follower`.
pub fn record_cache_fetch(role: &'static str) {
    counter!(names::CACHE_FETCHES_TOTAL, "role" => role).increment(1);
}

pub fn record_write_skipped() {
    counter!(names::CACHE_WRITES_SKIPPED_TOTAL).increment(1);
}

pub fn record_keys_invalidated(count: u64) {
    counter!(names::CACHE_KEYS_INVALIDATED_TOTAL).increment(count);
}
