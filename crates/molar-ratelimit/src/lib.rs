//! Sliding-window rate limiting for the Molar HTTP surface.
//!
//! [`RateLimiter::check`] counts a request for an identifier (usually the
//! client IP) against a [`LimiterClass`] budget. Counting happens in Redis
//! when available and in process memory otherwise; the limiter fails open.

mod backend;
mod class;
mod error;
mod limiter;
mod memory;
mod redis_backend;

pub use backend::{RateLimitBackend, RateLimitDecision};
pub use class::{LimiterClass, RatePolicy, UnknownClass};
pub use error::RateLimitError;
pub use limiter::{RATE_LIMIT_DECISIONS_TOTAL, RateLimitResult, RateLimiter, headers};
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
