//! Distributed sliding windows in Redis sorted sets.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use deadpool_redis::Pool;

use crate::backend::{RateLimitBackend, RateLimitDecision};
use crate::class::RatePolicy;
use crate::error::RateLimitError;

const KEY_PREFIX: &str = "ratelimit";

/// One window per sorted set: members are request ids scored by their
/// timestamp in milliseconds. Runs atomically on the server.
///
/// Returns `{allowed, remaining, wait_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local block_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local points = tonumber(ARGV[3])
local block = tonumber(ARGV[4])
local member = ARGV[5]

local blocked = redis.call('PTTL', block_key)
if blocked > 0 then
  return {0, 0, blocked}
end

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local used = redis.call('ZCARD', key)

if used < points then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  return {1, points - used - 1, tonumber(oldest[2]) + window - now}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local wait = tonumber(oldest[2]) + window - now
if block > 0 then
  redis.call('SET', block_key, '1', 'PX', block)
  wait = block
end
return {0, 0, wait}
";

pub struct RedisBackend {
    pool: Pool,
    script: redis::Script,
}

impl RedisBackend {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn consume(
        &self,
        key: &str,
        policy: &RatePolicy,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let mut conn = self.pool.get().await?;
        let window_key = format!("{KEY_PREFIX}:{key}");
        let block_key = format!("{window_key}:block");

        let reply: Vec<i64> = self
            .script
            .key(&window_key)
            .key(&block_key)
            .arg(unix_millis())
            .arg(millis(policy.duration))
            .arg(policy.points)
            .arg(policy.block_duration.map(millis).unwrap_or(0))
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut *conn)
            .await?;

        let [allowed, remaining, wait_ms] = reply[..] else {
            return Err(RateLimitError::Reply(format!("{reply:?}")));
        };
        let wait = Duration::from_millis(wait_ms.max(0) as u64);
        let allowed = allowed == 1;
        Ok(RateLimitDecision {
            allowed,
            remaining: u32::try_from(remaining.max(0)).unwrap_or(0),
            reset_after: wait,
            retry_after: if allowed { Duration::ZERO } else { wait },
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
