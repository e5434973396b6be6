//! Request statistics aggregated into time buckets in the cache store.
//!
//! Each sample updates three buckets (5-minute, hour, day) by
//! read-modify-write through [`Cache`]. Updates are not atomic: concurrent
//! writers to one bucket can lose increments, which is acceptable for
//! dashboard telemetry. Bucket boundaries are UTC.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use molar_config::ApmConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};

use crate::cache::Cache;
use crate::codec::tagged_datetime;

const KEY_PREFIX: &str = "apm:stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[serde(rename = "5m")]
    FiveMinutes,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [
        Granularity::FiveMinutes,
        Granularity::Hour,
        Granularity::Day,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::FiveMinutes => "5m",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    /// Lifetime of a bucket key; equal to the bucket width.
    pub fn ttl(&self) -> Duration {
        match self {
            Granularity::FiveMinutes => Duration::from_secs(300),
            Granularity::Hour => Duration::from_secs(3_600),
            Granularity::Day => Duration::from_secs(86_400),
        }
    }

    /// Store key of the bucket containing `at`.
    pub fn bucket_key(&self, at: OffsetDateTime) -> String {
        let at = at.to_offset(UtcOffset::UTC);
        let (year, month, day) = (at.year(), u8::from(at.month()), at.day());
        match self {
            Granularity::FiveMinutes => format!(
                "{KEY_PREFIX}:5m:{year:04}-{month:02}-{day:02}T{:02}:{:02}",
                at.hour(),
                at.minute() / 5 * 5
            ),
            Granularity::Hour => format!(
                "{KEY_PREFIX}:hour:{year:04}-{month:02}-{day:02}T{:02}",
                at.hour()
            ),
            Granularity::Day => format!("{KEY_PREFIX}:day:{year:04}-{month:02}-{day:02}"),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown granularity `{0}` (expected 5m, hour or day)")]
pub struct UnknownGranularity(String);

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" | "five_minutes" => Ok(Granularity::FiveMinutes),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            other => Err(UnknownGranularity(other.to_string())),
        }
    }
}

/// Aggregated counters for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsBucket {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl StatsBucket {
    pub fn add(&mut self, sample: &RequestSample) {
        self.request_count += 1;
        self.total_duration_ms += sample.duration_ms();
        if sample.is_error() {
            self.error_count += 1;
        }
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.request_count as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

/// One served request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub duration: Duration,
    #[serde(with = "tagged_datetime")]
    pub recorded_at: OffsetDateTime,
}

impl RequestSample {
    pub fn new(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status: u16,
        duration: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            status,
            duration,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn at(mut self, recorded_at: OffsetDateTime) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status >= 500
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Error)]
#[error("history sink error: {0}")]
pub struct HistoryError(pub String);

/// Durable per-request history, kept outside the cache store.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn append(&self, sample: &RequestSample) -> Result<(), HistoryError>;
}

/// Sink that discards samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistory;

#[async_trait]
impl HistorySink for NoopHistory {
    async fn append(&self, _sample: &RequestSample) -> Result<(), HistoryError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApmService {
    cache: Cache,
    history: Arc<dyn HistorySink>,
    slow_threshold: Duration,
    enabled: bool,
}

impl fmt::Debug for ApmService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApmService")
            .field("enabled", &self.enabled)
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

impl ApmService {
    pub fn new(cache: Cache, config: &ApmConfig) -> Self {
        Self {
            cache,
            history: Arc::new(NoopHistory),
            slow_threshold: config.slow_request_threshold(),
            enabled: config.enabled,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Adds `sample` to its three buckets and forwards it to the history sink.
    ///
    /// Never fails: store and sink errors are logged.
    pub async fn record(&self, sample: RequestSample) {
        if !self.enabled {
            return;
        }

        if sample.duration > self.slow_threshold {
            tracing::warn!(
                endpoint = %sample.endpoint,
                method = %sample.method,
                status = sample.status,
                duration_ms = sample.duration_ms(),
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow request"
            );
        }

        for granularity in Granularity::ALL {
            let key = granularity.bucket_key(sample.recorded_at);
            let mut bucket = self.cache.get::<StatsBucket>(&key).await.unwrap_or_default();
            bucket.add(&sample);
            if !self.cache.set(&key, &bucket, granularity.ttl()).await {
                tracing::debug!(key = %key, "stats bucket not written");
            }
        }

        if let Err(e) = self.history.append(&sample).await {
            tracing::warn!(endpoint = %sample.endpoint, error = %e, "failed to persist request history");
        }
    }

    /// Reads back the bucket of `granularity` containing `at`.
    pub async fn bucket(&self, granularity: Granularity, at: OffsetDateTime) -> Option<StatsBucket> {
        self.cache.get(&granularity.bucket_key(at)).await
    }
}
