//! Prometheus exporter and HTTP request metrics.
//!
//! The cache and rate limiter crates emit their own counters through the
//! `metrics` facade; installing the recorder here makes them visible at
//! `GET /metrics` alongside the HTTP series below.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static EXPORTER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Request latency buckets, in seconds. Local-tier hits land below 5ms,
/// uncached analytics reports in the upper range.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const HTTP_RATE_LIMITED_TOTAL: &str = "http_rate_limited_total";
}

fn exporter_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .add_global_label("service", "molar")
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            LATENCY_BUCKETS,
        )
}

/// Installs the process-wide recorder; `/metrics` is served by the app.
/// A second call is a no-op.
pub fn install_exporter() -> Result<(), BuildError> {
    if EXPORTER.get().is_some() {
        return Ok(());
    }
    let handle = exporter_builder()?.install_recorder()?;
    EXPORTER.get_or_init(|| handle);
    tracing::info!(buckets = LATENCY_BUCKETS.len(), "Prometheus exporter installed");
    Ok(())
}

/// Prometheus text exposition, `None` until [`install_exporter`] succeeded.
pub fn render() -> Option<String> {
    EXPORTER.get().map(PrometheusHandle::render)
}

pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string(),
        "status_class" => status_class
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_rate_limited(class: &'static str) {
    counter!(names::HTTP_RATE_LIMITED_TOTAL, "class" => class).increment(1);
}

/// Replaces id-like path segments with `{id}` to keep label cardinality low.
///
/// Used when a request did not match a route and no route template exists.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|part| if is_likely_id(part) { "{id}" } else { part })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_likely_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    // UUID with dashes
    if s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4 {
        return true;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Prefixed ids such as `pat_01HX...`
    s.len() > 12 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_histogram_uses_buckets() {
        let recorder = exporter_builder().unwrap().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            record_http_request("GET", "/api/patients", 200, Duration::from_millis(3));
            record_rate_limited("login");
        });

        let text = handle.render();
        let bucket = |le: &str| {
            text.lines()
                .find(|l| {
                    l.starts_with("http_request_duration_seconds_bucket")
                        && l.contains(&format!("le=\"{le}\""))
                })
                .map(|l| l.rsplit(' ').next().unwrap_or_default().to_string())
        };
        assert_eq!(bucket("0.0025").as_deref(), Some("0"));
        assert_eq!(bucket("0.005").as_deref(), Some("1"));
        assert!(text.lines().any(|l| {
            l.starts_with("http_rate_limited_total")
                && l.contains("class=\"login\"")
                && l.contains("service=\"molar\"")
        }));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/patients/123"), "/api/patients/{id}");
        assert_eq!(
            normalize_path("/api/appointments/5f0c8a4e-3b7d-4f1e-9a2b-0c1d2e3f4a5b/notes"),
            "/api/appointments/{id}/notes"
        );
        assert_eq!(normalize_path("/api/invoices"), "/api/invoices");
        assert_eq!(normalize_path("/health"), "/health");
    }
}
