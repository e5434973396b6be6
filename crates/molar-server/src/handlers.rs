use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use molar_cache::{Granularity, StatsBucket};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::metrics;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    cache_backend: &'static str,
    cache_available: bool,
}

/// Liveness plus the state of the backing store.
///
/// Always `200`: the cache degrades to misses when the store is down.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let kv = state.cache.kv();
    let cache_available = kv.is_available() && kv.ping().await;
    let status = if cache_available { "ok" } else { "degraded" };
    (
        StatusCode::OK,
        Json(HealthResponse {
            status,
            cache_backend: kv.backend_name(),
            cache_available,
        }),
    )
}

pub async fn prometheus_metrics() -> Response {
    match metrics::render() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics exporter not initialized").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct BucketQuery {
    /// RFC 3339 instant inside the wanted bucket, defaults to now.
    pub at: Option<String>,
}

#[derive(Serialize)]
struct BucketResponse {
    granularity: &'static str,
    key: String,
    request_count: u64,
    error_count: u64,
    total_duration_ms: u64,
    average_duration_ms: f64,
    error_rate: f64,
}

impl BucketResponse {
    fn new(granularity: Granularity, at: OffsetDateTime, bucket: &StatsBucket) -> Self {
        Self {
            granularity: granularity.as_str(),
            key: granularity.bucket_key(at),
            request_count: bucket.request_count,
            error_count: bucket.error_count,
            total_duration_ms: bucket.total_duration_ms,
            average_duration_ms: bucket.average_duration_ms(),
            error_rate: bucket.error_rate(),
        }
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "message": message })),
    )
        .into_response()
}

/// `GET /admin/apm/{granularity}`: the stats bucket containing `at`.
pub async fn apm_bucket(
    State(state): State<AppState>,
    Path(granularity): Path<String>,
    Query(query): Query<BucketQuery>,
) -> Response {
    let granularity: Granularity = match granularity.parse() {
        Ok(g) => g,
        Err(e) => return bad_request(format!("{e}")),
    };
    let at = match query.at.as_deref() {
        Some(raw) => match OffsetDateTime::parse(raw, &Rfc3339) {
            Ok(at) => at,
            Err(e) => return bad_request(format!("invalid `at` timestamp: {e}")),
        },
        None => OffsetDateTime::now_utc(),
    };

    match state.apm.bucket(granularity, at).await {
        Some(bucket) => Json(BucketResponse::new(granularity, at, &bucket)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "not_found",
                "message": format!("no requests recorded in {}", granularity.bucket_key(at)),
            })),
        )
            .into_response(),
    }
}
