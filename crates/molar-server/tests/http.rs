//! End-to-end behaviour of the middleware stack over an in-memory state.

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use molar_cache::Granularity;
use molar_config::{AppConfig, LimiterOverride};
use molar_server::{AppState, build_app};
use serde_json::Value;
use time::OffsetDateTime;
use tower::ServiceExt;

fn config_with_api_budget(points: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limit.overrides.insert(
        "api".into(),
        LimiterOverride {
            points,
            duration: Duration::from_secs(60),
            block_duration: None,
        },
    );
    config
}

fn app(state: AppState) -> Router {
    let api = Router::new().route("/patients", get(|| async { "[]" }));
    build_app(state, api)
}

fn get_from(uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_allowed_requests_carry_rate_limit_headers() {
    let app = app(AppState::in_memory(&config_with_api_budget(3)));

    let res = app.oneshot(get_from("/api/patients", "198.51.100.4")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-ratelimit-limit"], "3");
    assert_eq!(res.headers()["x-ratelimit-remaining"], "2");
    assert!(res.headers().contains_key("x-ratelimit-reset"));
    assert!(!res.headers().contains_key("retry-after"));
    assert!(res.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_exhausted_budget_returns_429() {
    let app = app(AppState::in_memory(&config_with_api_budget(3)));

    for _ in 0..3 {
        let res = app
            .clone()
            .oneshot(get_from("/api/patients", "198.51.100.4"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(get_from("/api/patients", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()["x-ratelimit-limit"], "3");
    assert_eq!(res.headers()["x-ratelimit-remaining"], "0");
    let retry_after: u64 = res.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    let body = json_body(res).await;
    assert_eq!(body["error"], "too_many_requests");

    // Another client is unaffected.
    let res = app
        .oneshot(get_from("/api/patients", "198.51.100.5"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_forged_forwarded_for_does_not_reset_budget() {
    let mut config = config_with_api_budget(2);
    config.server.trusted_proxy_hops = 1;
    let app = app(AppState::in_memory(&config));

    // A fresh forged left-most entry per request; the proxy-appended hops stay put.
    let mut statuses = Vec::new();
    for i in 0..3 {
        let chain = format!("10.9.9.{i}, 198.51.100.4, 10.0.0.1");
        let res = app
            .clone()
            .oneshot(get_from("/api/patients", &chain))
            .await
            .unwrap();
        statuses.push(res.status());
    }
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
}

#[tokio::test]
async fn test_operational_routes_are_not_limited() {
    let app = app(AppState::in_memory(&config_with_api_budget(1)));

    for _ in 0..3 {
        let res = app
            .clone()
            .oneshot(get_from("/health", "198.51.100.4"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.headers().contains_key("x-ratelimit-limit"));
    }
}

#[tokio::test]
async fn test_health_reports_backend() {
    let app = app(AppState::in_memory(&AppConfig::default()));

    let res = app.oneshot(get_from("/health", "127.0.0.1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = json_body(res).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache_backend"], "memory");
    assert_eq!(body["cache_available"], true);
}

#[tokio::test]
async fn test_health_degraded_without_store() {
    let state = AppState::from_config(&AppConfig::default());
    let res = app(state).oneshot(get_from("/health", "127.0.0.1")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["cache_available"], false);
}

#[tokio::test]
async fn test_requests_are_aggregated_into_apm_buckets() {
    let state = AppState::in_memory(&AppConfig::default());
    let app = app(state.clone());

    let res = app
        .clone()
        .oneshot(get_from("/api/patients", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Bucket writes happen on a detached task.
    let mut bucket = None;
    for _ in 0..100 {
        bucket = state.apm.bucket(Granularity::Day, OffsetDateTime::now_utc()).await;
        if bucket.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let bucket = bucket.expect("day bucket written");
    assert_eq!(bucket.request_count, 1);
    assert_eq!(bucket.error_count, 0);

    let res = app
        .oneshot(get_from("/admin/apm/day", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["granularity"], "day");
    assert_eq!(body["request_count"], 1);
}

#[tokio::test]
async fn test_apm_endpoint_rejects_unknown_granularity() {
    let app = app(AppState::in_memory(&AppConfig::default()));

    let res = app
        .clone()
        .oneshot(get_from("/admin/apm/week", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .oneshot(get_from("/admin/apm/hour?at=not-a-date", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_apm_endpoint_empty_bucket_is_not_found() {
    let app = app(AppState::in_memory(&AppConfig::default()));

    let res = app
        .oneshot(get_from("/admin/apm/hour?at=2020-01-01T10:15:00Z", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
