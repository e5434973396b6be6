use std::time::Instant;

use axum::extract::{MatchedPath, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, body::Body, middleware::Next, response::Response};
use molar_cache::RequestSample;
use molar_ratelimit::{LimiterClass, RateLimitResult};
use serde_json::json;
use uuid::Uuid;

use crate::metrics;
use crate::state::AppState;

// =============================================================================
// Rate limiting
// =============================================================================

/// Limiter class for a request path, `None` for paths that are not limited.
pub fn classify(path: &str) -> Option<LimiterClass> {
    let rest = path.strip_prefix("/api")?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }

    let class = if rest.starts_with("/auth/password-reset") || rest.starts_with("/auth/forgot-password")
    {
        LimiterClass::PasswordReset
    } else if rest.starts_with("/auth/verify-email") || rest.starts_with("/auth/resend-verification")
    {
        LimiterClass::EmailVerification
    } else if rest.starts_with("/auth") {
        LimiterClass::Auth
    } else if rest.starts_with("/invitations") {
        LimiterClass::Invitation
    } else if rest.starts_with("/upload") || rest.contains("/attachments") {
        LimiterClass::Upload
    } else {
        LimiterClass::Api
    };
    Some(class)
}

/// Client identifier from `X-Forwarded-For`, then `X-Real-IP`.
///
/// Each proxy appends the address it received from, and anything further
/// left may be forged by the client. Skips `trusted_hops` entries from the
/// right and takes the next one.
pub fn client_identifier(headers: &HeaderMap, trusted_hops: usize) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let hops: Vec<&str> = v.split(',').map(str::trim).collect();
            let idx = hops.len().saturating_sub(trusted_hops + 1);
            hops.get(idx).copied()
        })
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .unwrap_or("anonymous")
        .to_string()
}

/// Rejects requests over their class budget with `429 Too Many Requests`.
///
/// Allowed responses carry the `X-RateLimit-*` headers as well.
pub async fn rate_limit(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(class) = classify(req.uri().path()) else {
        return next.run(req).await;
    };

    let identifier = client_identifier(req.headers(), state.trusted_proxy_hops);
    let result = state.limiter.check(&identifier, class).await;

    if !result.allowed {
        metrics::record_rate_limited(class.as_str());
        tracing::info!(
            identifier = %identifier,
            class = %class,
            path = %req.uri().path(),
            "request rate limited"
        );
        let body = json!({
            "error": "too_many_requests",
            "message": "Too many requests, please try again later.",
        });
        let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        apply_rate_limit_headers(res.headers_mut(), &result);
        return res;
    }

    let mut res = next.run(req).await;
    apply_rate_limit_headers(res.headers_mut(), &result);
    res
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    for (name, value) in result.headers() {
        // from_bytes lowercases the canonical header spelling
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = name, value = %value, "invalid rate limit header"),
        }
    }
}

// =============================================================================
// Request telemetry
// =============================================================================

/// Records duration and status of every request into the HTTP metrics and
/// the APM buckets. Bucket writes run on a detached task.
pub async fn record_request(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| metrics::normalize_path(req.uri().path()));

    let res = next.run(req).await;

    let elapsed = started.elapsed();
    let status = res.status().as_u16();
    metrics::record_http_request(&method, &route, status, elapsed);

    if state.apm.is_enabled() && !is_infrastructure_route(&route) {
        let apm = state.apm.clone();
        tokio::spawn(async move {
            apm.record(RequestSample::new(route, method, status, elapsed))
                .await;
        });
    }
    res
}

fn is_infrastructure_route(route: &str) -> bool {
    matches!(route, "/health" | "/metrics") || route.starts_with("/admin/")
}

// =============================================================================
// Request id
// =============================================================================

/// Ensures each request has an `X-Request-Id` and mirrors it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(req).await,
        },
    };

    req.extensions_mut().insert(req_id_value.clone());
    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}
