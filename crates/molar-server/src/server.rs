use axum::{Router, middleware, routing::get};
use molar_config::AppConfig;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{handlers, middleware as app_middleware, state::AppState};

pub struct MolarServer {
    host: String,
    port: u16,
    app: Router,
}

/// Mounts `api` under `/api` next to the operational endpoints and wraps
/// everything in the middleware stack.
///
/// Layer order, outermost first: request id, trace, telemetry, rate limit.
pub fn build_app(state: AppState, api: Router<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/admin/apm/{granularity}", get(handlers::apm_bucket))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::rate_limit,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::record_request,
        ))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .with_state(state)
}

pub struct ServerBuilder {
    config: AppConfig,
    state: Option<AppState>,
    api: Router<AppState>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            state: None,
            api: Router::new(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Overrides the state otherwise built from the configuration.
    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = Some(state);
        self
    }

    /// Application routes, mounted under `/api`.
    pub fn with_api(mut self, api: Router<AppState>) -> Self {
        self.api = api;
        self
    }

    pub fn build(self) -> MolarServer {
        let state = self
            .state
            .unwrap_or_else(|| AppState::from_config(&self.config));

        MolarServer {
            host: self.config.server.host.clone(),
            port: self.config.server.port,
            app: build_app(state, self.api),
        }
    }
}

impl MolarServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        tracing::info!("listening on {}", listener.local_addr()?);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
