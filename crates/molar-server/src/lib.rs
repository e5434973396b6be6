//! HTTP surface for the Molar caching and rate limiting layer.
//!
//! The binary serves `/health`, `/metrics` and the APM bucket endpoint;
//! application routes are mounted under `/api` and pass through the rate
//! limiter and request telemetry middleware.

pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod state;

pub use server::{MolarServer, ServerBuilder, build_app};
pub use state::AppState;
