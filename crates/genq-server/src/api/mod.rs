mod error;
mod events;
mod limits;
mod rest;

pub use error::ApiError;
pub use limits::RateLimits;

use crate::config::ServerConfig;
use crate::{Notifier, ServiceMetrics};
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use genq_broker::BrokerClient;
use genq_persistence::TaskStore;
use genq_worker::BillingGate;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub broker: BrokerClient,
    pub billing: Arc<BillingGate>,
    pub notifier: Arc<Notifier>,
    pub metrics: Arc<ServiceMetrics>,
    pub limits: RateLimits,
    pub started_at: Instant,
}

impl AppState {
    /// Count a rejection and hand the error back.
    pub fn reject(&self, err: ApiError) -> ApiError {
        self.metrics.reject(err.reason());
        err
    }
}

pub fn router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/api/generate", post(rest::submit))
        .route("/api/generate/retry", post(rest::retry))
        .route("/api/generate/task/:task_id", get(rest::status))
        .route_layer(middleware::from_fn_with_state(state.clone(), limits::limit_api));

    let events = Router::new()
        .route("/events", get(events::stream))
        .route_layer(middleware::from_fn_with_state(state.clone(), limits::limit_events));

    Router::new()
        .merge(api)
        .merge(events)
        .route("/health", get(rest::health))
        .route("/system", get(rest::system))
        .route("/metrics", get(rest::metrics))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
