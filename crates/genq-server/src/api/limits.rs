use super::{ApiError, AppState};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

/// Per-client-IP request budgets.
pub struct RateLimits {
    api: DefaultKeyedRateLimiter<String>,
    events: DefaultKeyedRateLimiter<String>,
    trust_proxy: bool,
}

fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

impl RateLimits {
    pub fn new(api_per_minute: u32, events_per_minute: u32, trust_proxy: bool) -> Self {
        RateLimits {
            api: RateLimiter::keyed(per_minute(api_per_minute)),
            events: RateLimiter::keyed(per_minute(events_per_minute)),
            trust_proxy,
        }
    }

    /// Client address: the first `X-Forwarded-For` hop when the proxy is
    /// trusted, else the peer address.
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trust_proxy {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }
        peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
    }

    pub fn check_api(&self, key: &String) -> bool {
        self.api.check_key(key).is_ok()
    }

    pub fn check_events(&self, key: &String) -> bool {
        self.events.check_key(key).is_ok()
    }

    /// Forget clients that have a full budget again.
    pub fn shrink(&self) {
        self.api.retain_recent();
        self.events.retain_recent();
    }
}

fn peer(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

pub async fn limit_api(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let key = state.limits.client_key(request.headers(), peer(&request));
    if !state.limits.check_api(&key) {
        debug!(client = %key, path = %request.uri().path(), "API rate limit exceeded");
        return state.reject(ApiError::TooManyRequests).into_response();
    }
    next.run(request).await
}

pub async fn limit_events(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let key = state.limits.client_key(request.headers(), peer(&request));
    if !state.limits.check_events(&key) {
        debug!(client = %key, "Event connection rate limit exceeded");
        return state.reject(ApiError::TooManyRequests).into_response();
    }
    next.run(request).await
}
