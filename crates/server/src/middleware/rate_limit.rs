//! Third pipeline stage: rate limiting and cache-hit serving.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::middleware::request_keys;

/// Consumes one token from the visitor's composite limiter, serves cache
/// hits, and rejects over-budget tokens.
///
/// The token is consumed before the cache check so that hits and upstream
/// misses count equally: the limiter bounds work attempted by the token,
/// not work reaching the upstream.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    state.limiters.purge_idle();

    let keys = request_keys(&request);
    debug!(limiter_key = %keys.limiter_fingerprint, "rate-limit check started");
    let limiter = state.limiters.get_or_create(&keys.limiter_fingerprint);
    let allowed = limiter.allow();

    if keys.is_cacheable_path && !keys.is_mutating_method {
        if let Some(hit) = state.cache.lookup(&keys.cache_fingerprint) {
            info!(cache_key = %keys.cache_fingerprint, "cache hit");
            return (hit.status, hit.headers, hit.body).into_response();
        }
        debug!(cache_key = %keys.cache_fingerprint, "cache miss");
    }

    if !allowed {
        warn!(limiter_key = %keys.limiter_fingerprint, "rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    next.run(request).await
}
