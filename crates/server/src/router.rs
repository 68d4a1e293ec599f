//! Final pipeline stage: the upstream proxy handler.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::app::AppState;
use crate::middleware::request_keys;

/// Proxies the request to the upstream and relays the response verbatim.
///
/// Cacheable reads that come back with an exact 200 are inserted into the
/// response cache from the buffered body; the client is answered from the
/// same bytes. Dispatch failures (connect error, broken body) synthesize a
/// `500`, so a partially captured body is never cached.
pub async fn proxy_to_upstream(State(state): State<AppState>, request: Request) -> Response {
    let keys = request_keys(&request);
    let cacheable_read = keys.is_cacheable_path && !keys.is_mutating_method;

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            error!(%error, "failed to buffer request body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str()).to_string();
    debug!(method = %parts.method, path = %path_and_query, cacheable = cacheable_read, "proxying to upstream");

    match state.dispatcher.to_upstream(parts.method, &path_and_query, &parts.headers, body).await {
        Ok(captured) => {
            if cacheable_read && captured.status == StatusCode::OK {
                debug!(cache_key = %keys.cache_fingerprint, "caching upstream response");
                state.cache.insert(&keys.cache_fingerprint, captured.clone());
            }
            (captured.status, captured.headers, captured.body).into_response()
        }
        Err(error) => {
            error!(%error, path = %path_and_query, "upstream dispatch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}
