//! Second pipeline stage: mutation invalidation and peer routing.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info, warn};
use vaultgate_core::{config::VAULT_TOKEN_HEADER, fingerprint::header_str};

use crate::app::AppState;
use crate::middleware::request_keys;

/// Routes cacheable reads to the peer that owns the request's token.
///
/// Non-cacheable paths pass straight through. Mutations on cacheable paths
/// invalidate the local cache entry and pass through. Cacheable reads owned
/// elsewhere are forwarded to the owner under the peer deadline; a peer
/// failure degrades to local processing rather than retrying.
pub async fn route_to_owner(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let keys = request_keys(&request);
    if !keys.is_cacheable_path {
        return next.run(request).await;
    }

    if keys.is_mutating_method {
        info!(
            method = %request.method(),
            path = %request.uri().path(),
            "mutation on cacheable path, invalidating local cache"
        );
        state.cache.invalidate(&keys.cache_fingerprint);
        return next.run(request).await;
    }

    let token = header_str(request.headers(), VAULT_TOKEN_HEADER).to_string();
    let Some(owner) = state.peers.owner_for(&token) else {
        debug!("no membership known, serving locally");
        return next.run(request).await;
    };
    if owner == state.peers.self_address() {
        debug!(path = %request.uri().path(), "token owned locally");
        return next.run(request).await;
    }

    // Forwarding consumes the request; buffer the body so it can be
    // reconstructed if the peer fails.
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "failed to buffer request body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str()).to_string();

    match state
        .dispatcher
        .to_peer(&owner, parts.method.clone(), &path_and_query, &parts.headers, body.clone())
        .await
    {
        Ok(response) => {
            info!(peer = %owner, path = %path_and_query, "request served by owning peer");
            (response.status, response.headers, response.body).into_response()
        }
        Err(error) => {
            if error.is_timeout() {
                warn!(peer = %owner, path = %path_and_query, "peer request timed out, serving locally");
            } else {
                warn!(peer = %owner, path = %path_and_query, %error, "peer request failed, serving locally");
            }
            let request = Request::from_parts(parts, Body::from(body));
            next.run(request).await
        }
    }
}
