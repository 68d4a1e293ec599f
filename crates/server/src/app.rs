//! Application state and pipeline composition.

use std::sync::Arc;

use axum::{middleware as axum_middleware, Router};
use vaultgate_core::{
    cache::ResponseCache, dispatch::Dispatcher, membership::PeerDirectory,
    ratelimit::VisitorRegistry,
};

use crate::middleware::{annotate_request, enforce_rate_limit, route_to_owner};
use crate::router::proxy_to_upstream;

/// Shared handles for the pipeline stages.
///
/// The cache is referenced both by the rate-limit stage (hit serving) and
/// the upstream stage (insertion); sharing happens through these Arcs,
/// never through globals.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ResponseCache>,
    pub limiters: Arc<VisitorRegistry>,
    pub peers: Arc<PeerDirectory>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Builds the proxy router.
///
/// Every method and path falls through to the upstream handler; the
/// middleware stack in front of it is the whole pipeline. Layers are
/// applied in reverse order, so the request-order chain is:
/// fingerprint → peer router → rate limiter → upstream proxy.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .fallback(proxy_to_upstream)
        .layer(axum_middleware::from_fn_with_state(state.clone(), enforce_rate_limit))
        .layer(axum_middleware::from_fn_with_state(state.clone(), route_to_owner))
        .layer(axum_middleware::from_fn(annotate_request))
        .with_state(state)
}
