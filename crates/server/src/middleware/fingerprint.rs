//! First pipeline stage: derive and attach request keys.

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::debug;
use vaultgate_core::fingerprint::RequestKeys;

/// Derives the cache/limiter fingerprints and classification flags once,
/// attaching them to the request so later stages read instead of reparsing.
pub async fn annotate_request(mut request: Request, next: Next) -> Response {
    let keys = RequestKeys::derive(request.method(), request.uri().path(), request.headers());
    debug!(
        cache_key = %keys.cache_fingerprint,
        limiter_key = %keys.limiter_fingerprint,
        cacheable = keys.is_cacheable_path,
        mutating = keys.is_mutating_method,
        "derived request keys"
    );
    request.extensions_mut().insert(keys);
    next.run(request).await
}
