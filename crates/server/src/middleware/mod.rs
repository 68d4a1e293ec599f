//! Axum middleware adapters for the pipeline stages.
//!
//! Order matters and is fixed in `app::build_app`:
//!
//! 1. [`fingerprint`] derives the per-request keys and attaches them to the
//!    request extensions.
//! 2. [`peer_router`] invalidates on mutations and forwards cacheable reads
//!    to the owning peer.
//! 3. [`rate_limit`] consumes a token, serves cache hits, and rejects
//!    over-budget tokens with `429`.
//!
//! Token consumption precedes the cache check so hits and misses count
//! equally against the token's budget; invalidation precedes both so a
//! writer can neither be throttled into leaving stale data nor be served
//! from cache; peer routing precedes rate limiting so each token is limited
//! on its single owner node.

use axum::extract::Request;
use tracing::error;
use vaultgate_core::fingerprint::RequestKeys;

pub mod fingerprint;
pub mod peer_router;
pub mod rate_limit;

pub use fingerprint::annotate_request;
pub use peer_router::route_to_owner;
pub use rate_limit::enforce_rate_limit;

/// Reads the keys attached by the fingerprint stage.
///
/// A missing annotation is an internal invariant violation: fatal in
/// development, degraded to an inert non-cacheable classification in
/// production.
pub(crate) fn request_keys(request: &Request) -> RequestKeys {
    if let Some(keys) = request.extensions().get::<RequestKeys>() {
        return keys.clone();
    }
    debug_assert!(false, "request reached the pipeline without derived keys");
    error!("request keys missing from extensions, treating as a non-cacheable read");
    RequestKeys::unannotated()
}
