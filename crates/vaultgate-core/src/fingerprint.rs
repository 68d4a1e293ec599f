//! Request fingerprinting.
//!
//! Derives the cache key, the limiter key, and the two routing flags from an
//! inbound request, once, before any other stage runs. The server attaches
//! the resulting [`RequestKeys`] to the request so downstream middleware
//! reads instead of reparsing.

use http::{HeaderMap, Method};

use crate::config::{
    CACHEABLE_SUBPATHS, LIMITER_KEY_PREFIX, LIMITER_KEY_SUFFIX, MUTATING_METHODS,
    VAULT_NAMESPACE_HEADER, VAULT_TOKEN_HEADER,
};

/// Derived per-request keys and classification flags.
///
/// Both fingerprints are 32-hex-character MD5 digests. MD5 is a dispersal
/// function here, not a security boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKeys {
    /// MD5 hex of `token-path-namespace`; keys the response cache.
    pub cache_fingerprint: String,
    /// MD5 hex of `prefix-token-suffix`; keys the visitor registry.
    pub limiter_fingerprint: String,
    /// Whether the URL path contains a configured cacheable subpath.
    pub is_cacheable_path: bool,
    /// Whether the method is in the configured mutating set.
    pub is_mutating_method: bool,
}

impl RequestKeys {
    /// Derives the keys from the request's method, URL path, and headers.
    #[must_use]
    pub fn derive(method: &Method, path: &str, headers: &HeaderMap) -> Self {
        let token = header_str(headers, VAULT_TOKEN_HEADER);
        let namespace = header_str(headers, VAULT_NAMESPACE_HEADER);

        Self {
            cache_fingerprint: cache_fingerprint(token, path, namespace),
            limiter_fingerprint: limiter_fingerprint(token),
            is_cacheable_path: is_cacheable_path(path),
            is_mutating_method: is_mutating_method(method),
        }
    }

    /// Neutral keys for a request whose annotation went missing.
    ///
    /// Classifies the request as a non-cacheable read so it is proxied
    /// without touching the cache.
    #[must_use]
    pub fn unannotated() -> Self {
        Self {
            cache_fingerprint: String::new(),
            limiter_fingerprint: limiter_fingerprint(""),
            is_cacheable_path: false,
            is_mutating_method: false,
        }
    }
}

/// Returns the header value as a string, or `""` when absent or non-UTF-8.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// True iff the path contains any configured cacheable subpath.
///
/// Plain substring containment, no anchoring: `/x/v1/secret/data/y` counts.
#[must_use]
pub fn is_cacheable_path(path: &str) -> bool {
    CACHEABLE_SUBPATHS.iter().any(|subpath| path.contains(subpath))
}

/// True iff the method is exactly one of the configured mutating methods.
#[must_use]
pub fn is_mutating_method(method: &Method) -> bool {
    MUTATING_METHODS.iter().any(|m| method.as_str() == *m)
}

fn cache_fingerprint(token: &str, path: &str, namespace: &str) -> String {
    md5_hex(&format!("{token}-{path}-{namespace}"))
}

fn limiter_fingerprint(token: &str) -> String {
    md5_hex(&format!("{LIMITER_KEY_PREFIX}-{token}-{LIMITER_KEY_SUFFIX}"))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
