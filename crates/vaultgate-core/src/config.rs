//! Compile-time configuration for the proxy.
//!
//! Every tunable lives here; components take these as constructor defaults
//! so tests can build small instances without touching the constants.

/// Address of the upstream Vault node this sidecar fronts.
pub const UPSTREAM_ADDR: &str = "127.0.0.1";
pub const UPSTREAM_PORT: u16 = 8200;

/// Default listen address for the proxy itself, overridable with `--addr`.
pub const PROXY_ADDR: &str = "127.0.0.1";
pub const PROXY_PORT: u16 = 7200;

/// How long cached responses stay fresh, in seconds.
pub const CACHE_DEFAULT_EXPIRATION_SECS: u64 = 30;

/// Expired cache entries are swept out at most once per this interval.
pub const CACHE_PURGE_FREQUENCY_SECS: u64 = 30;

/// Maximum number of cached responses held at once.
pub const CACHE_SIZE: usize = 1024;

/// Any URL path containing one of these substrings is eligible for caching.
pub const CACHEABLE_SUBPATHS: &[&str] = &["/v1/secret/data"];

/// Methods that mutate key-value state and therefore invalidate the cache.
/// See <https://developer.hashicorp.com/vault/api-docs/secret/kv/kv-v2>.
pub const MUTATING_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

// Rate limiters are purged on a much shorter leash than the response cache:
// deleting a limiter resets that token's accounting, which is only safe for
// idle visitors.

/// A visitor is considered idle after this many seconds without traffic.
pub const RATE_LIMITER_DEFAULT_EXPIRATION_SECS: u64 = 60;

/// Idle visitors are purged at most once per this interval.
pub const RATE_LIMITER_PURGE_FREQUENCY_SECS: u64 = 60;

/// Maximum number of tracked visitors.
pub const RATE_LIMITER_CACHE_SIZE: usize = 1024;

/// Burst requests allowed per second (bucket capacity 1).
pub const BURST_LIMIT_PER_SECOND: u32 = 2;

/// Sustained requests allowed per minute.
pub const RATE_LIMIT_PER_MINUTE: u32 = 5;

/// Capacity of the sustained bucket.
pub const RATE_LIMITER_BUCKET_SIZE: u32 = 5;

// The limiter key is hashed from a fixed prefix and suffix around the token
// so limiter fingerprints can never collide with cache fingerprints.
pub const LIMITER_KEY_PREFIX: &str = "umtmynuxphgogwcickiyyongcdmpldofpqufkvdmckasamrtzk";
pub const LIMITER_KEY_SUFFIX: &str = "fiamhqbicxrgcrfvirlkdxmxzdbxoeojhkfffjsqycxizncojv";

/// Cluster membership is refreshed on this cadence, in seconds.
pub const CONFIG_CHECK_FREQUENCY_SECS: u64 = 5;

/// Token presented to the upstream when fetching raft membership.
pub const UPSTREAM_ROOT_TOKEN: &str = "hvs.replace-with-cluster-root-token";

/// Each peer's sidecar listens on the peer's upstream port minus this offset.
pub const AGENT_PORT_OFFSET: u16 = 1000;

/// Hard deadline for requests forwarded to peer proxies, in seconds.
pub const AGENT_REQUEST_TIMEOUT_SECS: u64 = 2;

/// Seed for the murmur3 token hash. Every peer must use the same seed or
/// owner computation diverges across the fleet.
pub const MURMUR_SEED: u32 = 0x1234_ABCD;

/// Header carrying the client's access token.
pub const VAULT_TOKEN_HEADER: &str = "x-vault-token";

/// Header carrying the client's namespace.
pub const VAULT_NAMESPACE_HEADER: &str = "x-vault-namespace";
