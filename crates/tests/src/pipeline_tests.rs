//! End-to-end pipeline scenarios.
//!
//! Each test drives the fully composed router (fingerprint → peer router →
//! rate limiter → upstream proxy) against mockito servers standing in for
//! the upstream and for peer proxies.

use std::time::Duration;

use axum::http::StatusCode;
use vaultgate_core::ratelimit::VisitorRegistry;

use crate::mock_infrastructure::{
    peer, wide_open_limiters, TestProxy, VaultMock, SELF_ADDRESS,
};

const FOO_FINGERPRINT_T1: &str = "8ca82b713632188167739eb413b5b0d7";

#[tokio::test]
async fn cache_miss_then_hit_calls_upstream_once() {
    let mut upstream = VaultMock::start().await;
    let kv = upstream.kv_read("/v1/secret/data/foo", "t1", r#"{"k":"v"}"#, 1).await;

    let proxy = TestProxy::single_node(&upstream.url(), wide_open_limiters());

    let (status, headers, body) = proxy.request("GET", "/v1/secret/data/foo", "t1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert_eq!(body.as_ref(), br#"{"k":"v"}"#);

    // Identical request within the TTL: served from cache, byte-identical,
    // headers included; the upstream mock's expect(1) pins the call count.
    let (status, headers, body) = proxy.request("GET", "/v1/secret/data/foo", "t1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert_eq!(body.as_ref(), br#"{"k":"v"}"#);

    kv.assert_async().await;
    assert!(proxy.cache.contains(FOO_FINGERPRINT_T1));
}

#[tokio::test]
async fn mutation_invalidates_and_later_reads_refetch() {
    let mut upstream = VaultMock::start().await;
    let reads = upstream.kv_read("/v1/secret/data/foo", "t1", r#"{"k":"v"}"#, 2).await;
    let writes = upstream.kv_write("/v1/secret/data/foo", "t1", 1).await;

    let proxy = TestProxy::single_node(&upstream.url(), wide_open_limiters());

    // Populate and confirm the hit path.
    proxy.request("GET", "/v1/secret/data/foo", "t1").await;
    proxy.request("GET", "/v1/secret/data/foo", "t1").await;
    assert!(proxy.cache.contains(FOO_FINGERPRINT_T1));

    // The write invalidates before anything else can serve stale data.
    let (status, _, _) = proxy.request("POST", "/v1/secret/data/foo", "t1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!proxy.cache.contains(FOO_FINGERPRINT_T1));

    // The next read misses and goes back to the upstream.
    let (status, _, body) = proxy.request("GET", "/v1/secret/data/foo", "t1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"k":"v"}"#);

    reads.assert_async().await;
    writes.assert_async().await;
}

#[tokio::test]
async fn sixth_request_in_the_budget_window_is_rejected() {
    let mut upstream = VaultMock::start().await;
    let health = upstream.get("/v1/sys/health", 200, "{}", 5).await;

    // Sustained budget of 5 with a bucket of 5; the burst bucket is set
    // non-binding so the sustained bucket decides.
    let limiters = VisitorRegistry::with_settings(
        1_000_000,
        5,
        5,
        64,
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    let proxy = TestProxy::single_node(&upstream.url(), limiters);

    for _ in 0..5 {
        let (status, _, _) = proxy.request("GET", "/v1/sys/health", "t1").await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _, body) = proxy.request("GET", "/v1/sys/health", "t1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body.as_ref(), b"Too Many Requests");

    health.assert_async().await;
}

#[tokio::test]
async fn tokens_are_limited_independently() {
    let mut upstream = VaultMock::start().await;
    let health = upstream.get("/v1/sys/health", 200, "{}", 2).await;

    let limiters = VisitorRegistry::with_settings(
        1_000_000,
        1,
        1,
        64,
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    let proxy = TestProxy::single_node(&upstream.url(), limiters);

    let (status, _, _) = proxy.request("GET", "/v1/sys/health", "alpha").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = proxy.request("GET", "/v1/sys/health", "beta").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = proxy.request("GET", "/v1/sys/health", "alpha").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let (status, _, _) = proxy.request("GET", "/v1/sys/health", "beta").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    health.assert_async().await;
}

#[tokio::test]
async fn cacheable_read_is_forwarded_to_the_owning_peer() {
    let mut upstream = VaultMock::start().await;
    let local_read = upstream.kv_read("/v1/secret/data/x", "t2", r#"{"local":true}"#, 0).await;

    let mut owner_proxy = VaultMock::start().await;
    let forwarded = owner_proxy.kv_read("/v1/secret/data/x", "t2", r#"{"x":1}"#, 1).await;

    let proxy = TestProxy::new(&upstream.url(), wide_open_limiters());
    // Sorted by node id: index 0 is this proxy, index 1 the peer.
    // murmur3_32("t2", seed) is odd, so the peer owns t2.
    proxy.peers.publish(vec![
        peer(SELF_ADDRESS, "raft1"),
        peer(&owner_proxy.address(), "raft2"),
    ]);

    let (status, _, body) = proxy.request("GET", "/v1/secret/data/x", "t2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"x":1}"#);

    forwarded.assert_async().await;
    local_read.assert_async().await;

    // Peer forwarding is terminal: neither the local cache nor the local
    // limiter saw this request.
    assert!(proxy.cache.is_empty());
    assert!(proxy.limiters.is_empty());
}

#[tokio::test]
async fn locally_owned_tokens_are_not_forwarded() {
    let mut upstream = VaultMock::start().await;
    // murmur3_32("token-a", seed) is even, so index 0 (this proxy) owns it.
    let local_read = upstream.kv_read("/v1/secret/data/x", "token-a", r#"{"x":2}"#, 1).await;

    let mut other = VaultMock::start().await;
    let forwarded = other.kv_read("/v1/secret/data/x", "token-a", r#"{"x":1}"#, 0).await;

    let proxy = TestProxy::new(&upstream.url(), wide_open_limiters());
    proxy.peers.publish(vec![peer(SELF_ADDRESS, "raft1"), peer(&other.address(), "raft2")]);

    let (status, _, body) = proxy.request("GET", "/v1/secret/data/x", "token-a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"x":2}"#);

    local_read.assert_async().await;
    forwarded.assert_async().await;
    assert_eq!(proxy.cache.len(), 1);
    assert_eq!(proxy.limiters.len(), 1);
}

#[tokio::test]
async fn unreachable_peer_degrades_to_local_processing() {
    let mut upstream = VaultMock::start().await;
    let local_read = upstream.kv_read("/v1/secret/data/x", "t2", r#"{"x":1}"#, 1).await;

    let proxy = TestProxy::new(&upstream.url(), wide_open_limiters());
    // Nothing listens on the discard port: the forward fails to connect.
    proxy.peers.publish(vec![peer(SELF_ADDRESS, "raft1"), peer("127.0.0.1:9", "raft2")]);

    let (status, _, body) = proxy.request("GET", "/v1/secret/data/x", "t2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"x":1}"#);

    local_read.assert_async().await;
    // Local processing ran in full: limiter consumed, response cached.
    assert_eq!(proxy.cache.len(), 1);
    assert_eq!(proxy.limiters.len(), 1);
}

#[tokio::test]
async fn slow_peer_times_out_and_the_request_is_served_locally() {
    let mut upstream = VaultMock::start().await;
    let local_read = upstream.kv_read("/v1/secret/data/x", "t2", r#"{"x":1}"#, 1).await;

    let mut slow_peer = VaultMock::start().await;
    // Longer than the fixture's 500ms peer deadline.
    let _stalled =
        slow_peer.slow_get("/v1/secret/data/x", r#"{"late":true}"#, Duration::from_millis(900)).await;

    let proxy = TestProxy::new(&upstream.url(), wide_open_limiters());
    proxy.peers.publish(vec![peer(SELF_ADDRESS, "raft1"), peer(&slow_peer.address(), "raft2")]);

    let (status, _, body) = proxy.request("GET", "/v1/secret/data/x", "t2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"x":1}"#);

    local_read.assert_async().await;
    assert_eq!(proxy.cache.len(), 1);
}

#[tokio::test]
async fn empty_membership_processes_everything_locally() {
    let mut upstream = VaultMock::start().await;
    let local_read = upstream.kv_read("/v1/secret/data/x", "t1", r#"{"x":1}"#, 1).await;

    // No peers published: routing is disabled, not a panic.
    let proxy = TestProxy::new(&upstream.url(), wide_open_limiters());

    let (status, _, body) = proxy.request("GET", "/v1/secret/data/x", "t1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"x":1}"#);

    local_read.assert_async().await;
    assert_eq!(proxy.cache.len(), 1);
}

#[tokio::test]
async fn requests_without_a_token_are_cached_under_the_empty_token() {
    let mut upstream = VaultMock::start().await;
    let kv = upstream.get("/v1/secret/data/foo", 200, r#"{"k":"v"}"#, 1).await;

    let proxy = TestProxy::single_node(&upstream.url(), wide_open_limiters());

    let (status, _, _) = proxy.request("GET", "/v1/secret/data/foo", "").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, body) = proxy.request("GET", "/v1/secret/data/foo", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), br#"{"k":"v"}"#);

    kv.assert_async().await;
    // md5("-/v1/secret/data/foo-"): both header values hash as empty.
    assert!(proxy.cache.contains("cb6fa837f3933b509fbdef9f5b77b3a2"));
}

#[tokio::test]
async fn non_200_reads_are_relayed_but_never_cached() {
    let mut upstream = VaultMock::start().await;
    let missing = upstream.get("/v1/secret/data/gone", 404, r#"{"errors":[]}"#, 2).await;

    let proxy = TestProxy::single_node(&upstream.url(), wide_open_limiters());

    for _ in 0..2 {
        let (status, _, body) = proxy.request("GET", "/v1/secret/data/gone", "t1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.as_ref(), br#"{"errors":[]}"#);
    }

    missing.assert_async().await;
    assert!(proxy.cache.is_empty());
}

#[tokio::test]
async fn upstream_failure_on_a_cacheable_read_is_a_500() {
    // Nothing listens on the discard port.
    let proxy = TestProxy::single_node("http://127.0.0.1:9", wide_open_limiters());

    let (status, _, body) = proxy.request("GET", "/v1/secret/data/foo", "t1").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body.as_ref(), b"Internal Server Error");
    assert!(proxy.cache.is_empty());
}

#[tokio::test]
async fn non_cacheable_paths_bypass_the_cache_entirely() {
    let mut upstream = VaultMock::start().await;
    let health = upstream.get("/v1/sys/health", 200, r#"{"sealed":false}"#, 2).await;

    let proxy = TestProxy::single_node(&upstream.url(), wide_open_limiters());

    for _ in 0..2 {
        let (status, _, _) = proxy.request("GET", "/v1/sys/health", "t1").await;
        assert_eq!(status, StatusCode::OK);
    }

    health.assert_async().await;
    assert!(proxy.cache.is_empty());
}
