//! Vault-shaped mock servers and a proxy fixture.
//!
//! Wraps mockito with helpers for the endpoints the proxy talks to, and
//! builds a fully composed proxy router pointed at them.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request, Router};
use bytes::Bytes;
use mockito::{Mock, Server, ServerGuard};
use server::app::{build_app, AppState};
use tower::ServiceExt;
use vaultgate_core::{
    cache::ResponseCache,
    dispatch::Dispatcher,
    membership::{PeerDirectory, PeerRecord},
    ratelimit::VisitorRegistry,
};

/// Listen address the fixture proxy claims as its own.
pub const SELF_ADDRESS: &str = "127.0.0.1:7200";

/// A mock Vault node (or peer proxy; the wire shape is the same).
pub struct VaultMock {
    server: ServerGuard,
}

impl VaultMock {
    pub async fn start() -> Self {
        Self { server: Server::new_async().await }
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// `host:port`, as a routing table would carry it.
    #[must_use]
    pub fn address(&self) -> String {
        self.server.host_with_port()
    }

    /// Mocks a KV read that must be called exactly `hits` times.
    pub async fn kv_read(&mut self, path: &str, token: &str, body: &str, hits: usize) -> Mock {
        self.server
            .mock("GET", path)
            .match_header("x-vault-token", token)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    /// Mocks a KV write that must be called exactly `hits` times.
    pub async fn kv_write(&mut self, path: &str, token: &str, hits: usize) -> Mock {
        self.server
            .mock("POST", path)
            .match_header("x-vault-token", token)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"version":2}}"#)
            .expect(hits)
            .create_async()
            .await
    }

    /// Mocks an arbitrary GET with an explicit status.
    pub async fn get(&mut self, path: &str, status: usize, body: &str, hits: usize) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(status)
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    /// Mocks a GET whose response body arrives only after `delay`, to
    /// exercise the peer deadline.
    pub async fn slow_get(&mut self, path: &str, body: &'static str, delay: Duration) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(200)
            .with_chunked_body(move |writer| {
                std::thread::sleep(delay);
                writer.write_all(body.as_bytes())
            })
            .create_async()
            .await
    }
}

/// A composed proxy router plus handles to its shared state.
pub struct TestProxy {
    pub app: Router,
    pub cache: Arc<ResponseCache>,
    pub limiters: Arc<VisitorRegistry>,
    pub peers: Arc<PeerDirectory>,
}

impl TestProxy {
    /// Builds a proxy against `upstream_url` with the given registry. The
    /// membership snapshot starts empty; publish peers as the test needs.
    #[must_use]
    pub fn new(upstream_url: &str, limiters: VisitorRegistry) -> Self {
        let client = reqwest::Client::new();
        let cache = Arc::new(ResponseCache::with_settings(
            64,
            Duration::from_secs(30),
            Duration::from_secs(30),
        ));
        let limiters = Arc::new(limiters);
        let peers = Arc::new(PeerDirectory::with_settings(
            SELF_ADDRESS.to_string(),
            upstream_url.to_string(),
            "root".to_string(),
            client.clone(),
            1000,
            Duration::from_secs(5),
        ));
        let dispatcher = Arc::new(Dispatcher::with_settings(
            client,
            upstream_url.to_string(),
            Duration::from_millis(500),
        ));

        let app = build_app(AppState {
            cache: cache.clone(),
            limiters: limiters.clone(),
            peers: peers.clone(),
            dispatcher: dispatcher.clone(),
        });
        Self { app, cache, limiters, peers }
    }

    /// Builds a proxy whose membership is just itself: every token is owned
    /// locally.
    #[must_use]
    pub fn single_node(upstream_url: &str, limiters: VisitorRegistry) -> Self {
        let proxy = Self::new(upstream_url, limiters);
        proxy.peers.publish(vec![peer(SELF_ADDRESS, "raft1")]);
        proxy
    }

    /// Drives one request through the pipeline without a socket.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: &str,
    ) -> (axum::http::StatusCode, axum::http::HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(path);
        if !token.is_empty() {
            builder = builder.header("x-vault-token", token);
        }
        let request = builder.body(Body::empty()).expect("valid request");

        let response = self.app.clone().oneshot(request).await.expect("infallible service");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("buffered body");
        (status, headers, body)
    }
}

/// A routing-table record for tests.
#[must_use]
pub fn peer(address: &str, node_id: &str) -> PeerRecord {
    PeerRecord {
        address: address.to_string(),
        node_id: node_id.to_string(),
        is_leader: false,
        is_voter: true,
    }
}

/// A registry whose limits never bind, for tests about caching and routing.
///
/// The burst bucket's capacity is fixed at 1, so "never binds" means "always
/// refills between requests": at a million tokens per second the bucket is
/// full again within microseconds, far faster than any HTTP round trip.
#[must_use]
pub fn wide_open_limiters() -> VisitorRegistry {
    VisitorRegistry::with_settings(
        1_000_000,
        6_000_000,
        100_000,
        64,
        Duration::from_secs(600),
        Duration::from_secs(600),
    )
}
