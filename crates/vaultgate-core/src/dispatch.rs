//! Outbound HTTP dispatch.
//!
//! All outbound traffic (the upstream behind this sidecar, and peer proxies
//! elsewhere in the fleet) goes through one shared client. Responses come
//! back fully buffered so callers can cache the bytes and serve them to the
//! client from the same copy.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use tracing::debug;

use crate::cache::CapturedResponse;
use crate::config::AGENT_REQUEST_TIMEOUT_SECS;

/// An outbound request that could not be completed: connect failure,
/// deadline expiry, or a broken response body.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("outbound request failed: {0}")]
    Send(#[from] reqwest::Error),
}

impl DispatchError {
    /// True when the failure was the request deadline expiring.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Send(error) => error.is_timeout(),
        }
    }
}

/// Forwards requests to the upstream and to peer proxies.
pub struct Dispatcher {
    client: reqwest::Client,
    upstream_base: String,
    peer_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with the configured peer deadline.
    ///
    /// `upstream_base` is the scheme-and-authority of the upstream, e.g.
    /// `http://127.0.0.1:8200`.
    #[must_use]
    pub fn new(client: reqwest::Client, upstream_base: String) -> Self {
        Self::with_settings(client, upstream_base, Duration::from_secs(AGENT_REQUEST_TIMEOUT_SECS))
    }

    #[must_use]
    pub fn with_settings(
        client: reqwest::Client,
        upstream_base: String,
        peer_timeout: Duration,
    ) -> Self {
        Self { client, upstream_base, peer_timeout }
    }

    /// Dispatches to the upstream, preserving the original headers.
    ///
    /// No deadline: the upstream is local to the node and owns its own
    /// timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the request cannot be sent or the
    /// response body cannot be fully read.
    pub async fn to_upstream(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CapturedResponse, DispatchError> {
        let url = format!("{}{}", self.upstream_base, path_and_query);
        debug!(%url, "dispatching to upstream");
        self.send(method, url, headers, body, None).await
    }

    /// Dispatches to a peer proxy under the peer deadline.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] on connect failure, deadline expiry, or a
    /// broken response body; callers degrade to local processing.
    pub async fn to_peer(
        &self,
        peer_address: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CapturedResponse, DispatchError> {
        let url = format!("http://{peer_address}{path_and_query}");
        debug!(%url, "dispatching to peer");
        self.send(method, url, headers, body, Some(self.peer_timeout)).await
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        headers: &HeaderMap,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<CapturedResponse, DispatchError> {
        let mut request = self.client.request(method, url).headers(headers.clone()).body(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let mut headers = response.headers().clone();
        // The buffered body is re-sent with a definite length.
        headers.remove(http::header::TRANSFER_ENCODING);
        let body = response.bytes().await?;
        Ok(CapturedResponse { status, headers, body })
    }
}
