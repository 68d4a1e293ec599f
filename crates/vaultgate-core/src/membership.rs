//! Cluster membership and consistent-hash peer routing.
//!
//! The proxy fleet learns its own shape from the upstream's raft
//! configuration endpoint. Each peer's upstream address is rewritten to the
//! address of the sidecar proxy running next to it, the list is sorted by
//! node id, and the result is published as an immutable snapshot. Routing
//! then hashes the request token over the snapshot so that, for a stable
//! membership, every peer computes the same owner for the same token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    AGENT_PORT_OFFSET, CONFIG_CHECK_FREQUENCY_SECS, MURMUR_SEED, VAULT_TOKEN_HEADER,
};

/// Errors from a membership refresh. A failed refresh never disturbs the
/// previously published snapshot.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed membership payload: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One server as reported by `/v1/sys/storage/raft/configuration`.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftServer {
    pub address: String,
    pub node_id: String,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub voter: bool,
    #[serde(default)]
    pub protocol_version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RaftConfig {
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub servers: Vec<RaftServer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RaftData {
    #[serde(default)]
    pub config: RaftConfig,
}

/// Envelope of the raft configuration response. Lease metadata and warnings
/// are ignored.
#[derive(Debug, Deserialize)]
pub struct RaftConfigResponse {
    #[serde(default)]
    pub data: RaftData,
}

/// One peer proxy, post address rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Sidecar proxy address, `host:port`.
    pub address: String,
    pub node_id: String,
    pub is_leader: bool,
    pub is_voter: bool,
}

/// Immutable view of the fleet, sorted ascending by node id.
///
/// The sorted vector doubles as the routing table: index `i` owns every
/// token whose hash lands on `i` modulo the peer count.
#[derive(Debug)]
pub struct MembershipSnapshot {
    pub peers: Vec<PeerRecord>,
    pub refreshed_at: Instant,
}

/// Tracks fleet membership and answers owner lookups.
pub struct PeerDirectory {
    snapshot: ArcSwap<MembershipSnapshot>,
    self_address: String,
    membership_url: String,
    root_token: String,
    client: reqwest::Client,
    port_offset: u16,
    refresh_frequency: Duration,
}

impl PeerDirectory {
    /// Creates a directory with the configured port offset and refresh
    /// cadence. The snapshot starts empty until the first refresh.
    #[must_use]
    pub fn new(
        self_address: String,
        upstream_base: String,
        root_token: String,
        client: reqwest::Client,
    ) -> Self {
        Self::with_settings(
            self_address,
            upstream_base,
            root_token,
            client,
            AGENT_PORT_OFFSET,
            Duration::from_secs(CONFIG_CHECK_FREQUENCY_SECS),
        )
    }

    #[must_use]
    pub fn with_settings(
        self_address: String,
        upstream_base: String,
        root_token: String,
        client: reqwest::Client,
        port_offset: u16,
        refresh_frequency: Duration,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(MembershipSnapshot {
                peers: Vec::new(),
                refreshed_at: Instant::now(),
            }),
            self_address,
            membership_url: format!("{upstream_base}/v1/sys/storage/raft/configuration"),
            root_token,
            client,
            port_offset,
            refresh_frequency,
        }
    }

    /// This proxy's own listen address, as peers would route to it.
    #[must_use]
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Returns the current snapshot. Readers observe a whole snapshot or
    /// its predecessor, never a partial update.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshot.load_full()
    }

    /// Sorts `peers` by node id and publishes them atomically.
    pub fn publish(&self, mut peers: Vec<PeerRecord>) {
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        debug!(peers = ?peers.iter().map(|p| &p.address).collect::<Vec<_>>(), "publishing routing table");
        self.snapshot.store(Arc::new(MembershipSnapshot { peers, refreshed_at: Instant::now() }));
    }

    /// Rewrites raft server addresses to their sidecar proxies and
    /// publishes the result.
    pub fn apply_raft_servers(&self, servers: Vec<RaftServer>) {
        let peers = servers
            .into_iter()
            .map(|server| PeerRecord {
                address: rewrite_address(&server.address, self.port_offset),
                node_id: server.node_id,
                is_leader: server.leader,
                is_voter: server.voter,
            })
            .collect::<Vec<_>>();
        info!(peer_count = peers.len(), "applying cluster membership");
        self.publish(peers);
    }

    /// Fetches membership from the upstream and publishes a new snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure or an unparseable payload; the
    /// previous snapshot stays in place either way.
    pub async fn refresh_now(&self) -> Result<usize, MembershipError> {
        let response = self
            .client
            .get(&self.membership_url)
            .header("accept", "application/json")
            .header(VAULT_TOKEN_HEADER, &self.root_token)
            .send()
            .await?;
        let body = response.bytes().await?;
        let parsed: RaftConfigResponse = serde_json::from_slice(&body)?;

        let servers = parsed.data.config.servers;
        let count = servers.len();
        self.apply_raft_servers(servers);
        Ok(count)
    }

    /// Runs the refresh loop on its own task, ticking immediately and then
    /// on every refresh interval, so requests never pay refresh latency.
    pub fn spawn_refresher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(self.refresh_frequency);
            loop {
                ticks.tick().await;
                match self.refresh_now().await {
                    Ok(peer_count) => debug!(peer_count, "membership refreshed"),
                    Err(error) => {
                        warn!(%error, "membership refresh failed, keeping previous snapshot");
                    }
                }
            }
        })
    }

    /// Returns the owning peer's address for `token`, or `None` when no
    /// membership is known, in which case the request is processed locally.
    #[must_use]
    pub fn owner_for(&self, token: &str) -> Option<String> {
        let snapshot = self.snapshot.load();
        if snapshot.peers.is_empty() {
            return None;
        }
        let hash = mur3::murmurhash3_x86_32(token.as_bytes(), MURMUR_SEED);
        let index = hash as usize % snapshot.peers.len();
        Some(snapshot.peers[index].address.clone())
    }
}

/// Maps an upstream node address to its sidecar proxy address by shifting
/// the port down by the configured offset. Unparseable addresses pass
/// through unchanged so a malformed peer degrades rather than panics.
fn rewrite_address(address: &str, offset: u16) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => format!("{host}:{}", port.saturating_sub(offset)),
            Err(_) => {
                warn!(%address, "peer address has a non-numeric port, leaving it unchanged");
                address.to_string()
            }
        },
        None => {
            warn!(%address, "peer address has no port, leaving it unchanged");
            address.to_string()
        }
    }
}
