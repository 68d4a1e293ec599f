//! # Vaultgate Core
//!
//! Core library for the vaultgate sidecar proxy, which fronts a clustered
//! Vault deployment and adds per-token response caching, per-token rate
//! limiting, and consistent-hash routing across the proxy fleet.
//!
//! This crate provides the foundational components:
//!
//! - **[`cache`]**: per-token response cache with TTL expiry, batched LRU
//!   eviction, and explicit invalidation on mutating requests.
//!
//! - **[`ratelimit`]**: per-token composite (burst + sustained) token-bucket
//!   rate limiting with LRU bookkeeping and idle purging.
//!
//! - **[`fingerprint`]**: derivation of cache/limiter keys and request
//!   classification (cacheable path, mutating method).
//!
//! - **[`membership`]**: cluster membership snapshots pulled from the
//!   upstream's raft configuration endpoint, with consistent-hash owner
//!   lookup so each token's cache lives on exactly one peer.
//!
//! - **[`dispatch`]**: outbound HTTP dispatch to the upstream and to peer
//!   proxies.
//!
//! HTTP adapter functions (axum middleware and handlers) live in the
//! `server` crate; this crate contains the business logic so it can be
//! tested without HTTP machinery.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────┐
//! │ Fingerprint │  derive cache/limiter keys, classify path + method
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │ Peer Router │ ── mutation ──► invalidate local cache, continue
//! │             │ ── owner ≠ self ──► forward to owner (terminal)
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │ Rate Limit  │ ── cache hit ──► cached response (terminal)
//! │             │ ── denied ──► 429 (terminal)
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │  Upstream   │  proxy verbatim; cache 200s on cacheable reads
//! └─────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod fingerprint;
pub mod membership;
pub mod ratelimit;
