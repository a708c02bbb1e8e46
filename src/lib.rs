//! Gossip Cluster Library
//!
//! A cluster membership peer for services that need to find each other,
//! notice failures and replicate small pieces of state without a central
//! coordinator. The `gossip-node` binary (`main.rs`) is a runnable example.
//!
//! ## Architecture Modules
//! - **`membership`**: the [`Peer`](membership::peer::Peer) and its membership
//!   book. Tracks every peer ever seen, retries failed ones, re-resolves the
//!   configured peers and reports readiness once membership settles.
//! - **`transport`**: the UDP/TCP gossip layer (SWIM-like probing, incarnation
//!   refutation, push/pull anti-entropy) behind the `Transport` trait.
//! - **`state`**: user state replicated under string keys, published through
//!   per-key channels.
//! - **`resolver`**: turns `host:port` peers into literal `ip:port` endpoints.
//! - **`config`**, **`error`**, **`metrics`**: settings, error types and the
//!   metrics sink.

pub mod config;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod resolver;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{ClusterError, Result};
pub use membership::peer::{ClusterInfo, Peer, PeerBuilder};
