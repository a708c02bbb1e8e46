//! Transport Module
//!
//! The transport owns the wire: it discovers members, detects failures, gossips
//! small messages and carries reliable unicast. The peer drives it through the
//! [`Transport`] trait and consumes what it observes as a stream of
//! [`TransportEvent`]s, so nothing inside the transport ever calls back into
//! peer code.
//!
//! ## Submodules
//! - **`protocol`**: UDP packets and TCP stream frames, bincode encoded.
//! - **`queue`**: the transmit-limited broadcast queue.
//! - **`gossip`**: [`GossipTransport`](gossip::GossipTransport), the UDP/TCP
//!   implementation (probe → suspect → dead, incarnation refutation, push/pull).

pub mod gossip;
pub mod protocol;
pub mod queue;


use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::membership::types::Node;

/// What the transport observed. Delivered in observation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A member became alive (new, or back from the dead).
    Join(Node),
    /// A member was declared dead or left gracefully.
    Leave(Node),
    /// An alive member changed its advertised node.
    Update(Node),
    /// A user message arrived through gossip or reliable unicast.
    Message(Vec<u8>),
    /// A remote peer's full state arrived through push/pull.
    RemoteState(Vec<u8>),
}

/// Supplies the local full state for push/pull exchanges.
pub trait LocalState: Send + Sync + 'static {
    fn local_state(&self) -> Vec<u8>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to contact any of {attempted} peer(s): {last_error}")]
    JoinFailed { attempted: usize, last_error: String },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("frame of {0} bytes exceeds the stream limit")]
    FrameTooLarge(usize),

    #[error("transport is shut down")]
    Shutdown,
}

/// Contract between the peer and the membership layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This process's member.
    fn local_node(&self) -> Node;

    /// Alive and suspect members, including the local node.
    fn members(&self) -> Vec<Node>;

    fn num_members(&self) -> usize {
        self.members().len()
    }

    /// UDP gossip budget in bytes.
    fn max_packet_size(&self) -> usize;

    /// Contact each address and exchange state. Returns how many answered;
    /// fails only if a non-empty list produced no answer at all.
    async fn join(&self, addrs: &[String]) -> Result<usize, TransportError>;

    /// Announce a graceful departure and stop, waiting up to `timeout`.
    async fn leave(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Stop immediately without telling anyone.
    fn shutdown(&self);

    /// Deliver `payload` to `node` over the reliable channel.
    async fn send_reliable(&self, node: &Node, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Queue `payload` for best-effort gossip.
    fn queue_broadcast(&self, payload: Vec<u8>);
}
