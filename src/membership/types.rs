use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Process-unique peer name. Orders by creation time when produced by
/// [`TimeOrderedIds`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Source of peer names. Injected so tests can pin identities.
pub trait IdFactory: Send + Sync + 'static {
    fn next_id(&self) -> NodeId;
}

/// UUIDv7 in simple form: a 48-bit millisecond prefix followed by random
/// bits, 32 lowercase hex characters that sort by creation time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeOrderedIds;

impl IdFactory for TimeOrderedIds {
    fn next_id(&self) -> NodeId {
        NodeId(uuid::Uuid::now_v7().simple().to_string())
    }
}

/// A cluster member as reported by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// The `ip:port` key the membership book is indexed by.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerStatus {
    Alive,
    Failed,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Alive => f.write_str("alive"),
            PeerStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Book-keeping entry for one peer address.
///
/// `leave_time` is set exactly when the status is [`PeerStatus::Failed`]; the
/// constructors and mutators below are the only way to change either field.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    address: SocketAddr,
    node: Option<Node>,
    status: PeerStatus,
    leave_time: Option<Instant>,
}

impl PeerRecord {
    pub fn alive(node: Node) -> Self {
        Self {
            address: node.address(),
            node: Some(node),
            status: PeerStatus::Alive,
            leave_time: None,
        }
    }

    /// A configured peer we have never heard from.
    pub fn seeded(address: SocketAddr, at: Instant) -> Self {
        Self {
            address,
            node: None,
            status: PeerStatus::Failed,
            leave_time: Some(at),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn leave_time(&self) -> Option<Instant> {
        self.leave_time
    }

    pub fn is_failed(&self) -> bool {
        self.status == PeerStatus::Failed
    }

    pub(crate) fn set_node(&mut self, node: Node) {
        self.node = Some(node);
    }

    pub(crate) fn mark_alive(&mut self) {
        self.status = PeerStatus::Alive;
        self.leave_time = None;
    }

    pub(crate) fn mark_failed(&mut self, at: Instant) {
        self.status = PeerStatus::Failed;
        self.leave_time = Some(at);
    }
}
