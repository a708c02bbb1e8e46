//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::membership::types::{IdFactory, Node, NodeId};
use crate::metrics::{ClusterMetrics, OversizeOutcome};
use crate::resolver::Resolve;
use crate::transport::{Transport, TransportError, TransportEvent};

pub fn node(id: &str, addr: &str) -> Node {
    Node::new(NodeId::from(id), addr.parse().unwrap())
}

// ============================================================
// TRANSPORT
// ============================================================

/// In-memory transport that records every call.
pub struct FakeTransport {
    local: Node,
    members: Mutex<Vec<Node>>,
    max_packet_size: usize,
    unreachable: Mutex<HashSet<String>>,
    pub joins: Mutex<Vec<Vec<String>>>,
    pub reliable: Mutex<Vec<(Node, Vec<u8>)>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
    pub left: AtomicBool,
    pub stopped: AtomicBool,
    /// When set, `leave` gives up with a timeout instead of succeeding.
    pub leave_times_out: AtomicBool,
}

impl FakeTransport {
    /// A transport whose member view holds only `local`, plus the sender that
    /// feeds its event stream.
    pub fn new(
        local: Node,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            members: Mutex::new(vec![local.clone()]),
            local,
            max_packet_size: 1400,
            unreachable: Mutex::new(HashSet::new()),
            joins: Mutex::new(Vec::new()),
            reliable: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            left: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            leave_times_out: AtomicBool::new(false),
        });
        (transport, tx, rx)
    }

    pub fn set_members(&self, members: Vec<Node>) {
        *self.members.lock() = members;
    }

    /// Joins and reliable sends to `addr` fail from now on.
    pub fn make_unreachable(&self, addr: &str) {
        self.unreachable.lock().insert(addr.to_string());
    }

    pub fn joined_addresses(&self) -> Vec<String> {
        self.joins.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn local_node(&self) -> Node {
        self.local.clone()
    }

    fn members(&self) -> Vec<Node> {
        self.members.lock().clone()
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn join(&self, addrs: &[String]) -> Result<usize, TransportError> {
        self.joins.lock().push(addrs.to_vec());
        let unreachable = self.unreachable.lock();
        let reached = addrs.iter().filter(|a| !unreachable.contains(*a)).count();
        if reached == 0 && !addrs.is_empty() {
            return Err(TransportError::JoinFailed {
                attempted: addrs.len(),
                last_error: "unreachable".to_string(),
            });
        }
        Ok(reached)
    }

    async fn leave(&self, timeout: Duration) -> Result<(), TransportError> {
        self.left.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        if self.leave_times_out.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(timeout));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn send_reliable(&self, node: &Node, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(&node.addr.to_string()) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "unreachable",
            )));
        }
        self.reliable.lock().push((node.clone(), payload));
        Ok(())
    }

    fn queue_broadcast(&self, payload: Vec<u8>) {
        self.broadcasts.lock().push(payload);
    }
}

// ============================================================
// METRICS
// ============================================================

#[derive(Default)]
pub struct CountingMetrics {
    pub peer_info: Mutex<Vec<String>>,
    pub failed_peers: AtomicUsize,
    pub reconnections: AtomicUsize,
    pub reconnections_failed: AtomicUsize,
    pub refresh_joins: AtomicUsize,
    pub refresh_joins_failed: AtomicUsize,
    pub joined: AtomicUsize,
    pub left: AtomicUsize,
    pub updated: AtomicUsize,
    pub oversize: Mutex<Vec<(String, OversizeOutcome)>>,
    pub oversize_sends: AtomicUsize,
}

impl CountingMetrics {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl ClusterMetrics for CountingMetrics {
    fn peer_info(&self, name: &str) {
        self.peer_info.lock().push(name.to_string());
    }

    fn failed_peers(&self, count: usize) {
        self.failed_peers.store(count, Ordering::SeqCst);
    }

    fn reconnection(&self, succeeded: bool) {
        self.reconnections.fetch_add(1, Ordering::SeqCst);
        if !succeeded {
            self.reconnections_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn refresh_join(&self, succeeded: bool) {
        self.refresh_joins.fetch_add(1, Ordering::SeqCst);
        if !succeeded {
            self.refresh_joins_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer_joined(&self) {
        self.joined.fetch_add(1, Ordering::SeqCst);
    }

    fn peer_left(&self) {
        self.left.fetch_add(1, Ordering::SeqCst);
    }

    fn peer_updated(&self) {
        self.updated.fetch_add(1, Ordering::SeqCst);
    }

    fn oversize_message(&self, key: &str, outcome: OversizeOutcome) {
        self.oversize.lock().push((key.to_string(), outcome));
    }

    fn oversize_send_duration(&self, _key: &str, _elapsed: Duration) {
        self.oversize_sends.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================
// RESOLVER
// ============================================================

#[derive(Debug, Clone)]
pub enum Answer {
    Ips(Vec<IpAddr>),
    Fail,
}

/// Scripted resolver: each host answers from its queue, repeating the last
/// answer once the queue is down to one. Unknown hosts fail.
#[derive(Default)]
pub struct StaticResolver {
    answers: Mutex<HashMap<String, VecDeque<Answer>>>,
    pub lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, host: &str, answers: Vec<Answer>) -> Self {
        self.answers
            .lock()
            .insert(host.to_string(), answers.into_iter().collect());
        self
    }

    pub fn ips(self, host: &str, ips: &[&str]) -> Self {
        let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        self.answer(host, vec![Answer::Ips(ips)])
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let answer = {
            let mut answers = self.answers.lock();
            match answers.get_mut(host) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match answer {
            Some(Answer::Ips(ips)) => Ok(ips),
            Some(Answer::Fail) | None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such host {host}"),
            )),
        }
    }
}

// ============================================================
// IDS
// ============================================================

/// Hands out the given ids in order, then `extra-<n>`.
pub struct SequenceIds {
    ids: Mutex<VecDeque<NodeId>>,
    extra: AtomicUsize,
}

impl SequenceIds {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ids: Mutex::new(ids.iter().map(|id| NodeId::from(*id)).collect()),
            extra: AtomicUsize::new(0),
        }
    }
}

impl IdFactory for SequenceIds {
    fn next_id(&self) -> NodeId {
        self.ids.lock().pop_front().unwrap_or_else(|| {
            NodeId(format!("extra-{}", self.extra.fetch_add(1, Ordering::SeqCst)))
        })
    }
}

pub fn socket(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}
