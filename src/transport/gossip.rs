//! UDP/TCP gossip transport.
//!
//! ## Core Concepts
//! - **Probing**: every `probe_interval` a random alive member is pinged. A
//!   missing ack within `probe_timeout` makes it a suspect, and an unrefuted
//!   suspect is declared dead after `SUSPICION_MULT` probe intervals.
//! - **Incarnations**: every rumour carries the subject's incarnation. A node
//!   that hears it is suspected (or dead while still running) bumps its own
//!   incarnation and announces itself alive again.
//! - **Gossip**: queued user broadcasts piggyback on `User` packets sent to a
//!   few random members every `gossip_interval`.
//! - **Push/pull**: a TCP exchange of full member lists plus the local user
//!   state, used on join and periodically for anti-entropy.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    MemberState, Packet, PushNodeState, Stream, USER_MESSAGE_OVERHEAD, USER_PACKET_OVERHEAD,
    decode_packet, encode_packet, read_frame, write_frame,
};
use super::queue::{BroadcastQueue, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRANSMIT_MULT};
use super::{LocalState, Transport, TransportError, TransportEvent};
use crate::membership::types::{Node, NodeId};
use crate::metrics::ClusterMetrics;

/// Probe intervals a suspect has to refute before it is declared dead.
const SUSPICION_MULT: u32 = 2;

/// How long dead and departed members are remembered, so late rumours about
/// them are recognised as stale.
const DEAD_RECLAIM_TIME: Duration = Duration::from_secs(30);

const UDP_BUFFER_SIZE: usize = 65536;

/// Transport tuning. Built by the peer from
/// [`ClusterConfig`](crate::config::ClusterConfig).
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Address both sockets bind to. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Address announced to other members. A zero port is replaced with the
    /// bound port; `None` announces the bound address itself.
    pub advertise: Option<SocketAddr>,
    pub gossip_interval: Duration,
    /// Members each gossip tick sends to.
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub tcp_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub max_packet_size: usize,
    pub retransmit_mult: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9094)),
            advertise: None,
            gossip_interval: crate::config::DEFAULT_GOSSIP_INTERVAL,
            gossip_nodes: 3,
            push_pull_interval: crate::config::DEFAULT_PUSH_PULL_INTERVAL,
            tcp_timeout: crate::config::DEFAULT_TCP_TIMEOUT,
            probe_timeout: crate::config::DEFAULT_PROBE_TIMEOUT,
            probe_interval: crate::config::DEFAULT_PROBE_INTERVAL,
            max_packet_size: crate::config::DEFAULT_MAX_PACKET_SIZE,
            retransmit_mult: DEFAULT_RETRANSMIT_MULT,
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    node: Node,
    state: MemberState,
    incarnation: u64,
    state_changed: Instant,
}

impl Member {
    fn new(node: Node, incarnation: u64) -> Self {
        Self {
            node,
            state: MemberState::Alive,
            incarnation,
            state_changed: Instant::now(),
        }
    }

    fn set_state(&mut self, state: MemberState) {
        if self.state != state {
            self.state = state;
            self.state_changed = Instant::now();
        }
    }
}

pub struct GossipTransport {
    local: Node,
    config: GossipConfig,
    members: DashMap<NodeId, Member>,
    incarnation: AtomicU64,
    socket: UdpSocket,
    queue: BroadcastQueue,
    acks: DashMap<u32, oneshot::Sender<()>>,
    next_seq: AtomicU32,
    events: mpsc::UnboundedSender<TransportEvent>,
    local_state: Arc<dyn LocalState>,
    metrics: Arc<dyn ClusterMetrics>,
    shutdown: CancellationToken,
    left: AtomicBool,
}

impl GossipTransport {
    /// Bind the UDP and TCP sockets and start the background loops.
    ///
    /// The returned receiver yields every membership change and inbound
    /// message, starting with a `Join` for the local node.
    pub async fn bind(
        id: NodeId,
        config: GossipConfig,
        local_state: Arc<dyn LocalState>,
        metrics: Arc<dyn ClusterMetrics>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let listener = TcpListener::bind(config.bind).await?;
        let bound = listener.local_addr()?;
        let socket = UdpSocket::bind(bound).await?;

        let addr = match config.advertise {
            Some(advertise) if advertise.port() == 0 => SocketAddr::new(advertise.ip(), bound.port()),
            Some(advertise) => advertise,
            None => bound,
        };
        let local = Node::new(id, addr);

        let members = DashMap::new();
        members.insert(local.id.clone(), Member::new(local.clone(), 1));

        let (events, events_rx) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Join(local.clone()));

        let transport = Arc::new(Self {
            local,
            queue: BroadcastQueue::new(DEFAULT_QUEUE_CAPACITY, config.retransmit_mult),
            config,
            members,
            incarnation: AtomicU64::new(1),
            socket,
            acks: DashMap::new(),
            next_seq: AtomicU32::new(0),
            events,
            local_state,
            metrics,
            shutdown: CancellationToken::new(),
            left: AtomicBool::new(false),
        });

        info!("Gossip transport for {} listening on {}", transport.local, bound);
        transport.clone().start(listener);
        Ok((transport, events_rx))
    }

    fn start(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(self.clone().receive_loop());
        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().probe_loop());
        tokio::spawn(self.clone().failure_detection_loop());
        tokio::spawn(self.clone().gossip_loop());
        tokio::spawn(self.push_pull_loop());
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Up to `count` random members other than ourselves matching `filter`.
    fn random_members(&self, count: usize, filter: impl Fn(&Member) -> bool) -> Vec<Node> {
        let mut candidates: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| *entry.key() != self.local.id && filter(entry.value()))
            .map(|entry| entry.value().node.clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        candidates
    }

    async fn send_packet(&self, packet: &Packet, to: SocketAddr) {
        match encode_packet(packet) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    debug!("Failed to send packet to {}: {}", to, e);
                }
            }
            Err(e) => warn!("Failed to encode packet: {}", e),
        }
    }

    /// Send a rumour to every live member, plus `subject` when given so an
    /// accused node hears about it even if we no longer count it as live.
    async fn broadcast(&self, packet: &Packet, subject: Option<SocketAddr>) {
        let mut targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| *entry.key() != self.local.id && entry.value().state.is_live())
            .map(|entry| entry.value().node.addr)
            .collect();
        if let Some(subject) = subject
            && !targets.contains(&subject)
        {
            targets.push(subject);
        }

        for target in targets {
            self.send_packet(packet, target).await;
        }
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, src)) => match decode_packet(&buf[..len]) {
                    Ok(packet) => self.handle_packet(packet, src).await,
                    Err(e) => debug!("Failed to decode packet from {}: {}", src, e),
                },
                Err(e) => {
                    debug!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, src)) => {
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.handle_stream(stream).await {
                            debug!("Stream from {} failed: {}", src, e);
                        }
                    });
                }
                Err(e) => {
                    debug!("Failed to accept TCP connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(target) = self
                .random_members(1, |m| m.state == MemberState::Alive)
                .pop()
            else {
                continue;
            };
            self.probe(target).await;
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval / 2);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let suspicion_timeout = self.config.probe_interval * SUSPICION_MULT;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut expired = Vec::new();
            let mut reclaimed = Vec::new();
            for entry in self.members.iter() {
                let member = entry.value();
                if member.node.id == self.local.id {
                    continue;
                }
                let elapsed = member.state_changed.elapsed();
                match member.state {
                    MemberState::Suspect if elapsed >= suspicion_timeout => {
                        expired.push((member.node.id.clone(), member.incarnation));
                    }
                    MemberState::Dead | MemberState::Left if elapsed >= DEAD_RECLAIM_TIME => {
                        reclaimed.push(member.node.id.clone());
                    }
                    _ => {}
                }
            }

            for id in reclaimed {
                self.members.remove_if(&id, |_, m| !m.state.is_live());
            }

            for (id, incarnation) in expired {
                debug!("Suspect {} did not refute in time", id);
                self.apply_dead(id, incarnation, self.local.id.clone()).await;
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let budget = self
            .config
            .max_packet_size
            .saturating_sub(USER_PACKET_OVERHEAD);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if self.queue.is_empty() {
                continue;
            }

            let targets = self.random_members(self.config.gossip_nodes, |m| m.state.is_live());
            let num_members = self.num_members();
            for target in targets {
                let messages = self
                    .queue
                    .get_broadcasts(num_members, USER_MESSAGE_OVERHEAD, budget);
                if messages.is_empty() {
                    break;
                }
                self.send_packet(&Packet::User { messages }, target.addr)
                    .await;
            }
        }
    }

    async fn push_pull_loop(self: Arc<Self>) {
        let period = self.config.push_pull_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(target) = self.random_members(1, |m| m.state.is_live()).pop() else {
                continue;
            };
            if let Err(e) = self.push_pull(target.addr, false).await {
                debug!("Push/pull with {} failed: {}", target, e);
            }
        }
    }

    // ========================================================================
    // Probing
    // ========================================================================

    async fn probe(&self, target: Node) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.acks.insert(seq, tx);

        let ping = Packet::Ping {
            seq,
            from: self.local.id.clone(),
            target: target.id.clone(),
        };
        self.send_packet(&ping, target.addr).await;

        let acked = matches!(
            tokio::time::timeout(self.config.probe_timeout, rx).await,
            Ok(Ok(()))
        );
        self.acks.remove(&seq);
        if acked {
            return;
        }

        debug!("No ack from {} within {:?}", target, self.config.probe_timeout);
        let Some(incarnation) = self.members.get(&target.id).map(|m| m.incarnation) else {
            return;
        };
        self.apply_suspect(target.id, incarnation, self.local.id.clone())
            .await;
    }

    // ========================================================================
    // Packet handling
    // ========================================================================

    async fn handle_packet(&self, packet: Packet, src: SocketAddr) {
        match packet {
            Packet::Ping { seq, from, target } => {
                if target != self.local.id {
                    debug!("Ignoring ping from {} meant for {}", from, target);
                    return;
                }
                let ack = Packet::Ack {
                    seq,
                    from: self.local.id.clone(),
                };
                self.send_packet(&ack, src).await;
            }

            Packet::Ack { seq, .. } => {
                if let Some((_, waiter)) = self.acks.remove(&seq) {
                    let _ = waiter.send(());
                }
            }

            Packet::Alive { node, incarnation } => {
                self.apply_alive(node, incarnation).await;
            }

            Packet::Suspect {
                id,
                incarnation,
                from,
            } => {
                self.apply_suspect(id, incarnation, from).await;
            }

            Packet::Dead {
                id,
                incarnation,
                from,
            } => {
                self.apply_dead(id, incarnation, from).await;
            }

            Packet::User { messages } => {
                for message in messages {
                    self.emit(TransportEvent::Message(message));
                }
            }
        }
    }

    async fn apply_alive(&self, node: Node, incarnation: u64) {
        if node.id == self.local.id {
            if incarnation > self.incarnation() && !self.left.load(Ordering::SeqCst) {
                self.refute(incarnation).await;
            }
            return;
        }

        if !self.members.contains_key(&node.id) {
            self.evict_address_conflicts(&node);
        }

        let event = match self.members.entry(node.id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Member::new(node.clone(), incarnation));
                Some(TransportEvent::Join(node.clone()))
            }
            Entry::Occupied(mut entry) => {
                let member = entry.get_mut();
                if incarnation <= member.incarnation {
                    return;
                }
                let was_live = member.state.is_live();
                let moved = member.node.addr != node.addr;
                member.node = node.clone();
                member.incarnation = incarnation;
                member.set_state(MemberState::Alive);

                if !was_live {
                    Some(TransportEvent::Join(node.clone()))
                } else if moved {
                    Some(TransportEvent::Update(node.clone()))
                } else {
                    None
                }
            }
        };

        if let Some(event) = event {
            info!("Member {} is alive (inc={})", node, incarnation);
            self.emit(event);
        }
        self.broadcast(&Packet::Alive { node, incarnation }, None)
            .await;
    }

    /// A new identity announcing an address still held by a live member means
    /// that member restarted; its old identity is declared dead.
    fn evict_address_conflicts(&self, node: &Node) {
        let stale: Vec<NodeId> = self
            .members
            .iter()
            .filter(|entry| {
                let member = entry.value();
                member.node.addr == node.addr
                    && member.node.id != node.id
                    && member.node.id != self.local.id
                    && member.state.is_live()
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in stale {
            let evicted = {
                let Some(mut member) = self.members.get_mut(&id) else {
                    continue;
                };
                if !member.state.is_live() {
                    continue;
                }
                member.set_state(MemberState::Dead);
                member.node.clone()
            };
            info!("Member {} replaced by {} at the same address", evicted, node.id);
            self.emit(TransportEvent::Leave(evicted));
        }
    }

    async fn apply_suspect(&self, id: NodeId, incarnation: u64, from: NodeId) {
        if id == self.local.id {
            if incarnation >= self.incarnation() && !self.left.load(Ordering::SeqCst) {
                info!("Refuting suspicion raised by {}", from);
                self.refute(incarnation).await;
            }
            return;
        }

        let subject = {
            let Some(mut member) = self.members.get_mut(&id) else {
                return;
            };
            if incarnation < member.incarnation || member.state != MemberState::Alive {
                return;
            }
            member.incarnation = incarnation;
            member.set_state(MemberState::Suspect);
            member.node.addr
        };

        info!("Member {} suspected by {}", id, from);
        let packet = Packet::Suspect {
            id,
            incarnation,
            from,
        };
        self.broadcast(&packet, Some(subject)).await;
    }

    async fn apply_dead(&self, id: NodeId, incarnation: u64, from: NodeId) {
        if id == self.local.id {
            if !self.left.load(Ordering::SeqCst) {
                info!("Refuting death declared by {}", from);
                self.refute(incarnation).await;
            }
            return;
        }

        let node = {
            let Some(mut member) = self.members.get_mut(&id) else {
                return;
            };
            if incarnation < member.incarnation || !member.state.is_live() {
                return;
            }
            member.incarnation = incarnation;
            member.set_state(if from == id {
                MemberState::Left
            } else {
                MemberState::Dead
            });
            member.node.clone()
        };

        if from == id {
            info!("Member {} left the cluster", node);
        } else {
            info!("Member {} declared dead by {}", node, from);
        }
        self.emit(TransportEvent::Leave(node.clone()));

        let packet = Packet::Dead {
            id,
            incarnation,
            from,
        };
        self.broadcast(&packet, Some(node.addr)).await;
    }

    async fn refute(&self, accused: u64) {
        let mut current = self.incarnation();
        let incarnation = loop {
            let next = current.max(accused) + 1;
            match self.incarnation.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };

        if let Some(mut me) = self.members.get_mut(&self.local.id) {
            me.incarnation = incarnation;
            me.set_state(MemberState::Alive);
        }

        let packet = Packet::Alive {
            node: self.local.clone(),
            incarnation,
        };
        self.broadcast(&packet, None).await;
    }

    // ========================================================================
    // Streams
    // ========================================================================

    fn push_pull_frame(&self, join: bool) -> Stream {
        let members = self
            .members
            .iter()
            .map(|entry| PushNodeState {
                node: entry.value().node.clone(),
                incarnation: entry.value().incarnation,
                state: entry.value().state,
            })
            .collect();
        Stream::PushPull {
            join,
            members,
            user_state: self.local_state.local_state(),
        }
    }

    async fn merge_remote(&self, members: Vec<PushNodeState>, user_state: Vec<u8>) {
        for remote in members {
            match remote.state {
                MemberState::Alive => self.apply_alive(remote.node, remote.incarnation).await,
                // Give the subject a chance to refute instead of trusting a
                // single peer's verdict.
                MemberState::Suspect | MemberState::Dead => {
                    self.apply_suspect(remote.node.id, remote.incarnation, self.local.id.clone())
                        .await
                }
                MemberState::Left => {
                    let id = remote.node.id;
                    self.apply_dead(id.clone(), remote.incarnation, id).await
                }
            }
        }

        if !user_state.is_empty() {
            self.emit(TransportEvent::RemoteState(user_state));
        }
    }

    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<(), TransportError> {
        let timeout = self.config.tcp_timeout;
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, &self.push_pull_frame(join)).await?;
            read_frame(&mut stream).await
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        match reply {
            Stream::PushPull {
                members,
                user_state,
                ..
            } => {
                self.merge_remote(members, user_state).await;
                Ok(())
            }
            Stream::User { .. } => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected a push/pull reply",
            ))),
        }
    }

    async fn handle_stream(&self, mut stream: TcpStream) -> Result<(), TransportError> {
        let timeout = self.config.tcp_timeout;
        let frame = tokio::time::timeout(timeout, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        match frame {
            Stream::PushPull {
                join,
                members,
                user_state,
            } => {
                if join {
                    debug!("Join request with {} member(s)", members.len());
                }
                tokio::time::timeout(timeout, write_frame(&mut stream, &self.push_pull_frame(false)))
                    .await
                    .map_err(|_| TransportError::Timeout(timeout))??;
                self.merge_remote(members, user_state).await;
            }
            Stream::User { payload } => {
                self.emit(TransportEvent::Message(payload));
            }
        }
        Ok(())
    }

    async fn join_one(&self, addr: &str) -> Result<(), TransportError> {
        let timeout = self.config.tcp_timeout;
        let resolved: Vec<SocketAddr> = tokio::time::timeout(timeout, tokio::net::lookup_host(addr))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??
            .collect();

        let mut last_error = TransportError::InvalidAddress(addr.to_string());
        for target in resolved {
            match self.push_pull(target, true).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[async_trait::async_trait]
impl Transport for GossipTransport {
    fn local_node(&self) -> Node {
        self.local.clone()
    }

    fn members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .map(|entry| entry.value().node.clone())
            .collect()
    }

    fn num_members(&self) -> usize {
        self.members
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .count()
    }

    fn max_packet_size(&self) -> usize {
        self.config.max_packet_size
    }

    async fn join(&self, addrs: &[String]) -> Result<usize, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }

        let mut joined = 0;
        let mut last_error = String::new();
        for addr in addrs {
            match self.join_one(addr).await {
                Ok(()) => joined += 1,
                Err(e) => {
                    debug!("Failed to join {}: {}", addr, e);
                    last_error = e.to_string();
                }
            }
        }

        if joined == 0 && !addrs.is_empty() {
            return Err(TransportError::JoinFailed {
                attempted: addrs.len(),
                last_error,
            });
        }
        Ok(joined)
    }

    async fn leave(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut me) = self.members.get_mut(&self.local.id) {
            me.incarnation = incarnation;
            me.set_state(MemberState::Left);
        }

        info!("Leaving the cluster (inc={})", incarnation);
        let packet = Packet::Dead {
            id: self.local.id.clone(),
            incarnation,
            from: self.local.id.clone(),
        };
        let announced = tokio::time::timeout(timeout, self.broadcast(&packet, None)).await;
        self.shutdown.cancel();
        announced.map_err(|_| TransportError::Timeout(timeout))
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn send_reliable(&self, node: &Node, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }

        let timeout = self.config.tcp_timeout;
        let send = async {
            let mut stream = TcpStream::connect(node.addr).await?;
            write_frame(&mut stream, &Stream::User { payload }).await
        };
        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    fn queue_broadcast(&self, payload: Vec<u8>) {
        let pruned = self.queue.enqueue(payload);
        if pruned > 0 {
            self.metrics.broadcasts_pruned(pruned);
        }
    }
}
