//! Cluster Peer
//!
//! A [`Peer`] wraps the gossip transport with a membership book, periodic
//! maintenance and a state-registration API.
//!
//! ## Lifecycle
//! 1. [`PeerBuilder::create`] validates the configuration, resolves the known
//!    peers, binds the transport and seeds every resolved peer as failed.
//! 2. [`Peer::join`] contacts the resolved peers once and starts the reconnect,
//!    reaper and refresh loops.
//! 3. [`Peer::settle`] waits until the member count stops changing.
//! 4. [`Peer::leave`] stops the loops and announces the departure.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::book::{JoinOutcome, MembershipBook, join_host_port, parse_peer_address, split_host_port};
use super::types::{IdFactory, Node, NodeId, TimeOrderedIds};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::metrics::{ClusterMetrics, NoopMetrics};
use crate::resolver::{DnsResolver, Resolve, resolve_peers};
use crate::state::{Channel, State, StateRegistry};
use crate::transport::gossip::{GossipConfig, GossipTransport};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Consecutive unchanged polls before [`Peer::settle`] declares readiness.
pub const NUM_OKAY_REQUIRED: usize = 3;

/// Cadence of the failed-peer reaper.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lower bound on the gossip retransmit multiplier.
const MIN_RETRANSMIT_MULT: usize = 3;

/// Diagnostic snapshot returned by [`Peer::info`].
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    #[serde(rename = "self")]
    pub self_node: Node,
    pub members: Vec<Node>,
}

/// Builds a [`Peer`] from a [`ClusterConfig`].
pub struct PeerBuilder {
    config: ClusterConfig,
    metrics: Arc<dyn ClusterMetrics>,
    ids: Arc<dyn IdFactory>,
    resolver: Arc<dyn Resolve>,
    cancel: CancellationToken,
}

impl PeerBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(NoopMetrics),
            ids: Arc::new(TimeOrderedIds),
            resolver: Arc::new(DnsResolver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn metrics(mut self, metrics: Arc<dyn ClusterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id_factory(mut self, ids: Arc<dyn IdFactory>) -> Self {
        self.ids = ids;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Aborts the initial peer resolution when `wait_if_empty` is set.
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn create(self) -> Result<Arc<Peer>> {
        let config = self.config;
        config.validate()?;

        let (bind_host, bind_port) = split_host_port(&config.bind_address)?;
        let bind_port = parse_port("bind", &config.bind_address, bind_port)?;
        let bind_ip: IpAddr = if bind_host.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            bind_host.parse().map_err(|_| {
                ClusterError::invalid_address("bind", &config.bind_address, "host is not a literal IP")
            })?
        };

        let (advertise_host, advertise_port) = match config.advertise_address.as_deref() {
            Some(advertise) if !advertise.is_empty() => {
                let (host, port) = split_host_port(advertise)?;
                let port = parse_port("advertise", advertise, port)?;
                ((!host.is_empty()).then(|| host.to_string()), Some(port))
            }
            _ => (None, None),
        };

        let advertise_ip = match advertise_host {
            Some(host) => lookup_advertise_ip(&host, self.resolver.as_ref()).await?,
            None if bind_ip.is_unspecified() => match default_route_ip() {
                Ok(ip) => {
                    info!("Setting advertise address explicitly to {}", ip);
                    ip
                }
                Err(e) => {
                    warn!("Couldn't deduce an advertise address: {}", e);
                    bind_ip
                }
            },
            None => bind_ip,
        };
        let advertise_port = advertise_port.unwrap_or(bind_port);
        let advertise = join_host_port(&advertise_ip.to_string(), &advertise_port.to_string());

        let resolved_peers = resolve_peers(
            &config.known_peers,
            &advertise,
            self.resolver.as_ref(),
            config.wait_if_empty,
            &self.cancel,
        )
        .await?;

        if is_unroutable(&advertise) && resolved_peers.iter().any(|p| !is_unroutable(p)) {
            warn!("This node advertises itself on an unroutable address {}", advertise);
            warn!("This node will be unreachable in the cluster");
            warn!("Provide advertise_address as a routable IP address or hostname");
        }

        let gossip = GossipConfig {
            bind: SocketAddr::new(bind_ip, bind_port),
            advertise: Some(SocketAddr::new(advertise_ip, advertise_port)),
            gossip_interval: config.gossip_interval(),
            push_pull_interval: config.push_pull_interval(),
            tcp_timeout: config.tcp_timeout(),
            probe_timeout: config.probe_timeout(),
            probe_interval: config.probe_interval(),
            max_packet_size: config.max_packet_size,
            retransmit_mult: (config.known_peers.len() / 2).max(MIN_RETRANSMIT_MULT),
            ..GossipConfig::default()
        };

        let registry = StateRegistry::new();
        let (transport, events) = GossipTransport::bind(
            self.ids.next_id(),
            gossip,
            registry.clone(),
            self.metrics.clone(),
        )
        .await
        .map_err(ClusterError::Transport)?;

        let advertise = transport.local_node().addr.to_string();
        let refresh_interval = config.refresh_interval();
        Ok(Peer::from_parts(PeerParts {
            transport,
            events,
            registry,
            resolver: self.resolver,
            metrics: self.metrics,
            known_peers: config.known_peers,
            resolved_peers,
            advertise,
            refresh_interval,
        }))
    }
}

/// Everything a peer is assembled from once the transport exists.
pub(crate) struct PeerParts {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub registry: Arc<StateRegistry>,
    pub resolver: Arc<dyn Resolve>,
    pub metrics: Arc<dyn ClusterMetrics>,
    pub known_peers: Vec<String>,
    pub resolved_peers: Vec<String>,
    pub advertise: String,
    pub refresh_interval: Duration,
}

pub struct Peer {
    transport: Arc<dyn Transport>,
    registry: Arc<StateRegistry>,
    book: RwLock<MembershipBook>,
    resolver: Arc<dyn Resolve>,
    metrics: Arc<dyn ClusterMetrics>,
    known_peers: Vec<String>,
    resolved_peers: Vec<String>,
    advertise: String,
    refresh_interval: Duration,
    stop: CancellationToken,
    ready: watch::Sender<bool>,
    started: AtomicBool,
}

impl Peer {
    pub(crate) fn from_parts(parts: PeerParts) -> Arc<Self> {
        let PeerParts {
            transport,
            events,
            registry,
            resolver,
            metrics,
            known_peers,
            resolved_peers,
            advertise,
            refresh_interval,
        } = parts;

        let mut book = MembershipBook::new();
        let local = transport.local_node().addr;
        let now = Instant::now();
        for peer in &resolved_peers {
            match parse_peer_address(peer) {
                Ok(address) if address != local => {
                    book.seed_failed(address, now);
                }
                Ok(_) => {}
                Err(e) => debug!("Not seeding {} as failed: {}", peer, e),
            }
        }

        let name = transport.local_node().id;
        metrics.peer_info(name.as_str());
        metrics.failed_peers(book.failed_count());

        let (ready, _) = watch::channel(false);
        let peer = Arc::new(Self {
            transport,
            registry,
            book: RwLock::new(book),
            resolver,
            metrics,
            known_peers,
            resolved_peers,
            advertise,
            refresh_interval,
            stop: CancellationToken::new(),
            ready,
            started: AtomicBool::new(false),
        });

        info!("Created peer {}", peer.transport.local_node());
        tokio::spawn(peer.clone().dispatch_events(events));
        peer
    }

    // ========================================================================
    // Cluster operations
    // ========================================================================

    /// Contact the resolved peers once and start the maintenance loops.
    ///
    /// The loops are started even when the join fails, so the peer keeps
    /// trying to reach the cluster. Calling this again only repeats the join.
    pub async fn join(
        self: &Arc<Self>,
        reconnect_interval: Duration,
        reconnect_timeout: Duration,
    ) -> Result<usize> {
        let result = self.transport.join(&self.resolved_peers).await;
        match &result {
            Ok(joined) => debug!("Joined cluster through {} peer(s)", joined),
            Err(e) => {
                warn!("Failed to join cluster: {}", e);
                if !reconnect_interval.is_zero() {
                    info!("Will retry joining cluster every {:?}", reconnect_interval);
                }
            }
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            if !reconnect_interval.is_zero() {
                self.spawn_periodic(reconnect_interval, |peer| async move {
                    peer.reconnect().await
                });
            }
            if !reconnect_timeout.is_zero() {
                self.spawn_periodic(REAP_INTERVAL, move |peer| async move {
                    peer.remove_failed_peers(reconnect_timeout)
                });
            }
            self.spawn_periodic(self.refresh_interval, |peer| async move {
                peer.refresh().await
            });
        }

        result.map_err(ClusterError::Join)
    }

    /// Seed a literal `ip:port` peer as failed so the reconnect loop tries it.
    pub fn add_peer(&self, peer: &str) -> Result<()> {
        let address = parse_peer_address(peer)?;
        let failed = {
            let mut book = self.book.write();
            if !book.seed_failed(address, Instant::now()) {
                return Ok(());
            }
            book.failed_count()
        };
        debug!("Added peer {} as failed", address);
        self.metrics.failed_peers(failed);
        Ok(())
    }

    /// Register `state` under `key` and return the channel publishing to it.
    pub fn add_state(
        &self,
        key: &str,
        state: Arc<dyn State>,
        metrics: Arc<dyn ClusterMetrics>,
    ) -> Channel {
        self.registry.register(key, state);
        Channel::new(key, self.transport.clone(), metrics, self.stop.clone())
    }

    /// Stop the maintenance loops and announce the departure.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.stop.cancel();
        debug!("Leaving cluster");
        let result = self.transport.leave(timeout).await;
        self.transport.shutdown();
        result.map_err(|e| match e {
            TransportError::Timeout(after) => ClusterError::LeaveTimeout(after),
            other => ClusterError::Leave(other),
        })
    }

    /// Stop everything without telling the cluster.
    pub fn shutdown(&self) {
        self.stop.cancel();
        self.transport.shutdown();
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn name(&self) -> NodeId {
        self.transport.local_node().id
    }

    pub fn self_node(&self) -> Node {
        self.transport.local_node()
    }

    /// The address other members reach this peer on.
    pub fn advertise_address(&self) -> &str {
        &self.advertise
    }

    pub fn cluster_size(&self) -> usize {
        self.transport.num_members()
    }

    /// Current members, including this peer.
    pub fn peers(&self) -> Vec<Node> {
        self.transport.members()
    }

    /// Index of this peer among all members sorted by id.
    pub fn position(&self) -> usize {
        let mut all = self.peers();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let name = self.name();
        all.iter().take_while(|node| node.id != name).count()
    }

    pub fn info(&self) -> ClusterInfo {
        let _book = self.book.read();
        let mut members = self.transport.members();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        ClusterInfo {
            self_node: self.transport.local_node(),
            members,
        }
    }

    /// Addresses currently considered failed, oldest first.
    pub fn failed_peers(&self) -> Vec<SocketAddr> {
        self.book.read().failed_addresses()
    }

    pub fn failed_count(&self) -> usize {
        self.book.read().failed_count()
    }

    pub fn ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn status(&self) -> &'static str {
        if self.ready() { "ready" } else { "settling" }
    }

    /// Wait until the peer is ready or `cancel` fires. Returns readiness.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            result = ready.wait_for(|ready| *ready) => result.is_ok(),
            _ = cancel.cancelled() => self.ready(),
        }
    }

    // ========================================================================
    // Settle
    // ========================================================================

    /// Poll the member count every `interval` and mark the peer ready after
    /// [`NUM_OKAY_REQUIRED`] consecutive polls without change. Cancellation
    /// marks it ready as well.
    pub async fn settle(&self, cancel: &CancellationToken, interval: Duration) {
        info!("Waiting for gossip to settle (interval {:?})", interval);
        let start = Instant::now();
        let mut peers_before = 0;
        let mut okay = 0;
        let mut polls = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "Gossip not settled but continuing anyway ({} polls, {:?} elapsed)",
                        polls,
                        start.elapsed()
                    );
                    self.mark_ready();
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let peers_now = self.peers().len();
            if okay >= NUM_OKAY_REQUIRED {
                info!("Gossip settled after {:?}; proceeding", start.elapsed());
                break;
            }
            if peers_now == peers_before {
                okay += 1;
                debug!("Gossip looks settled after {:?}", start.elapsed());
            } else {
                okay = 0;
                info!(
                    "Gossip not settled (poll {}: {} -> {} peers, {:?} elapsed)",
                    polls,
                    peers_before,
                    peers_now,
                    start.elapsed()
                );
            }
            peers_before = peers_now;
            polls += 1;
        }

        self.mark_ready();
    }

    fn mark_ready(&self) {
        self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn dispatch_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event);
        }
        debug!("Event dispatcher stopped");
    }

    pub(crate) fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Join(node) => self.on_join(node),
            TransportEvent::Leave(node) => self.on_leave(node),
            TransportEvent::Update(node) => self.on_update(node),
            TransportEvent::Message(bytes) => self.registry.notify_msg(&bytes),
            TransportEvent::RemoteState(bytes) => self.registry.merge_remote_state(&bytes),
        }
    }

    fn on_join(&self, node: Node) {
        let (outcome, failed) = {
            let mut book = self.book.write();
            let outcome = book.on_join(node.clone());
            (outcome, book.failed_count())
        };

        self.metrics.peer_joined();
        if outcome == JoinOutcome::Rejoined {
            debug!("Peer {} rejoined", node);
            self.metrics.failed_peers(failed);
        } else {
            debug!("Peer {} joined", node);
        }
    }

    fn on_leave(&self, node: Node) {
        let (known, failed) = {
            let mut book = self.book.write();
            let known = book.on_leave(node.clone(), Instant::now());
            (known, book.failed_count())
        };
        if !known {
            return;
        }

        debug!("Peer {} left", node);
        self.metrics.peer_left();
        self.metrics.failed_peers(failed);
    }

    fn on_update(&self, node: Node) {
        if !self.book.write().on_update(node.clone()) {
            return;
        }
        debug!("Peer {} updated", node);
        self.metrics.peer_updated();
    }

    // ========================================================================
    // Maintenance loops
    // ========================================================================

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, task: F)
    where
        F: Fn(Arc<Peer>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let peer = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = peer.stop.cancelled() => break,
                    _ = interval.tick() => task(peer.clone()).await,
                }
            }
        });
    }

    /// Try every failed address once. Success shows up later as a join event.
    pub(crate) async fn reconnect(&self) {
        let failed = self.book.read().failed_addresses();

        for address in failed {
            if self.stop.is_cancelled() {
                return;
            }
            match self.transport.join(&[address.to_string()]).await {
                Ok(_) => {
                    debug!("Reconnected to {}", address);
                    self.metrics.reconnection(true);
                }
                Err(e) => {
                    debug!("Reconnect to {} failed: {}", address, e);
                    self.metrics.reconnection(false);
                }
            }
        }
    }

    pub(crate) fn remove_failed_peers(&self, timeout: Duration) {
        let (removed, failed) = {
            let mut book = self.book.write();
            let removed = book.remove_failed_older_than(timeout, Instant::now());
            (removed, book.failed_count())
        };
        if removed.is_empty() {
            return;
        }

        for record in &removed {
            debug!("Failed peer {} has timed out", record.address());
        }
        self.metrics.failed_peers(failed);
    }

    /// Re-resolve the known peers and join any address that is not a member.
    pub(crate) async fn refresh(&self) {
        let resolved = match resolve_peers(
            &self.known_peers,
            &self.advertise,
            self.resolver.as_ref(),
            false,
            &self.stop,
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!("Refresh of {:?} failed: {}", self.known_peers, e);
                return;
            }
        };

        let members: HashSet<String> = self
            .transport
            .members()
            .iter()
            .map(|member| member.addr.to_string())
            .collect();

        for peer in resolved {
            if members.contains(&peer) {
                continue;
            }
            match self.transport.join(std::slice::from_ref(&peer)).await {
                Ok(_) => {
                    debug!("Refresh joined {}", peer);
                    self.metrics.refresh_join(true);
                }
                Err(e) => {
                    debug!("Refresh join of {} failed: {}", peer, e);
                    self.metrics.refresh_join(false);
                }
            }
        }
    }
}

fn parse_port(kind: &'static str, addr: &str, port: &str) -> Result<u16> {
    port.parse()
        .map_err(|e| ClusterError::invalid_address(kind, addr, format!("wrong port: {e}")))
}

async fn lookup_advertise_ip(host: &str, resolver: &dyn Resolve) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let ips = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| ClusterError::invalid_address("advertise", host, e))?;
    ips.into_iter()
        .next()
        .ok_or_else(|| ClusterError::invalid_address("advertise", host, "host resolved to no address"))
}

/// IP of the interface holding the default route. Connecting a UDP socket
/// sends nothing.
fn default_route_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    Ok(socket.local_addr()?.ip())
}

/// Loopback, unspecified and `localhost` addresses cannot be reached by
/// other hosts.
pub(crate) fn is_unroutable(addr: &str) -> bool {
    let host = split_host_port(addr).map(|(host, _)| host).unwrap_or(addr);
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified() || ip.is_loopback(),
        Err(_) => host == "localhost",
    }
}
