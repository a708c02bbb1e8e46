//! Membership book: every peer address we know about, and the ordered list of
//! those currently considered failed.
//!
//! The book is a plain data structure; the peer wraps it in a reader/writer
//! lock and does all logging and metrics after releasing it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::types::{Node, PeerRecord};
use crate::error::{ClusterError, Result};

/// What a join notification changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First time we see this address.
    New,
    /// The address was failed and is alive again.
    Rejoined,
    /// The address was already alive; only the node was refreshed.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct MembershipBook {
    by_address: HashMap<SocketAddr, PeerRecord>,
    failed: Vec<SocketAddr>,
}

impl MembershipBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a configured peer as failed so the reconnect loop picks it up.
    /// Returns `false` if the address is already known.
    pub fn seed_failed(&mut self, address: SocketAddr, at: Instant) -> bool {
        if self.by_address.contains_key(&address) {
            return false;
        }
        self.by_address
            .insert(address, PeerRecord::seeded(address, at));
        self.failed.push(address);
        true
    }

    pub fn on_join(&mut self, node: Node) -> JoinOutcome {
        let address = node.address();
        match self.by_address.get_mut(&address) {
            None => {
                self.by_address.insert(address, PeerRecord::alive(node));
                JoinOutcome::New
            }
            Some(record) => {
                let was_failed = record.is_failed();
                record.set_node(node);
                record.mark_alive();
                if was_failed {
                    self.failed.retain(|failed| *failed != address);
                    JoinOutcome::Rejoined
                } else {
                    JoinOutcome::Refreshed
                }
            }
        }
    }

    /// Mark a known peer failed. Unknown addresses, and leaves of an identity
    /// that has since been replaced at the same address, are ignored and
    /// reported as `false`.
    pub fn on_leave(&mut self, node: Node, at: Instant) -> bool {
        let address = node.address();
        let Some(record) = self.by_address.get_mut(&address) else {
            return false;
        };
        if record.node().is_some_and(|current| current.id != node.id) {
            return false;
        }
        record.set_node(node);
        if !record.is_failed() {
            record.mark_failed(at);
            self.failed.push(address);
        }
        true
    }

    pub fn on_update(&mut self, node: Node) -> bool {
        match self.by_address.get_mut(&node.address()) {
            Some(record) => {
                record.set_node(node);
                true
            }
            None => false,
        }
    }

    /// Forget failed peers whose leave time is older than `timeout`.
    pub fn remove_failed_older_than(&mut self, timeout: Duration, now: Instant) -> Vec<PeerRecord> {
        let mut removed = Vec::new();
        let by_address = &mut self.by_address;
        self.failed.retain(|address| {
            let expired = by_address
                .get(address)
                .and_then(|record| record.leave_time())
                .is_some_and(|left| left + timeout < now);
            if expired && let Some(record) = by_address.remove(address) {
                removed.push(record);
            }
            !expired
        });
        removed
    }

    pub fn failed_addresses(&self) -> Vec<SocketAddr> {
        self.failed.clone()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&PeerRecord> {
        self.by_address.get(address)
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Panics if the failed list and the address map disagree.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        for address in &self.failed {
            assert!(seen.insert(*address), "{address} listed as failed twice");
            let record = self
                .by_address
                .get(address)
                .unwrap_or_else(|| panic!("failed {address} missing from book"));
            assert_eq!(record.status(), super::types::PeerStatus::Failed);
        }
        for record in self.by_address.values() {
            assert_eq!(record.is_failed(), record.leave_time().is_some());
            if record.is_failed() {
                assert!(seen.contains(&record.address()));
            }
        }
    }
}

/// Parse a `host:port` peer address whose host must be a literal IP. The
/// transport only advertises dotted decimal or IPv6 addresses, so hostnames
/// could never match a join notification.
pub fn parse_peer_address(peer: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(peer)?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ClusterError::invalid_address("peer", peer, "host is not a literal IP"))?;
    let port: u16 = port
        .parse()
        .map_err(|e| ClusterError::invalid_address("peer", peer, e))?;
    Ok(SocketAddr::new(ip, port))
}

/// Split `host:port`, accepting bracketed IPv6 hosts. The host may be empty.
pub fn split_host_port(addr: &str) -> Result<(&str, &str)> {
    let invalid = |reason: &str| ClusterError::invalid_address("host:port", addr, reason);
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        return Ok((host, port));
    }
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.contains(':') {
        return Err(invalid("too many colons"));
    }
    Ok((host, port))
}

/// Inverse of [`split_host_port`].
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
