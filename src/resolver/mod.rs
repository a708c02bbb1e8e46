//! Peer Resolver
//!
//! Turns user-supplied `host:port` peers into literal `ip:port` endpoints.
//!
//! ## Core Concepts
//! - **Pass-through**: a failed lookup keeps the input as-is; the refresh loop
//!   will try it again later.
//! - **Waiting**: with `wait_if_empty`, a host that resolves to nothing is
//!   retried every [`RETRY_INTERVAL`] until it resolves or the caller cancels.
//! - **Self-exclusion**: the advertised address never appears in the output.

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};
use crate::membership::book::{join_host_port, split_host_port};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Host name lookup. Injected so tests do not depend on real DNS.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver through tokio's blocking-pool `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl Resolve for DnsResolver {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Resolve `peers`, dropping `advertise` and duplicates while keeping the
/// first-seen order.
pub async fn resolve_peers(
    peers: &[String],
    advertise: &str,
    resolver: &dyn Resolve,
    wait_if_empty: bool,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut resolved: Vec<String> = Vec::new();

    for peer in peers {
        let (host, port) = split_host_port(peer)?;

        loop {
            match resolver.lookup_ip(host).await {
                Err(e) => {
                    tracing::debug!("Lookup of {} failed, using it as-is: {}", peer, e);
                    resolved.push(peer.clone());
                    break;
                }
                Ok(ips) => {
                    let endpoints: Vec<String> = ips
                        .iter()
                        .map(|ip| join_host_port(&ip.to_string(), port))
                        .filter(|endpoint| endpoint != advertise)
                        .collect();

                    if !endpoints.is_empty() || !wait_if_empty {
                        resolved.extend(endpoints);
                        break;
                    }

                    tracing::info!(
                        "Peer {} resolved to no addresses, retrying in {:?}",
                        peer,
                        RETRY_INTERVAL
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ClusterError::Resolve(format!(
                                "gave up waiting for {peer} to resolve"
                            )));
                        }
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    resolved.retain(|endpoint| endpoint != advertise && seen.insert(endpoint.clone()));
    Ok(resolved)
}
