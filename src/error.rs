//! Cluster error types.
//!
//! Construction problems (bad addresses, unresolvable peers, a transport that
//! cannot bind) are surfaced to the caller. Runtime network faults never reach
//! this type: they become log lines and counter increments.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by [`Peer`](crate::membership::peer::Peer) operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// An address could not be split or parsed.
    #[error("invalid {kind} address {addr:?}: {reason}")]
    InvalidAddress {
        kind: &'static str,
        addr: String,
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Initial peer resolution gave up.
    #[error("failed to resolve peers: {0}")]
    Resolve(String),

    /// The transport could not be created.
    #[error("failed to create transport: {0}")]
    Transport(#[source] TransportError),

    /// The synchronous join attempt reached no peer.
    #[error("failed to join cluster: {0}")]
    Join(#[source] TransportError),

    /// The leave broadcast did not complete in time.
    #[error("leaving the cluster timed out after {0:?}")]
    LeaveTimeout(Duration),

    /// The transport failed while leaving.
    #[error("failed to leave cluster: {0}")]
    Leave(#[source] TransportError),
}

impl ClusterError {
    pub(crate) fn invalid_address(
        kind: &'static str,
        addr: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        ClusterError::InvalidAddress {
            kind,
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error was caused by user-supplied configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidAddress { .. } | ClusterError::Config(_)
        )
    }
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
