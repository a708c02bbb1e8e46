//! Cluster metrics.
//!
//! The peer reports events through the [`ClusterMetrics`] sink it was built
//! with. Registration and export are the caller's business: [`RecorderMetrics`]
//! forwards to whatever global `metrics` recorder is installed, and the binary
//! installs the Prometheus exporter with [`init_metrics`].

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

// -- Metric name constants ----------------------------------------------------

/// Constant `1` labelled by peer name (gauge). Labels: peer.
pub const PEER_INFO: &str = "gossip_cluster_peer_info";

/// Current number of failed peers (gauge).
pub const FAILED_PEERS: &str = "gossip_cluster_failed_peers";

/// Successful reconnections to failed peers (counter).
pub const RECONNECTIONS_TOTAL: &str = "gossip_cluster_reconnections_total";

/// Failed reconnection attempts (counter).
pub const RECONNECTIONS_FAILED_TOTAL: &str = "gossip_cluster_reconnections_failed_total";

/// Peers joined through the DNS refresh loop (counter).
pub const REFRESH_JOIN_TOTAL: &str = "gossip_cluster_refresh_join_total";

/// Failed join attempts from the DNS refresh loop (counter).
pub const REFRESH_JOIN_FAILED_TOTAL: &str = "gossip_cluster_refresh_join_failed_total";

/// Join notifications (counter).
pub const PEERS_JOINED_TOTAL: &str = "gossip_cluster_peers_joined_total";

/// Leave notifications (counter).
pub const PEERS_LEFT_TOTAL: &str = "gossip_cluster_peers_left_total";

/// Update notifications (counter).
pub const PEERS_UPDATE_TOTAL: &str = "gossip_cluster_peers_update_total";

/// Oversize messages handed to reliable unicast (counter). Labels: key.
pub const OVERSIZE_MESSAGES_TOTAL: &str = "gossip_cluster_oversize_gossip_message_total";

/// Oversize messages dropped because the send queue was full (counter). Labels: key.
pub const OVERSIZE_DROPPED_TOTAL: &str = "gossip_cluster_oversize_gossip_message_dropped_total";

/// Per-peer oversize sends that failed (counter). Labels: key.
pub const OVERSIZE_FAILED_TOTAL: &str = "gossip_cluster_oversize_gossip_message_failed_total";

/// Time to push one oversize message to every peer (histogram). Labels: key.
pub const OVERSIZE_DURATION_SECONDS: &str = "gossip_cluster_oversize_gossip_message_duration_seconds";

/// Broadcasts discarded because the queue was full (counter).
pub const BROADCASTS_PRUNED_TOTAL: &str = "gossip_cluster_broadcasts_pruned_total";

/// What happened to an oversize message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizeOutcome {
    Queued,
    Dropped,
    SendFailed,
}

/// Sink for cluster events. Every method defaults to a no-op so callers only
/// implement what they export.
pub trait ClusterMetrics: Send + Sync + 'static {
    fn peer_info(&self, _name: &str) {}

    fn failed_peers(&self, _count: usize) {}

    fn reconnection(&self, _succeeded: bool) {}

    fn refresh_join(&self, _succeeded: bool) {}

    fn peer_joined(&self) {}

    fn peer_left(&self) {}

    fn peer_updated(&self) {}

    fn oversize_message(&self, _key: &str, _outcome: OversizeOutcome) {}

    fn oversize_send_duration(&self, _key: &str, _elapsed: Duration) {}

    fn broadcasts_pruned(&self, _count: usize) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ClusterMetrics for NoopMetrics {}

/// Forwards events to the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl ClusterMetrics for RecorderMetrics {
    fn peer_info(&self, name: &str) {
        gauge!(PEER_INFO, "peer" => name.to_string()).set(1.0);
    }

    fn failed_peers(&self, count: usize) {
        gauge!(FAILED_PEERS).set(count as f64);
    }

    fn reconnection(&self, succeeded: bool) {
        if succeeded {
            counter!(RECONNECTIONS_TOTAL).increment(1);
        } else {
            counter!(RECONNECTIONS_FAILED_TOTAL).increment(1);
        }
    }

    fn refresh_join(&self, succeeded: bool) {
        if succeeded {
            counter!(REFRESH_JOIN_TOTAL).increment(1);
        } else {
            counter!(REFRESH_JOIN_FAILED_TOTAL).increment(1);
        }
    }

    fn peer_joined(&self) {
        counter!(PEERS_JOINED_TOTAL).increment(1);
    }

    fn peer_left(&self) {
        counter!(PEERS_LEFT_TOTAL).increment(1);
    }

    fn peer_updated(&self) {
        counter!(PEERS_UPDATE_TOTAL).increment(1);
    }

    fn oversize_message(&self, key: &str, outcome: OversizeOutcome) {
        let name = match outcome {
            OversizeOutcome::Queued => OVERSIZE_MESSAGES_TOTAL,
            OversizeOutcome::Dropped => OVERSIZE_DROPPED_TOTAL,
            OversizeOutcome::SendFailed => OVERSIZE_FAILED_TOTAL,
        };
        counter!(name, "key" => key.to_string()).increment(1);
    }

    fn oversize_send_duration(&self, key: &str, elapsed: Duration) {
        histogram!(OVERSIZE_DURATION_SECONDS, "key" => key.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn broadcasts_pruned(&self, count: usize) {
        counter!(BROADCASTS_PRUNED_TOTAL).increment(count as u64);
    }
}

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent; a second recorder
/// already installed by the host process is reported as an error.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Handle of the installed Prometheus recorder, if any.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_gauge!(PEER_INFO, "A metric with a constant '1' value labeled by peer name.");
    describe_gauge!(FAILED_PEERS, "Number of failed peers in the cluster.");
    describe_counter!(RECONNECTIONS_TOTAL, "Cluster peer reconnections.");
    describe_counter!(RECONNECTIONS_FAILED_TOTAL, "Failed cluster peer reconnection attempts.");
    describe_counter!(REFRESH_JOIN_TOTAL, "Cluster peers joined via refresh.");
    describe_counter!(REFRESH_JOIN_FAILED_TOTAL, "Failed cluster peer join attempts via refresh.");
    describe_counter!(PEERS_JOINED_TOTAL, "Peers that have joined.");
    describe_counter!(PEERS_LEFT_TOTAL, "Peers that have left.");
    describe_counter!(PEERS_UPDATE_TOTAL, "Peers that have updated metadata.");
    describe_counter!(OVERSIZE_MESSAGES_TOTAL, "Oversized gossip messages sent over reliable unicast.");
    describe_counter!(OVERSIZE_DROPPED_TOTAL, "Oversized gossip messages dropped on a full queue.");
    describe_counter!(OVERSIZE_FAILED_TOTAL, "Oversized gossip message sends that failed.");
    describe_histogram!(OVERSIZE_DURATION_SECONDS, "Duration of oversized gossip message requests.");
    describe_counter!(BROADCASTS_PRUNED_TOTAL, "Broadcasts dropped because the queue was full.");
}
