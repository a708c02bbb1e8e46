//! Per-key publish channel.
//!
//! Small payloads ride the transport's broadcast queue. A payload whose
//! encoded part exceeds half the gossip packet budget goes to a bounded
//! oversize queue instead, and a worker pushes it to every other member over
//! reliable unicast.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::registry::Part;
use crate::metrics::{ClusterMetrics, OversizeOutcome};
use crate::transport::Transport;

pub const OVERSIZE_QUEUE_CAPACITY: usize = 200;

pub struct Channel {
    key: String,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn ClusterMetrics>,
    oversize: mpsc::Sender<Vec<u8>>,
}

impl Channel {
    /// Create the channel and spawn its oversize worker, which runs until
    /// `stop` fires.
    pub(crate) fn new(
        key: &str,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn ClusterMetrics>,
        stop: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(OVERSIZE_QUEUE_CAPACITY);
        tokio::spawn(oversize_worker(
            key.to_string(),
            transport.clone(),
            metrics.clone(),
            rx,
            stop,
        ));

        Self {
            key: key.to_string(),
            transport,
            metrics,
            oversize: tx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish `payload` to every member's state under this key.
    pub fn broadcast(&self, payload: Vec<u8>) {
        let part = Part {
            key: self.key.clone(),
            data: payload,
        };
        let encoded = match bincode::serialize(&part) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Failed to encode message for {}: {}", self.key, e);
                return;
            }
        };

        if !self.is_oversize(&encoded) {
            self.transport.queue_broadcast(encoded);
            return;
        }

        match self.oversize.try_send(encoded) {
            Ok(()) => {
                self.metrics
                    .oversize_message(&self.key, OversizeOutcome::Queued);
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Oversize queue for {} is full, dropping message", self.key);
                self.metrics
                    .oversize_message(&self.key, OversizeOutcome::Dropped);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Channel {} is stopped, dropping message", self.key);
            }
        }
    }

    fn is_oversize(&self, encoded: &[u8]) -> bool {
        encoded.len() > self.transport.max_packet_size() / 2
    }
}

async fn oversize_worker(
    key: String,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn ClusterMetrics>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let started = Instant::now();
        let local = transport.local_node();
        let mut sends = JoinSet::new();
        for member in transport.members() {
            if member.id == local.id {
                continue;
            }
            let transport = transport.clone();
            let message = message.clone();
            sends.spawn(async move {
                let result = transport.send_reliable(&member, message).await;
                (member, result)
            });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((member, Err(e))) => {
                    tracing::debug!("Oversize send of {} to {} failed: {}", key, member, e);
                    metrics.oversize_message(&key, OversizeOutcome::SendFailed);
                }
                Err(e) => {
                    tracing::warn!("Oversize send task for {} panicked: {}", key, e);
                    metrics.oversize_message(&key, OversizeOutcome::SendFailed);
                }
            }
        }
        metrics.oversize_send_duration(&key, started.elapsed());
    }
}
