//! Transmit-limited broadcast queue.
//!
//! Items are independent: a newer broadcast never invalidates an older one.
//! Each gossip tick hands out items in FIFO order until the packet budget is
//! spent; an item is discarded once it has been transmitted
//! `retransmit_mult * ceil(log10(n + 1))` times for a cluster of `n` members.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_RETRANSMIT_MULT: usize = 4;

#[derive(Debug)]
struct QueuedBroadcast {
    payload: Vec<u8>,
    transmits: usize,
}

#[derive(Debug)]
pub struct BroadcastQueue {
    items: Mutex<VecDeque<QueuedBroadcast>>,
    capacity: usize,
    retransmit_mult: usize,
}

impl BroadcastQueue {
    pub fn new(capacity: usize, retransmit_mult: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            retransmit_mult: retransmit_mult.max(1),
        }
    }

    /// Append a broadcast. When the queue is full the oldest items are
    /// dropped; returns how many were dropped.
    pub fn enqueue(&self, payload: Vec<u8>) -> usize {
        let mut items = self.items.lock();
        items.push_back(QueuedBroadcast {
            payload,
            transmits: 0,
        });
        let mut pruned = 0;
        while items.len() > self.capacity {
            items.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Hand out the broadcasts for one packet to one target.
    ///
    /// `overhead` is charged per message, `limit` is the byte budget of the
    /// whole batch and `num_nodes` the current cluster size.
    pub fn get_broadcasts(&self, num_nodes: usize, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, num_nodes);
        let mut items = self.items.lock();

        // Larger than any packet; would never leave the queue.
        items.retain(|item| {
            let fits = item.payload.len() + overhead <= limit;
            if !fits {
                tracing::warn!(
                    "Dropping broadcast of {} bytes: larger than the {} byte budget",
                    item.payload.len(),
                    limit
                );
            }
            fits
        });

        let mut remaining = limit;
        let mut batch = Vec::new();
        for item in items.iter_mut() {
            let cost = item.payload.len() + overhead;
            if cost > remaining {
                continue;
            }
            remaining -= cost;
            item.transmits += 1;
            batch.push(item.payload.clone());
        }

        items.retain(|item| item.transmits < transmit_limit);
        batch
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRANSMIT_MULT)
    }
}

/// Transmissions an item gets before it is discarded.
pub fn retransmit_limit(mult: usize, num_nodes: usize) -> usize {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    mult * scale.max(1)
}
