//! State Registry
//!
//! Maps channel keys to user [`State`]s and bridges them to the transport's
//! anti-entropy hooks: full-state exchanges on push/pull and per-message
//! merges for gossiped parts.

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::transport::LocalState;

/// Replicated user state.
///
/// `merge` may see the same bytes more than once and in any order, so it must
/// be idempotent and commutative for replicas to converge.
pub trait State: Send + Sync + 'static {
    /// Full serialized state, sent to peers on push/pull.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Fold a remote full state or a gossiped delta into this one.
    fn merge(&self, bytes: &[u8]) -> Result<()>;
}

/// Payload tagged with the key of the state it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub key: String,
    pub data: Vec<u8>,
}

/// Every registered state, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullState {
    pub parts: Vec<Part>,
}

pub struct StateRegistry {
    states: DashMap<String, Arc<dyn State>>,
}

impl StateRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: DashMap::new(),
        })
    }

    /// Register `state` under `key`. Registering a key twice replaces the
    /// earlier state.
    pub fn register(&self, key: &str, state: Arc<dyn State>) {
        if self.states.insert(key.to_string(), state).is_some() {
            tracing::warn!("State {} registered twice, keeping the latest", key);
        } else {
            tracing::info!("Registered state: {}", key);
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn State>> {
        self.states.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.states.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Snapshot every state. A state that fails to encode is left out.
    pub fn full_state(&self) -> FullState {
        let mut states: Vec<(String, Arc<dyn State>)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));

        let parts = states
            .into_iter()
            .filter_map(|(key, state)| match state.encode() {
                Ok(data) => Some(Part { key, data }),
                Err(e) => {
                    tracing::warn!("Failed to encode state {}: {:#}", key, e);
                    None
                }
            })
            .collect();
        FullState { parts }
    }

    /// Merge a remote [`FullState`]. Unknown keys are skipped.
    pub fn merge_remote_state(&self, bytes: &[u8]) {
        let full: FullState = match bincode::deserialize(bytes) {
            Ok(full) => full,
            Err(e) => {
                tracing::warn!("Dropping undecodable remote state: {}", e);
                return;
            }
        };
        for part in full.parts {
            self.merge_part(part);
        }
    }

    /// Merge a single gossiped [`Part`].
    pub fn notify_msg(&self, bytes: &[u8]) {
        match bincode::deserialize::<Part>(bytes) {
            Ok(part) => self.merge_part(part),
            Err(e) => tracing::warn!("Dropping undecodable message: {}", e),
        }
    }

    fn merge_part(&self, part: Part) {
        let Some(state) = self.get(&part.key) else {
            tracing::debug!("Dropping part for unknown state {}", part.key);
            return;
        };
        if let Err(e) = state.merge(&part.data) {
            tracing::warn!("Failed to merge state {}: {:#}", part.key, e);
        }
    }
}

impl LocalState for StateRegistry {
    fn local_state(&self) -> Vec<u8> {
        match bincode::serialize(&self.full_state()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode full state: {}", e);
                Vec::new()
            }
        }
    }
}
