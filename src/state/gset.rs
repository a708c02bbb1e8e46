use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::BTreeSet;

use super::registry::State;

/// Grow-only set of strings. Both full states and deltas are a bincode
/// `Vec<String>`, and merging is set union.
#[derive(Debug, Default)]
pub struct GSet {
    items: RwLock<BTreeSet<String>>,
}

impl GSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the item was not present yet.
    pub fn add(&self, item: impl Into<String>) -> bool {
        self.items.write().insert(item.into())
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.read().contains(item)
    }

    /// Items in ascending order.
    pub fn items(&self) -> Vec<String> {
        self.items.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Encode `items` as a delta suitable for [`Channel::broadcast`](super::Channel::broadcast).
    pub fn delta(items: &[String]) -> Result<Vec<u8>> {
        Ok(bincode::serialize(items)?)
    }
}

impl State for GSet {
    fn encode(&self) -> Result<Vec<u8>> {
        Self::delta(&self.items())
    }

    fn merge(&self, bytes: &[u8]) -> Result<()> {
        let incoming: Vec<String> =
            bincode::deserialize(bytes).context("decoding g-set payload")?;
        self.items.write().extend(incoming);
        Ok(())
    }
}
