//! Replicated State Module
//!
//! User state rides on the gossip layer under string keys.
//!
//! ## Core Concepts
//! - **State**: anything that can encode itself and merge remote bytes. Merges
//!   must tolerate duplicates and reordering.
//! - **Registry**: key → state map that answers full-state exchanges and routes
//!   gossiped parts to the right state.
//! - **Channel**: per-key publisher. Small payloads are gossiped, oversize ones
//!   go out by reliable unicast.
//!
//! ## Submodules
//! - **`registry`**: [`State`], [`Part`], [`FullState`] and [`StateRegistry`].
//! - **`channel`**: [`Channel`] and its oversize worker.
//! - **`gset`**: [`GSet`], a grow-only string set.

pub mod channel;
pub mod gset;
pub mod registry;

#[cfg(test)]
mod tests;

pub use channel::Channel;
pub use gset::GSet;
pub use registry::{FullState, Part, State, StateRegistry};
