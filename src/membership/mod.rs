//! Membership & Discovery Module
//!
//! Keeps track of every peer this node has heard of, on top of the gossip
//! transport's own live-member view.
//!
//! ## Core Mechanisms
//! - **Membership Book**: one record per peer address, alive or failed, plus the
//!   ordered list of failed addresses the reconnect loop works through.
//! - **Maintenance**: failed peers are retried, forgotten after a timeout, and
//!   the configured peers are re-resolved so DNS changes are picked up.
//! - **Settling**: readiness is reported once the member count holds still.

pub mod book;
pub mod peer;
pub mod types;
