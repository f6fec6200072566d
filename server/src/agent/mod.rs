//! Analysis Plane
//!
//! The per-room agent orchestrator and its fixed analysis graph: incremental
//! state over the transcript, parallel node execution, streaming result
//! fan-out, and the FAQ semantic cache.

pub mod cache;
pub mod customer;
pub mod graph;
pub mod nodes;
pub mod room_agent;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::SemanticCache;
pub use customer::{CustomerContext, CustomerDirectory, HttpCustomerDirectory, UnconfiguredCustomerDirectory};
pub use graph::{NodeKind, NodeOutcome};
pub use room_agent::{AgentDeps, RoomAgentHandle};
pub use state::AgentState;
