//! # Quorum Core
//!
//! Quorum Core is a local orchestration server that coordinates multiple
//! heterogeneous AI coding agents on software-engineering tasks. One agent
//! opens a task, the routing engine picks an execution strategy and
//! assignees, participating agents contribute proposals, and a consensus
//! strategy condenses them into a single recorded decision.
//!
//! ## Architecture
//!
//! - **Store**: durable persistence on a single SQLite file with
//!   transactional compare-and-set state transitions
//! - **EventBus**: typed in-process pub/sub driving internal reactions and
//!   the live operator streams
//! - **AgentRegistry**: discovery, capability strengths, and health of the
//!   participating agents
//! - **RoutingEngine** and **ConsensusEngine**: strategy selection and
//!   proposal evaluation
//! - **Orchestrator**: the per-task state machine tying it all together
//! - **Transport**: JSON-RPC 2.0 over HTTP plus server-sent event streams
//!
//! The context-retrieval subsystem and concrete agent adapters live behind
//! the `ContextProvider` and `AgentTransport` traits in [`agents`].

/// External collaborator contracts and the default HTTP agent transport
pub mod agents;
/// Layered configuration and CLI flags
pub mod config;
/// Proposal collection and consensus strategies
pub mod consensus;
/// System-wide default values
pub mod constants;
/// Error types and JSON-RPC code mapping
pub mod error;
/// Typed in-process publish/subscribe bus
pub mod events;
/// Metrics derived from the event stream
pub mod metrics;
/// Core data models
pub mod models;
/// The central task state machine
pub mod orchestrator;
/// Agent registration, lookup, and health
pub mod registry;
/// Task classification and agent selection
pub mod routing;
/// Durable task store
pub mod store;
/// HTTP transport: JSON-RPC dispatch and SSE streams
pub mod transport;
/// Input validation for the tool surface
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{QuorumError, Result};
