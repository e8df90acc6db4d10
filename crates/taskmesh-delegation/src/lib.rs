//! Task delegation across a pool of specialized worker agents.
//!
//! Implements capability-based agent selection: incoming tasks are scored
//! against every available agent (load, success rate, response time), the
//! best candidate is assigned, and tasks that cannot be placed wait in a
//! backlog that is retried whenever feedback frees capacity.
//!
//! # Main types
//!
//! - [`DelegationEngine`] — Scores agents and assigns tasks, owns the backlog.
//! - [`AgentRegistry`] — Shared registry of live [`AgentRecord`]s.
//! - [`Task`] — A unit of work with required capabilities and priority.
//! - [`DelegationResult`] — Outcome of one delegation attempt.
//! - [`DelegationFeedback`] — Post-execution report that updates agent metrics.
//!
//! [`AgentRecord`]: taskmesh_core::AgentRecord

/// Delegation engine, scoring, and backlog processing.
pub mod engine;
/// Shared registry of live worker agents.
pub mod registry;
/// Delegation tasks, results, feedback, and configuration.
pub mod types;

pub use engine::{DelegationEngine, DelegationStats};
pub use registry::AgentRegistry;
pub use types::{DelegationConfig, DelegationFeedback, DelegationResult, Task};
