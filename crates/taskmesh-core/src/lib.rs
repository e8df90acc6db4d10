//! Core types and collaborator traits for the Taskmesh orchestration system.
//!
//! This crate provides the foundation shared by the delegation and
//! orchestration crates: error handling, the agent record, and the two
//! injected collaborator interfaces (generation service and durable store).
//!
//! # Main types
//!
//! - [`MeshError`] — Unified error enum for all Taskmesh subsystems.
//! - [`MeshResult`] — Convenience alias for `Result<T, MeshError>`.
//! - [`AgentRecord`] — Live record of a registered worker agent.
//! - [`GenerationService`] — Injected generative/decision collaborator.
//! - [`DurableStore`] — Injected persistence collaborator.

/// Worker agent records and performance metrics.
pub mod agent;
/// Error types shared across all Taskmesh crates.
pub mod error;
/// Generation service trait and typed answer schemas.
pub mod generate;
/// Durable store trait and the in-memory fallback implementation.
pub mod store;

pub use agent::AgentRecord;
pub use error::{MeshError, MeshResult};
pub use generate::{GenerationService, IntentAnswer, PlanAnswer, PlanStep, ToolsAnswer};
pub use store::{DurableStore, MemoryStore};
