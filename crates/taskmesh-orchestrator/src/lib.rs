//! Pipeline orchestration, tool chain execution, and progress tracking.
//!
//! Turns one user request into a response through a fixed sequence of
//! decision stages (context, intent, entities, delegation assessment, then
//! either a hand-off to the delegation engine or a local plan/tools/execution
//! path), with an isolated failure-recovery policy per stage so a single
//! stage failure degrades gracefully instead of aborting the run.
//!
//! # Main types
//!
//! - [`PipelineOrchestrator`] — Top-level sequential state machine per request.
//! - [`ChainExecutor`] — Runs validated tool-step DAGs with retries and backoff.
//! - [`ToolChain`] — Immutable, acyclicity-checked collection of [`ChainStep`]s.
//! - [`ProgressTracker`] — Milestones, lifecycle events, and ETA estimates.
//! - [`RunState`] — The mutable record threaded through one pipeline run.

/// Tool chain construction, validation, and execution.
pub mod chain;
/// Pipeline state machine and stage recovery.
pub mod pipeline;
/// Progress tracking with milestones and bounded event logs.
pub mod progress;

pub use chain::{
    ChainExecutionResult, ChainExecutor, ChainStep, RetryPolicy, ToolChain, ToolRunner,
    TransformRule, Transformation,
};
pub use pipeline::{
    PipelineConfig, PipelineOrchestrator, PipelineRequest, RunState, RunStatus, StageError,
};
pub use progress::{
    Milestone, MilestoneStatus, ProgressConfig, ProgressEvent, ProgressEventType, ProgressInfo,
    ProgressStatus, ProgressTracker,
};
