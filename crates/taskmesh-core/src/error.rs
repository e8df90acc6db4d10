use thiserror::Error;

/// Convenience alias used across all Taskmesh crates.
pub type MeshResult<T> = Result<T, MeshError>;

/// Top-level error type for the Taskmesh orchestration core.
///
/// Each variant corresponds to one class in the error taxonomy. Validation
/// and circular-dependency errors are rejected before execution and never
/// retried; execution errors are retried per step policy. Capacity outcomes
/// (no agent free) are never raised at all: the delegation engine reports
/// them through `DelegationResult`.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A malformed chain or task definition, rejected before execution.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A cycle in a tool chain's dependency graph, fatal at build time.
    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    /// A tool step or generation call failed at runtime.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A caller violated an operation's precondition (e.g. feedback for an
    /// unknown delegation).
    #[error("Precondition error: {0}")]
    Precondition(String),

    /// The generation service returned a malformed or unparseable answer,
    /// or the call itself failed.
    #[error("Generation error: {0}")]
    Generation(String),

    /// An error from the durable store collaborator.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization failure, for store
    /// implementations that shuttle records through serde.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::Validation("step 'b' references unknown step 'x'".into());
        assert!(err.to_string().starts_with("Validation error"));

        let err = MeshError::CircularDependency("a -> b -> a".into());
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: MeshError = parse_err.into();
        assert!(matches!(err, MeshError::Serialization(_)));
    }
}
