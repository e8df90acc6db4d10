use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A unit of work submitted for delegation.
///
/// Immutable after creation except for status transitions, which live in the
/// progress tracker rather than on the task itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub requester_id: String,
    pub query: String,
    /// Capability tags an agent must carry to be eligible.
    pub required_capabilities: HashSet<String>,
    pub priority: i32,
    /// Estimated difficulty in `[0, 1]`.
    pub complexity: f64,
    pub is_urgent: bool,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque caller-supplied context forwarded to the executing agent.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl Task {
    pub fn new(query: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id: requester_id.into(),
            query: query.into(),
            required_capabilities: HashSet::new(),
            priority: 0,
            complexity: 0.5,
            is_urgent: false,
            created_at: Utc::now(),
            deadline: None,
            context: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity.clamp(0.0, 1.0);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.is_urgent = true;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Outcome of one delegation attempt. Never mutated; a retry produces a new
/// result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResult {
    pub success: bool,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub estimated_wait_time_ms: u64,
    pub reason: String,
}

impl DelegationResult {
    pub fn assigned(task_id: Uuid, agent_id: Uuid, estimated_wait_time_ms: u64) -> Self {
        Self {
            success: true,
            task_id,
            agent_id: Some(agent_id),
            estimated_wait_time_ms,
            reason: "assigned".to_string(),
        }
    }

    pub fn queued(task_id: Uuid, estimated_wait_time_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            task_id,
            agent_id: None,
            estimated_wait_time_ms,
            reason: reason.into(),
        }
    }
}

/// Post-execution report consumed exactly once to update the executing
/// agent's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationFeedback {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub was_successful: bool,
    pub execution_time_ms: u64,
    /// Optional satisfaction score in `[0, 1]`.
    pub user_satisfaction: Option<f64>,
}

/// Tunable parameters of the delegation engine.
///
/// The urgent-overflow threshold is deliberately configurable; the default
/// preserves the historical 0.9 cutoff without assuming it is optimal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Weight of the free-capacity factor in the score.
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    /// Weight of the success-rate factor in the score.
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    /// Weight of the response-time factor in the score.
    #[serde(default = "default_response_weight")]
    pub response_weight: f64,
    /// Response times are normalized against this cap, in milliseconds.
    #[serde(default = "default_response_time_cap_ms")]
    pub response_time_cap_ms: f64,
    /// Smoothing factor for the success-rate and response-time moving
    /// averages.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Urgent tasks may overflow a full agent while its load stays below
    /// this ceiling.
    #[serde(default = "default_urgent_load_ceiling")]
    pub urgent_load_ceiling: f64,
    /// Wait estimate reported when no candidate exists to base one on.
    #[serde(default = "default_fallback_wait_ms")]
    pub fallback_wait_ms: u64,
}

fn default_load_weight() -> f64 {
    0.4
}

fn default_success_weight() -> f64 {
    0.4
}

fn default_response_weight() -> f64 {
    0.2
}

fn default_response_time_cap_ms() -> f64 {
    30_000.0
}

fn default_ema_alpha() -> f64 {
    0.1
}

fn default_urgent_load_ceiling() -> f64 {
    0.9
}

fn default_fallback_wait_ms() -> u64 {
    60_000
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            load_weight: default_load_weight(),
            success_weight: default_success_weight(),
            response_weight: default_response_weight(),
            response_time_cap_ms: default_response_time_cap_ms(),
            ema_alpha: default_ema_alpha(),
            urgent_load_ceiling: default_urgent_load_ceiling(),
            fallback_wait_ms: default_fallback_wait_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("research Rust async runtimes", "user-1")
            .with_capabilities(["research"])
            .with_priority(5)
            .with_complexity(0.8)
            .urgent();
        assert_eq!(task.priority, 5);
        assert!(task.is_urgent);
        assert!(task.required_capabilities.contains("research"));
        assert_eq!(task.complexity, 0.8);
    }

    #[test]
    fn test_complexity_clamped() {
        let task = Task::new("q", "u").with_complexity(3.0);
        assert_eq!(task.complexity, 1.0);
    }

    #[test]
    fn test_result_constructors() {
        let task_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let ok = DelegationResult::assigned(task_id, agent_id, 500);
        assert!(ok.success);
        assert_eq!(ok.agent_id, Some(agent_id));

        let queued = DelegationResult::queued(task_id, 2_000, "no suitable agent");
        assert!(!queued.success);
        assert!(queued.agent_id.is_none());
        assert_eq!(queued.reason, "no suitable agent");
    }

    #[test]
    fn test_config_defaults() {
        let config = DelegationConfig::default();
        assert_eq!(config.load_weight, 0.4);
        assert_eq!(config.success_weight, 0.4);
        assert_eq!(config.response_weight, 0.2);
        assert_eq!(config.urgent_load_ceiling, 0.9);
        assert_eq!(config.ema_alpha, 0.1);
    }

    #[test]
    fn test_config_partial_deserialization() {
        let config: DelegationConfig =
            serde_json::from_str(r#"{"urgent_load_ceiling": 0.8}"#).unwrap();
        assert_eq!(config.urgent_load_ceiling, 0.8);
        assert_eq!(config.load_weight, 0.4);
    }

    #[test]
    fn test_task_serialization_round_trip() {
        let task = Task::new("summarize report", "user-2").with_context(serde_json::json!({
            "report_id": 42
        }));
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.context.unwrap()["report_id"], 42);
    }
}
