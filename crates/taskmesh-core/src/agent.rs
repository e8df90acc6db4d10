use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Live record of a worker agent registered with the delegation engine.
///
/// Owned by the agent registry; load and performance fields are mutated only
/// by the delegation engine (load on assignment/completion, success rate and
/// response time on feedback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    /// Capability tags this agent can serve. A task is only eligible for an
    /// agent whose capabilities are a superset of the task's requirements.
    pub capabilities: HashSet<String>,
    /// Fraction of capacity currently in use, in `[0, 1]`.
    pub current_load: f64,
    /// Number of tasks this agent can run at once.
    pub max_capacity: u32,
    /// Exponential moving average of task success, in `[0, 1]`.
    pub success_rate: f64,
    /// Exponential moving average of task execution time in milliseconds.
    pub avg_response_time_ms: f64,
    pub is_available: bool,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Create a new available agent with a fresh id and neutral metrics.
    pub fn new(name: impl Into<String>, max_capacity: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capabilities: HashSet::new(),
            current_load: 0.0,
            max_capacity: max_capacity.max(1),
            success_rate: 1.0,
            avg_response_time_ms: 1_000.0,
            is_available: true,
            registered_at: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load.clamp(0.0, 1.0);
        self
    }

    /// Whether this agent can serve every required capability.
    pub fn can_handle(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Load increment corresponding to one task slot.
    pub fn slot_load(&self) -> f64 {
        1.0 / f64::from(self.max_capacity)
    }

    /// Whether taking one more task slot would push the agent past full
    /// capacity.
    ///
    /// Loads seeded from a store may sit between slot boundaries, so an
    /// agent can be at capacity below a load of 1.0; assignment still caps
    /// the load at 1.0.
    pub fn at_capacity(&self) -> bool {
        self.current_load + self.slot_load() > 1.0 + 1e-9
    }
}
