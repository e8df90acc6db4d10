use crate::registry::AgentRegistry;
use crate::types::{DelegationConfig, DelegationFeedback, DelegationResult, Task};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use taskmesh_core::AgentRecord;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one placement attempt against the registry.
enum Placement {
    Assigned { agent_id: Uuid, wait_ms: u64 },
    AtCapacity { wait_ms: u64 },
    NoCandidate,
}

/// Scores and assigns tasks to the best available agent.
///
/// All delegation outcomes are reported through [`DelegationResult`]; the
/// engine never raises. Tasks that cannot be placed wait in a backlog that
/// is retried after every feedback call, so freed capacity is reused
/// immediately.
///
/// Lock order is backlog before registry everywhere, so concurrent
/// delegations, feedback callbacks, and backlog sweeps cannot deadlock or
/// lose load updates.
pub struct DelegationEngine {
    registry: Arc<AgentRegistry>,
    backlog: Mutex<VecDeque<Task>>,
    /// Task id -> agent id for every in-flight assignment. Feedback for a
    /// task that was never assigned is a precondition violation.
    assignments: Mutex<HashMap<Uuid, Uuid>>,
    config: DelegationConfig,
}

impl DelegationEngine {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_config(registry, DelegationConfig::default())
    }

    pub fn with_config(registry: Arc<AgentRegistry>, config: DelegationConfig) -> Self {
        Self {
            registry,
            backlog: Mutex::new(VecDeque::new()),
            assignments: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// The registry this engine assigns against.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Attempt to place a task on the best available agent.
    ///
    /// Scoring weighs free capacity, success rate, and response time; the
    /// highest-scoring eligible agent wins, ties broken by lowest load. A
    /// task that cannot be placed is appended to the backlog exactly once
    /// and reported with `success: false`.
    pub async fn delegate(&self, task: Task) -> DelegationResult {
        let mut backlog = self.backlog.lock().await;
        let backlog_len = backlog.len();
        let mut agents = self.registry.agents().write().await;

        match self.try_place(&mut agents, &task, true, backlog_len) {
            Placement::Assigned { agent_id, wait_ms } => {
                drop(agents);
                drop(backlog);
                self.assignments.lock().await.insert(task.id, agent_id);
                info!(
                    task_id = %task.id,
                    agent_id = %agent_id,
                    urgent = task.is_urgent,
                    "Delegation: task assigned"
                );
                DelegationResult::assigned(task.id, agent_id, wait_ms)
            }
            Placement::AtCapacity { wait_ms } => {
                let task_id = task.id;
                backlog.push_back(task);
                info!(task_id = %task_id, backlog_depth = backlog.len(), "Delegation: all candidates at capacity, task queued");
                DelegationResult::queued(task_id, wait_ms, "all capable agents at capacity")
            }
            Placement::NoCandidate => {
                let task_id = task.id;
                backlog.push_back(task);
                warn!(task_id = %task_id, backlog_depth = backlog.len(), "Delegation: no suitable agent, task queued");
                DelegationResult::queued(task_id, self.config.fallback_wait_ms, "no suitable agent")
            }
        }
    }

    /// Record post-execution feedback for an assigned task.
    ///
    /// Frees one slot of the agent's load and folds the outcome into its
    /// moving averages, then sweeps the backlog so the freed capacity is
    /// reused. Returns `false` when no record of the delegation exists or
    /// the agent is gone; that is a caller error, not a retryable failure.
    pub async fn record_feedback(&self, feedback: DelegationFeedback) -> bool {
        {
            let mut assignments = self.assignments.lock().await;
            match assignments.get(&feedback.task_id) {
                Some(agent_id) if *agent_id == feedback.agent_id => {
                    assignments.remove(&feedback.task_id);
                }
                _ => {
                    warn!(
                        task_id = %feedback.task_id,
                        agent_id = %feedback.agent_id,
                        "Feedback: no matching delegation record"
                    );
                    return false;
                }
            }
        }

        {
            let mut agents = self.registry.agents().write().await;
            let Some(agent) = agents.get_mut(&feedback.agent_id) else {
                warn!(agent_id = %feedback.agent_id, "Feedback: agent no longer registered");
                return false;
            };

            agent.current_load = (agent.current_load - agent.slot_load()).max(0.0);

            let alpha = self.config.ema_alpha;
            let success_sample = if feedback.was_successful { 1.0 } else { 0.0 };
            agent.success_rate = alpha * success_sample + (1.0 - alpha) * agent.success_rate;
            agent.avg_response_time_ms = alpha * feedback.execution_time_ms as f64
                + (1.0 - alpha) * agent.avg_response_time_ms;

            info!(
                task_id = %feedback.task_id,
                agent_id = %feedback.agent_id,
                success = feedback.was_successful,
                success_rate = agent.success_rate,
                "Feedback: agent metrics updated"
            );
        }

        self.process_backlog().await;
        true
    }

    /// Retry placement for every queued task, in backlog priority order
    /// `(is_urgent desc, priority desc, created_at asc)`.
    ///
    /// Runs without the urgent-overflow allowance; tasks that still cannot
    /// be placed stay queued. Returns the number of tasks placed.
    pub async fn process_backlog(&self) -> usize {
        let mut backlog = self.backlog.lock().await;
        if backlog.is_empty() {
            return 0;
        }

        let mut pending: Vec<Task> = backlog.drain(..).collect();
        pending.sort_by(|a, b| {
            b.is_urgent
                .cmp(&a.is_urgent)
                .then(b.priority.cmp(&a.priority))
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut placed = Vec::new();
        let mut agents = self.registry.agents().write().await;
        for task in pending {
            let backlog_len = backlog.len();
            match self.try_place(&mut agents, &task, false, backlog_len) {
                Placement::Assigned { agent_id, .. } => {
                    debug!(task_id = %task.id, agent_id = %agent_id, "Backlog: queued task placed");
                    placed.push((task.id, agent_id));
                }
                _ => backlog.push_back(task),
            }
        }
        drop(agents);
        drop(backlog);

        let count = placed.len();
        if count > 0 {
            let mut assignments = self.assignments.lock().await;
            for (task_id, agent_id) in placed {
                assignments.insert(task_id, agent_id);
            }
            info!(placed = count, "Backlog: sweep complete");
        }
        count
    }

    /// Snapshot of engine state for dashboards and diagnostics.
    pub async fn stats(&self) -> DelegationStats {
        let backlog_depth = self.backlog.lock().await.len();
        let active_assignments = self.assignments.lock().await.len();
        let agents = self.registry.snapshot().await;
        DelegationStats {
            backlog_depth,
            active_assignments,
            agent_count: agents.len(),
            total_load: agents.iter().map(|a| a.current_load).sum(),
        }
    }

    /// Number of tasks currently waiting in the backlog.
    pub async fn backlog_depth(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Whether a task is currently waiting in the backlog.
    pub async fn is_queued(&self, task_id: Uuid) -> bool {
        self.backlog.lock().await.iter().any(|t| t.id == task_id)
    }

    /// One placement attempt under the caller's registry write guard, so
    /// score and load update cannot interleave with another delegation.
    fn try_place(
        &self,
        agents: &mut HashMap<Uuid, AgentRecord>,
        task: &Task,
        allow_urgent_overflow: bool,
        backlog_len: usize,
    ) -> Placement {
        let best = agents
            .values()
            .filter(|a| a.is_available && a.can_handle(&task.required_capabilities))
            .map(|a| (a.id, self.score(a), a.current_load))
            .max_by(|(_, score_a, load_a), (_, score_b, load_b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // prefer the lower-loaded agent on score ties
                    .then_with(|| {
                        load_b
                            .partial_cmp(load_a)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            });

        let Some((agent_id, score, _)) = best else {
            return Placement::NoCandidate;
        };

        #[allow(clippy::unwrap_used)] // id came from the map under this guard
        let agent = agents.get_mut(&agent_id).unwrap();

        if agent.at_capacity() {
            let overflow_allowed = allow_urgent_overflow
                && task.is_urgent
                && agent.current_load < self.config.urgent_load_ceiling;
            if !overflow_allowed {
                let wait_ms =
                    (agent.avg_response_time_ms * (backlog_len as f64 + 1.0)).round() as u64;
                return Placement::AtCapacity { wait_ms };
            }
        }

        agent.current_load = (agent.current_load + agent.slot_load()).min(1.0);
        debug!(agent_id = %agent_id, score, load = agent.current_load, "Delegation: candidate chosen");
        Placement::Assigned {
            agent_id,
            wait_ms: agent.avg_response_time_ms.round() as u64,
        }
    }

    /// Weighted score of one candidate: free capacity, success rate, and
    /// normalized response time.
    fn score(&self, agent: &AgentRecord) -> f64 {
        let load_factor = 1.0 - agent.current_load / f64::from(agent.max_capacity);
        let success_factor = agent.success_rate;
        let response_factor = 1.0
            - agent
                .avg_response_time_ms
                .min(self.config.response_time_cap_ms)
                / self.config.response_time_cap_ms;
        self.config.load_weight * load_factor
            + self.config.success_weight * success_factor
            + self.config.response_weight * response_factor
    }
}

/// Point-in-time view of engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationStats {
    pub backlog_depth: usize,
    pub active_assignments: usize,
    pub agent_count: usize,
    /// Sum of normalized load across all agents.
    pub total_load: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(agents: Vec<AgentRecord>) -> (Arc<AgentRegistry>, DelegationEngine) {
        let registry = Arc::new(AgentRegistry::new());
        for agent in agents {
            registry.register(agent).await;
        }
        let engine = DelegationEngine::new(registry.clone());
        (registry, engine)
    }

    #[tokio::test]
    async fn test_delegate_picks_least_loaded_of_equals() {
        let light = AgentRecord::new("light", 10).with_capabilities(["research"]).with_load(0.2);
        let light_id = light.id;
        let heavy = AgentRecord::new("heavy", 10).with_capabilities(["research"]).with_load(0.6);
        let (_registry, engine) = setup(vec![light, heavy]).await;

        let task = Task::new("find prior art", "user-1").with_capabilities(["research"]);
        let result = engine.delegate(task).await;

        assert!(result.success);
        assert_eq!(result.agent_id, Some(light_id));
    }

    #[tokio::test]
    async fn test_delegate_increments_load() {
        let agent = AgentRecord::new("worker", 4).with_capabilities(["code"]);
        let agent_id = agent.id;
        let (registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("implement", "u").with_capabilities(["code"]))
            .await;
        assert!(result.success);
        let record = registry.get(agent_id).await.unwrap();
        assert!((record.current_load - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_capable_agent_queues_once() {
        let agent = AgentRecord::new("coder", 2).with_capabilities(["code"]);
        let (_registry, engine) = setup(vec![agent]).await;

        let task = Task::new("translate", "u").with_capabilities(["translation"]);
        let task_id = task.id;
        let result = engine.delegate(task).await;

        assert!(!result.success);
        assert_eq!(result.reason, "no suitable agent");
        assert!(engine.is_queued(task_id).await);
        assert_eq!(engine.backlog_depth().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_agent_ignored() {
        let mut agent = AgentRecord::new("away", 2).with_capabilities(["research"]);
        agent.is_available = false;
        let (_registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("q", "u").with_capabilities(["research"]))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_full_agent_queues_non_urgent() {
        let agent = AgentRecord::new("full", 2).with_capabilities(["code"]).with_load(1.0);
        let (_registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("build", "u").with_capabilities(["code"]))
            .await;
        assert!(!result.success);
        assert_eq!(result.reason, "all capable agents at capacity");
        assert_eq!(engine.backlog_depth().await, 1);
    }

    #[tokio::test]
    async fn test_urgent_overflow_onto_fractionally_loaded_agent() {
        // Seeded at 0.6 on a two-slot agent: the next half-capacity slot
        // would overflow, so non-urgent work queues. An urgent task may
        // still take the slot while the load sits below the 0.9 ceiling.
        let agent = AgentRecord::new("busy", 2).with_capabilities(["code"]).with_load(0.6);
        let agent_id = agent.id;
        let (registry, engine) = setup(vec![agent]).await;

        let plain = engine
            .delegate(Task::new("routine", "u").with_capabilities(["code"]))
            .await;
        assert!(!plain.success);
        assert_eq!(plain.reason, "all capable agents at capacity");

        let urgent = engine
            .delegate(Task::new("incident", "u").with_capabilities(["code"]).urgent())
            .await;
        assert!(urgent.success);
        assert_eq!(urgent.agent_id, Some(agent_id));
        // Overflow assignment caps the load at 1.0.
        let record = registry.get(agent_id).await.unwrap();
        assert!((record.current_load - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_urgent_overflow_blocked_at_load_ceiling() {
        let agent = AgentRecord::new("maxed", 2).with_capabilities(["code"]).with_load(0.95);
        let (_registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("incident", "u").with_capabilities(["code"]).urgent())
            .await;
        assert!(!result.success);
        assert_eq!(result.reason, "all capable agents at capacity");
    }

    #[tokio::test]
    async fn test_urgent_task_at_full_load_still_queued() {
        // A fully loaded agent sits above the overflow ceiling no matter
        // its slot count, so even urgent work waits for feedback.
        let agent = AgentRecord::new("saturated", 10).with_capabilities(["code"]).with_load(1.0);
        let (_registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("incident", "u").with_capabilities(["code"]).urgent())
            .await;
        assert!(!result.success);
        assert_eq!(result.reason, "all capable agents at capacity");
        assert_eq!(engine.backlog_depth().await, 1);
    }

    #[tokio::test]
    async fn test_feedback_frees_capacity_and_updates_ema() {
        let agent = AgentRecord::new("worker", 2).with_capabilities(["code"]);
        let agent_id = agent.id;
        let (registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("build", "u").with_capabilities(["code"]))
            .await;
        let task_id = result.task_id;

        let ok = engine
            .record_feedback(DelegationFeedback {
                task_id,
                agent_id,
                was_successful: false,
                execution_time_ms: 10_000,
                user_satisfaction: None,
            })
            .await;
        assert!(ok);

        let record = registry.get(agent_id).await.unwrap();
        assert_eq!(record.current_load, 0.0);
        // alpha = 0.1 pulls the averages toward the new samples
        assert!((record.success_rate - 0.9).abs() < 1e-9);
        assert!((record.avg_response_time_ms - 1_900.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_feedback_unknown_task_is_precondition_failure() {
        let agent = AgentRecord::new("worker", 2);
        let agent_id = agent.id;
        let (_registry, engine) = setup(vec![agent]).await;

        let ok = engine
            .record_feedback(DelegationFeedback {
                task_id: Uuid::new_v4(),
                agent_id,
                was_successful: true,
                execution_time_ms: 100,
                user_satisfaction: Some(1.0),
            })
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_feedback_consumed_exactly_once() {
        let agent = AgentRecord::new("worker", 2).with_capabilities(["code"]);
        let agent_id = agent.id;
        let (_registry, engine) = setup(vec![agent]).await;

        let result = engine
            .delegate(Task::new("build", "u").with_capabilities(["code"]))
            .await;
        let feedback = DelegationFeedback {
            task_id: result.task_id,
            agent_id,
            was_successful: true,
            execution_time_ms: 500,
            user_satisfaction: None,
        };
        assert!(engine.record_feedback(feedback.clone()).await);
        assert!(!engine.record_feedback(feedback).await);
    }

    #[tokio::test]
    async fn test_backlog_drained_after_feedback() {
        let agent = AgentRecord::new("solo", 1).with_capabilities(["code"]);
        let agent_id = agent.id;
        let (registry, engine) = setup(vec![agent]).await;

        let first = engine
            .delegate(Task::new("first", "u").with_capabilities(["code"]))
            .await;
        assert!(first.success);

        let second = engine
            .delegate(Task::new("second", "u").with_capabilities(["code"]))
            .await;
        assert!(!second.success);
        assert_eq!(engine.backlog_depth().await, 1);

        engine
            .record_feedback(DelegationFeedback {
                task_id: first.task_id,
                agent_id,
                was_successful: true,
                execution_time_ms: 200,
                user_satisfaction: None,
            })
            .await;

        // Feedback freed the only slot, so the backlog sweep placed the
        // queued task.
        assert_eq!(engine.backlog_depth().await, 0);
        let record = registry.get(agent_id).await.unwrap();
        assert!(record.current_load > 0.0);
    }

    #[tokio::test]
    async fn test_backlog_order_urgent_then_priority() {
        let (_registry, engine) = setup(vec![]).await;

        let low = Task::new("low", "u").with_capabilities(["code"]).with_priority(1);
        let high = Task::new("high", "u").with_capabilities(["code"]).with_priority(9);
        let urgent = Task::new("urgent", "u").with_capabilities(["code"]).urgent();
        let urgent_id = urgent.id;
        let high_id = high.id;

        engine.delegate(low).await;
        engine.delegate(high).await;
        engine.delegate(urgent).await;
        assert_eq!(engine.backlog_depth().await, 3);

        // One single-slot agent appears; the urgent task must win the sweep.
        let agent = AgentRecord::new("late", 1).with_capabilities(["code"]);
        engine.registry().register(agent).await;
        assert_eq!(engine.process_backlog().await, 1);
        assert!(!engine.is_queued(urgent_id).await);
        assert!(engine.is_queued(high_id).await);
    }

    #[tokio::test]
    async fn test_score_prefers_better_stats() {
        let mut fast = AgentRecord::new("fast", 10).with_capabilities(["research"]);
        fast.avg_response_time_ms = 500.0;
        fast.success_rate = 0.95;
        let fast_id = fast.id;

        let mut slow = AgentRecord::new("slow", 10).with_capabilities(["research"]);
        slow.avg_response_time_ms = 45_000.0; // clamped at the 30s cap
        slow.success_rate = 0.6;

        let (_registry, engine) = setup(vec![fast, slow]).await;
        let result = engine
            .delegate(Task::new("q", "u").with_capabilities(["research"]))
            .await;
        assert_eq!(result.agent_id, Some(fast_id));
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let agent = AgentRecord::new("worker", 2).with_capabilities(["code"]);
        let (_registry, engine) = setup(vec![agent]).await;
        engine
            .delegate(Task::new("build", "u").with_capabilities(["code"]))
            .await;
        engine.delegate(Task::new("x", "u").with_capabilities(["nope"])).await;

        let stats = engine.stats().await;
        assert_eq!(stats.agent_count, 1);
        assert_eq!(stats.active_assignments, 1);
        assert_eq!(stats.backlog_depth, 1);
        assert!(stats.total_load > 0.0);
    }
}
