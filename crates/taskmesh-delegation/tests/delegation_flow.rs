//! End-to-end delegation flow tests.
//!
//! Exercises the full assign → feedback → backlog-sweep cycle against a
//! registry bootstrapped from the in-memory store, including the
//! load-based selection guarantee and feedback metric movement.

use std::sync::Arc;
use taskmesh_core::{AgentRecord, DurableStore, MemoryStore};
use taskmesh_delegation::{AgentRegistry, DelegationEngine, DelegationFeedback, Task};

async fn bootstrap_engine(agents: Vec<AgentRecord>) -> (Arc<AgentRegistry>, DelegationEngine) {
    let store = MemoryStore::with_agents(agents);
    let registry = Arc::new(AgentRegistry::new());
    registry.bootstrap(&store).await;
    let engine = DelegationEngine::new(registry.clone());
    (registry, engine)
}

#[tokio::test]
async fn least_loaded_research_agent_wins() {
    // Two agents with identical stats except load 0.2 vs 0.6: the lighter
    // one must be selected.
    let light = AgentRecord::new("scholar", 10)
        .with_capabilities(["research"])
        .with_load(0.2);
    let light_id = light.id;
    let heavy = AgentRecord::new("archivist", 10)
        .with_capabilities(["research"])
        .with_load(0.6);

    let (_registry, engine) = bootstrap_engine(vec![light, heavy]).await;

    let task = Task::new("survey async runtimes", "user-7").with_capabilities(["research"]);
    let result = engine.delegate(task).await;

    assert!(result.success, "expected assignment, got: {}", result.reason);
    assert_eq!(result.agent_id, Some(light_id));
}

#[tokio::test]
async fn unplaceable_task_lands_in_backlog_exactly_once() {
    let coder = AgentRecord::new("coder", 4).with_capabilities(["code"]);
    let (_registry, engine) = bootstrap_engine(vec![coder]).await;

    let task = Task::new("legal review", "user-1").with_capabilities(["legal"]);
    let task_id = task.id;

    let result = engine.delegate(task).await;
    assert!(!result.success);
    assert_eq!(result.task_id, task_id);
    assert_eq!(engine.backlog_depth().await, 1);
    assert!(engine.is_queued(task_id).await);

    // A sweep with no capable agent must not duplicate or drop the entry.
    engine.process_backlog().await;
    assert_eq!(engine.backlog_depth().await, 1);
}

#[tokio::test]
async fn feedback_moves_success_rate_toward_outcome() {
    let agent = AgentRecord::new("worker", 2).with_capabilities(["code"]);
    let agent_id = agent.id;
    let (registry, engine) = bootstrap_engine(vec![agent]).await;

    let mut last_rate = registry.get(agent_id).await.unwrap().success_rate;
    for _ in 0..3 {
        let result = engine
            .delegate(Task::new("build", "u").with_capabilities(["code"]))
            .await;
        assert!(result.success);
        assert!(engine
            .record_feedback(DelegationFeedback {
                task_id: result.task_id,
                agent_id,
                was_successful: false,
                execution_time_ms: 2_000,
                user_satisfaction: None,
            })
            .await);

        let rate = registry.get(agent_id).await.unwrap().success_rate;
        assert!(rate < last_rate, "success rate must move toward 0.0");
        last_rate = rate;
    }

    // Load returns to zero after every slot is released.
    assert_eq!(registry.get(agent_id).await.unwrap().current_load, 0.0);
}

#[tokio::test]
async fn freed_capacity_is_reused_for_queued_work() {
    let solo = AgentRecord::new("solo", 1).with_capabilities(["research"]);
    let solo_id = solo.id;
    let (_registry, engine) = bootstrap_engine(vec![solo]).await;

    let first = engine
        .delegate(Task::new("first", "u").with_capabilities(["research"]))
        .await;
    assert!(first.success);

    let queued = engine
        .delegate(Task::new("second", "u").with_capabilities(["research"]))
        .await;
    assert!(!queued.success);

    engine
        .record_feedback(DelegationFeedback {
            task_id: first.task_id,
            agent_id: solo_id,
            was_successful: true,
            execution_time_ms: 300,
            user_satisfaction: Some(0.9),
        })
        .await;

    // record_feedback sweeps the backlog itself.
    assert_eq!(engine.backlog_depth().await, 0);
}

#[tokio::test]
async fn concurrent_delegations_never_lose_load_updates() {
    let agent = AgentRecord::new("popular", 8).with_capabilities(["research"]);
    let agent_id = agent.id;
    let (registry, engine) = bootstrap_engine(vec![agent]).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .delegate(Task::new(format!("task {i}"), "u").with_capabilities(["research"]))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    // Eight 1/8 slots taken under contention must sum to a full agent.
    let record = registry.get(agent_id).await.unwrap();
    assert!((record.current_load - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn bootstrap_failure_starts_empty() {
    struct FailingStore;

    #[async_trait::async_trait]
    impl DurableStore for FailingStore {
        async fn load_agents(&self) -> taskmesh_core::MeshResult<Vec<AgentRecord>> {
            Err(taskmesh_core::MeshError::Store("backend offline".into()))
        }

        async fn persist(
            &self,
            _kind: &str,
            _record: &serde_json::Value,
        ) -> taskmesh_core::MeshResult<()> {
            Err(taskmesh_core::MeshError::Store("backend offline".into()))
        }
    }

    let registry = AgentRegistry::new();
    assert_eq!(registry.bootstrap(&FailingStore).await, 0);
    assert!(registry.is_empty().await);
}
