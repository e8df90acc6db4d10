use std::collections::HashMap;
use std::sync::Arc;
use taskmesh_core::{AgentRecord, DurableStore, MeshError, MeshResult};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared registry of live worker agents.
///
/// Owns every [`AgentRecord`]; the delegation engine mutates load and
/// performance fields through the registry's lock so concurrent delegations
/// and feedback callbacks never lose updates.
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<Uuid, AgentRecord>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Load persisted agent records from the durable store.
    ///
    /// Returns the number of records loaded. A store failure leaves the
    /// registry empty rather than failing startup.
    pub async fn bootstrap(&self, store: &dyn DurableStore) -> usize {
        match store.load_agents().await {
            Ok(records) => {
                let count = records.len();
                let mut agents = self.agents.write().await;
                for record in records {
                    agents.insert(record.id, record);
                }
                info!(agent_count = count, "Registry: bootstrapped from store");
                count
            }
            Err(e) => {
                warn!(error = %e, "Registry: bootstrap failed, starting empty");
                0
            }
        }
    }

    /// Register an agent and return its id.
    pub async fn register(&self, agent: AgentRecord) -> Uuid {
        let id = agent.id;
        info!(agent_id = %id, name = %agent.name, "Registry: agent registered");
        self.agents.write().await.insert(id, agent);
        id
    }

    /// Remove an agent from the registry.
    ///
    /// Refuses while the agent still carries load: in-flight tasks must be
    /// drained (feedback recorded) before removal.
    pub async fn deregister(&self, id: Uuid) -> MeshResult<AgentRecord> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get(&id)
            .ok_or_else(|| MeshError::Precondition(format!("unknown agent {id}")))?;
        if agent.current_load > 0.0 {
            return Err(MeshError::Precondition(format!(
                "agent {id} still has load {:.2}; drain active tasks first",
                agent.current_load
            )));
        }
        #[allow(clippy::unwrap_used)] // presence checked above under the same guard
        Ok(agents.remove(&id).unwrap())
    }

    /// Mark an agent available or unavailable for new assignments.
    pub async fn set_available(&self, id: Uuid, available: bool) -> bool {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(&id) {
            agent.is_available = available;
            true
        } else {
            false
        }
    }

    /// Get a copy of one agent's record.
    pub async fn get(&self, id: Uuid) -> Option<AgentRecord> {
        self.agents.read().await.get(&id).cloned()
    }

    /// Snapshot of all records, for dashboards and diagnostics.
    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether the registry holds no agents.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// The underlying lock, for callers that must score and mutate records
    /// atomically.
    pub fn agents(&self) -> &Arc<RwLock<HashMap<Uuid, AgentRecord>>> {
        &self.agents
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::MemoryStore;

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = AgentRegistry::new();
        let agent = AgentRecord::new("researcher", 4).with_capabilities(["research"]);
        let id = registry.register(agent).await;

        let fetched = registry.get(id).await.unwrap();
        assert_eq!(fetched.name, "researcher");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_from_store() {
        let store = MemoryStore::with_agents(vec![
            AgentRecord::new("a", 2),
            AgentRecord::new("b", 3),
        ]);
        let registry = AgentRegistry::new();
        let loaded = registry.bootstrap(&store).await;
        assert_eq!(loaded, 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_deregister_idle_agent() {
        let registry = AgentRegistry::new();
        let id = registry.register(AgentRecord::new("idle", 2)).await;
        let removed = registry.deregister(id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_deregister_loaded_agent_refused() {
        let registry = AgentRegistry::new();
        let id = registry
            .register(AgentRecord::new("busy", 2).with_load(0.5))
            .await;
        let err = registry.deregister(id).await.unwrap_err();
        assert!(matches!(err, MeshError::Precondition(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_deregister_unknown_agent() {
        let registry = AgentRegistry::new();
        assert!(registry.deregister(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_set_available() {
        let registry = AgentRegistry::new();
        let id = registry.register(AgentRecord::new("a", 1)).await;
        assert!(registry.set_available(id, false).await);
        assert!(!registry.get(id).await.unwrap().is_available);
        assert!(!registry.set_available(Uuid::new_v4(), false).await);
    }
}
