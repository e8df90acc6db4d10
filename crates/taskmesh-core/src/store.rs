use crate::agent::AgentRecord;
use crate::error::MeshResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Injected persistence collaborator.
///
/// Used to bootstrap the agent registry and to optionally persist tasks,
/// feedback, and progress records. The core works correctly in memory even
/// when persistence fails: callers log and swallow persist errors, they are
/// never propagated as run failures.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Load the persisted agent records for registry bootstrap.
    async fn load_agents(&self) -> MeshResult<Vec<AgentRecord>>;

    /// Persist one record under a caller-chosen kind (e.g. "task",
    /// "feedback", "progress").
    async fn persist(&self, kind: &str, record: &serde_json::Value) -> MeshResult<()>;
}

/// In-memory store used as the default when no durable backend is wired in.
///
/// Keeps every persisted record per kind so tests can observe writes.
#[derive(Default)]
pub struct MemoryStore {
    agents: Vec<AgentRecord>,
    records: RwLock<HashMap<String, Vec<serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with agent records returned by `load_agents`.
    pub fn with_agents(agents: Vec<AgentRecord>) -> Self {
        Self {
            agents,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Records persisted under a kind, in write order.
    pub async fn records(&self, kind: &str) -> Vec<serde_json::Value> {
        self.records
            .read()
            .await
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_agents(&self) -> MeshResult<Vec<AgentRecord>> {
        Ok(self.agents.clone())
    }

    async fn persist(&self, kind: &str, record: &serde_json::Value) -> MeshResult<()> {
        let mut records = self.records.write().await;
        records.entry(kind.to_string()).or_default().push(record.clone());
        Ok(())
    }
}
