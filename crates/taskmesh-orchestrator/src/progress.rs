use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle status of a tracked unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProgressStatus {
    fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

/// Status of one milestone within a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A caller-ordered checkpoint toward task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: Uuid,
    pub description: String,
    pub status: MilestoneStatus,
    /// Caller-supplied ordering, used for display and progress derivation.
    pub order: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of entry in the per-task event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    StatusChange,
    Milestone,
    ProgressUpdate,
    Note,
    Error,
}

/// One append-only log entry for a tracked task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub event_type: ProgressEventType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Point-in-time progress snapshot returned by [`ProgressTracker::get_progress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub task_id: Uuid,
    pub status: ProgressStatus,
    /// Overall completion in `[0, 1]`.
    pub progress: f64,
    pub milestones: Vec<Milestone>,
    /// Most recent events, newest first.
    pub recent_events: Vec<ProgressEvent>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Estimated remaining time, only while in progress with `0 < progress < 1`.
    pub eta_ms: Option<u64>,
}

/// Tunable bounds of the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Events kept per task; the oldest are trimmed beyond this.
    #[serde(default = "default_event_retention")]
    pub event_retention: usize,
    /// Events returned by a progress snapshot.
    #[serde(default = "default_recent_events")]
    pub recent_events: usize,
}

fn default_event_retention() -> usize {
    100
}

fn default_recent_events() -> usize {
    20
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            event_retention: default_event_retention(),
            recent_events: default_recent_events(),
        }
    }
}

/// Internal per-task record.
struct TrackedTask {
    status: ProgressStatus,
    progress: f64,
    milestones: Vec<Milestone>,
    events: VecDeque<ProgressEvent>,
    registered_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Records lifecycle events, milestones, and completion percentage for any
/// tracked unit of work.
///
/// Overall progress is either set explicitly or, once milestones exist,
/// recomputed on every milestone completion as `completed / total`. The
/// per-task event log is bounded to keep memory flat.
pub struct ProgressTracker {
    tasks: Arc<RwLock<HashMap<Uuid, TrackedTask>>>,
    config: ProgressConfig,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_config(ProgressConfig::default())
    }

    pub fn with_config(config: ProgressConfig) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Begin tracking a unit of work. Re-registering an id resets it.
    pub async fn register_task(&self, task_id: Uuid) {
        let mut tasks = self.tasks.write().await;
        let now = Utc::now();
        let mut task = TrackedTask {
            status: ProgressStatus::Pending,
            progress: 0.0,
            milestones: Vec::new(),
            events: VecDeque::new(),
            registered_at: now,
            started_at: None,
            completed_at: None,
        };
        push_event(
            &mut task,
            task_id,
            ProgressEventType::StatusChange,
            "task registered",
            None,
            self.config.event_retention,
        );
        tasks.insert(task_id, task);
        debug!(task_id = %task_id, "Progress: task registered");
    }

    /// Transition a task's lifecycle status.
    ///
    /// Entering `in_progress` stamps `started_at` once; terminal statuses
    /// stamp `completed_at` once and are idempotent thereafter.
    pub async fn update_status(&self, task_id: Uuid, status: ProgressStatus) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            // Terminal timestamps never get overwritten by later calls.
            return task.status == status;
        }

        let now = Utc::now();
        if status == ProgressStatus::InProgress && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
            if status == ProgressStatus::Completed {
                task.progress = 1.0;
            }
        }
        task.status = status;
        push_event(
            task,
            task_id,
            ProgressEventType::StatusChange,
            format!("status -> {status:?}").to_lowercase(),
            None,
            self.config.event_retention,
        );
        info!(task_id = %task_id, status = ?status, "Progress: status changed");
        true
    }

    /// Explicitly set overall progress, with an optional note.
    pub async fn update_progress(&self, task_id: Uuid, value: f64, note: Option<&str>) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        task.progress = value.clamp(0.0, 1.0);
        push_event(
            task,
            task_id,
            ProgressEventType::ProgressUpdate,
            format!("progress {:.0}%", task.progress * 100.0),
            None,
            self.config.event_retention,
        );
        if let Some(note) = note {
            push_event(
                task,
                task_id,
                ProgressEventType::Note,
                note,
                None,
                self.config.event_retention,
            );
        }
        true
    }

    /// Add a milestone and return its id, or `None` for an unknown task.
    pub async fn add_milestone(
        &self,
        task_id: Uuid,
        description: impl Into<String>,
        order: u32,
    ) -> Option<Uuid> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id)?;
        let now = Utc::now();
        let milestone = Milestone {
            id: Uuid::new_v4(),
            description: description.into(),
            status: MilestoneStatus::Pending,
            order,
            created_at: now,
            updated_at: now,
        };
        let id = milestone.id;
        let description = milestone.description.clone();
        task.milestones.push(milestone);
        task.milestones.sort_by_key(|m| m.order);
        push_event(
            task,
            task_id,
            ProgressEventType::Milestone,
            format!("milestone added: {description}"),
            None,
            self.config.event_retention,
        );
        Some(id)
    }

    /// Update one milestone's status; completion recomputes overall progress
    /// as `completed / total`.
    pub async fn update_milestone_status(
        &self,
        task_id: Uuid,
        milestone_id: Uuid,
        status: MilestoneStatus,
    ) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        let Some(milestone) = task.milestones.iter_mut().find(|m| m.id == milestone_id) else {
            return false;
        };
        milestone.status = status;
        milestone.updated_at = Utc::now();
        let description = milestone.description.clone();

        if status == MilestoneStatus::Completed {
            let completed = task
                .milestones
                .iter()
                .filter(|m| m.status == MilestoneStatus::Completed)
                .count();
            task.progress = completed as f64 / task.milestones.len() as f64;
        }
        push_event(
            task,
            task_id,
            ProgressEventType::Milestone,
            format!("milestone {status:?}: {description}").to_lowercase(),
            None,
            self.config.event_retention,
        );
        true
    }

    /// Record an error event against a task without changing its status.
    pub async fn record_error(&self, task_id: Uuid, description: impl Into<String>) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        push_event(
            task,
            task_id,
            ProgressEventType::Error,
            description,
            None,
            self.config.event_retention,
        );
        true
    }

    /// Point-in-time snapshot, or `None` for an unregistered task.
    pub async fn get_progress(&self, task_id: Uuid) -> Option<ProgressInfo> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(&task_id)?;

        let eta_ms = match (task.status, task.started_at) {
            (ProgressStatus::InProgress, Some(started))
                if task.progress > 0.0 && task.progress < 1.0 =>
            {
                let elapsed = (Utc::now() - started).num_milliseconds().max(0) as f64;
                Some((elapsed / task.progress - elapsed).round() as u64)
            }
            _ => None,
        };

        let recent_events = task
            .events
            .iter()
            .rev()
            .take(self.config.recent_events)
            .cloned()
            .collect();

        Some(ProgressInfo {
            task_id,
            status: task.status,
            progress: task.progress,
            milestones: task.milestones.clone(),
            recent_events,
            registered_at: task.registered_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            eta_ms,
        })
    }

    /// Number of tracked tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_event(
    task: &mut TrackedTask,
    task_id: Uuid,
    event_type: ProgressEventType,
    description: impl Into<String>,
    data: Option<serde_json::Value>,
    retention: usize,
) {
    task.events.push_back(ProgressEvent {
        id: Uuid::new_v4(),
        task_id,
        event_type,
        description: description.into(),
        timestamp: Utc::now(),
        data,
    });
    while task.events.len() > retention {
        task.events.pop_front();
    }
}
