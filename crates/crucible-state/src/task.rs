use chrono::{DateTime, Utc};
use crucible_core::{AgentRole, TaskId, WorkflowStage};
use serde::{Deserialize, Serialize};

/// A task's lifecycle position. `Blocked` is reserved for a task whose
/// dependencies are not yet satisfied; no component in this crate
/// transitions a task into it automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Blocked,
}

/// Immutable identity plus mutable status/timestamps for one unit of work
/// assigned to an agent during a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity, assigned at creation.
    pub id: TaskId,
    /// Human-readable description of the work.
    pub description: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// The stage this task belongs to.
    pub stage: WorkflowStage,
    /// The agent role responsible for completing it.
    pub owning_role: AgentRole,
    /// Artifact keys this task has produced so far.
    pub artifact_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff `status == Completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a new `Pending` task owned by `owning_role` for `stage`.
    pub fn new(description: impl Into<String>, stage: WorkflowStage, owning_role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: crucible_core::new_id(),
            description: description.into(),
            status: TaskStatus::Pending,
            stage,
            owning_role,
            artifact_keys: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Sets `status`, refreshing `updated_at` and maintaining the
    /// `completed_at` invariant (set iff status becomes `Completed`, cleared
    /// otherwise).
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        self.completed_at = if status == TaskStatus::Completed {
            Some(self.updated_at)
        } else {
            None
        };
    }

    /// Appends an artifact key produced by this task, if not already present.
    pub fn add_artifact_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.artifact_keys.contains(&key) {
            self.artifact_keys.push(key);
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_at_is_set_iff_completed() {
        let mut task = Task::new("write tests", WorkflowStage::Testing, AgentRole::TestEngineer);
        assert!(task.completed_at.is_none());
        task.set_status(TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        task.set_status(TaskStatus::InProgress);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn add_artifact_key_is_idempotent() {
        let mut task = Task::new("write code", WorkflowStage::Implementation, AgentRole::Developer);
        task.add_artifact_key("source_code");
        task.add_artifact_key("source_code");
        assert_eq!(task.artifact_keys, vec!["source_code".to_string()]);
    }
}
