use std::collections::HashMap;

use chrono::{DateTime, Utc};
use crucible_core::{AgentRole, CrucibleError, CrucibleResult, TaskId, WorkflowId, WorkflowStage};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::decision::{ArtifactValue, ClientFeedback, Decision};
use crate::task::{Task, TaskStatus};

/// The five free-form string-keyed buckets on [`ProjectState`]. Each names
/// an independently-locked region; `Metadata` is the catch-all extension
/// point for agent-specific data that doesn't fit the other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    Requirements,
    Architecture,
    Design,
    ImplementationPlan,
    Metadata,
}

type BucketMap = HashMap<String, serde_json::Value>;

/// A deep, serializable copy of [`ProjectState`], suitable for checkpointing
/// and for the `restore(snapshot(state)) == state` round-trip law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStateSnapshot {
    pub id: WorkflowId,
    pub name: String,
    pub requirement_text: String,
    pub current_stage: WorkflowStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub requirements: BucketMap,
    pub architecture: BucketMap,
    pub design: BucketMap,
    pub implementation_plan: BucketMap,
    pub metadata: BucketMap,
    pub tasks: HashMap<TaskId, Task>,
    pub artifacts: HashMap<String, ArtifactValue>,
    pub decisions: Vec<Decision>,
    pub client_feedback: Vec<ClientFeedback>,
}

/// The single authoritative in-memory representation of one workflow's
/// data.
///
/// Every section (`requirements`, `architecture`, `design`,
/// `implementation_plan`, `metadata`, `tasks`, `artifacts`, `decisions`,
/// `client_feedback`) is an independently locked `tokio::sync::RwLock`
/// region: writers to different regions never block each other, writers to
/// the same region serialize. `snapshot`/`restore` acquire and release one
/// region at a time rather than holding several locks simultaneously, so no
/// fixed lock-acquisition order is needed to avoid deadlock.
pub struct ProjectState {
    id: WorkflowId,
    name: String,
    requirement_text: String,
    created_at: DateTime<Utc>,
    current_stage: RwLock<WorkflowStage>,
    updated_at: RwLock<DateTime<Utc>>,
    requirements: RwLock<BucketMap>,
    architecture: RwLock<BucketMap>,
    design: RwLock<BucketMap>,
    implementation_plan: RwLock<BucketMap>,
    metadata: RwLock<BucketMap>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    artifacts: RwLock<HashMap<String, ArtifactValue>>,
    decisions: RwLock<Vec<Decision>>,
    client_feedback: RwLock<Vec<ClientFeedback>>,
}

impl ProjectState {
    /// Creates a fresh `ProjectState` at `WorkflowStage::Initial`.
    pub fn new(id: WorkflowId, name: impl Into<String>, requirement_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            requirement_text: requirement_text.into(),
            created_at: now,
            current_stage: RwLock::new(WorkflowStage::Initial),
            updated_at: RwLock::new(now),
            requirements: RwLock::new(HashMap::new()),
            architecture: RwLock::new(HashMap::new()),
            design: RwLock::new(HashMap::new()),
            implementation_plan: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
            decisions: RwLock::new(Vec::new()),
            client_feedback: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requirement_text(&self) -> &str {
        &self.requirement_text
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.read().await
    }

    async fn touch(&self) {
        *self.updated_at.write().await = Utc::now();
    }

    pub async fn current_stage(&self) -> WorkflowStage {
        *self.current_stage.read().await
    }

    fn bucket(&self, which: Bucket) -> &RwLock<BucketMap> {
        match which {
            Bucket::Requirements => &self.requirements,
            Bucket::Architecture => &self.architecture,
            Bucket::Design => &self.design,
            Bucket::ImplementationPlan => &self.implementation_plan,
            Bucket::Metadata => &self.metadata,
        }
    }

    /// Reads one key out of a bucket.
    pub async fn get_bucket_value(&self, which: Bucket, key: &str) -> Option<serde_json::Value> {
        self.bucket(which).read().await.get(key).cloned()
    }

    /// Writes one key into a bucket, refreshing `updated_at`.
    pub async fn set_bucket_value(&self, which: Bucket, key: impl Into<String>, value: serde_json::Value) {
        self.bucket(which).write().await.insert(key.into(), value);
        self.touch().await;
    }

    /// Returns a clone of an entire bucket, e.g. for context construction.
    pub async fn bucket_snapshot(&self, which: Bucket) -> BucketMap {
        self.bucket(which).read().await.clone()
    }

    /// Appends a new task.
    pub async fn add_task(&self, task: Task) {
        let id = task.id;
        self.tasks.write().await.insert(id, task);
        self.touch().await;
        debug!(task_id = %id, "added task");
    }

    /// Applies `f` to the task with id `id`. A missing task id is a
    /// no-op (idempotent), per the component contract.
    pub async fn update_task(&self, id: TaskId, f: impl FnOnce(&mut Task)) {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) => {
                f(task);
                drop(tasks);
                self.touch().await;
            }
            None => {
                warn!(task_id = %id, "update_task: no such task, ignoring");
            }
        }
    }

    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn get_tasks_by_stage(&self, stage: WorkflowStage) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.stage == stage)
            .cloned()
            .collect()
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub async fn get_tasks_by_role(&self, role: AgentRole) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.owning_role == role)
            .cloned()
            .collect()
    }

    /// Records an artifact under `key`, overwriting any previous value.
    pub async fn add_artifact(&self, key: impl Into<String>, value: ArtifactValue) {
        let key = key.into();
        self.artifacts.write().await.insert(key.clone(), value);
        self.touch().await;
        info!(artifact_key = %key, "recorded artifact");
    }

    pub async fn get_artifact(&self, key: &str) -> Option<ArtifactValue> {
        self.artifacts.read().await.get(key).cloned()
    }

    pub async fn artifacts_snapshot(&self) -> HashMap<String, ArtifactValue> {
        self.artifacts.read().await.clone()
    }

    /// Appends a decision to the ordered decision log.
    pub async fn add_decision(&self, decision: impl Into<String>, made_by: AgentRole, rationale: impl Into<String>) {
        self.decisions.write().await.push(Decision::new(decision, made_by, rationale));
        self.touch().await;
    }

    /// Returns the last `n` decisions in chronological order, for context
    /// construction.
    pub async fn last_decisions(&self, n: usize) -> Vec<Decision> {
        let decisions = self.decisions.read().await;
        let start = decisions.len().saturating_sub(n);
        decisions[start..].to_vec()
    }

    /// Appends feedback to the ordered feedback log.
    pub async fn add_client_feedback(&self, text: impl Into<String>, stage: WorkflowStage) {
        self.client_feedback.write().await.push(ClientFeedback::new(text, stage));
        self.touch().await;
    }

    pub async fn client_feedback(&self) -> Vec<ClientFeedback> {
        self.client_feedback.read().await.clone()
    }

    /// Advances `current_stage` to `to`. Fails with
    /// `CrucibleError::InvalidStageTransition` unless `to` is `Failed` or
    /// the immediate successor of the current stage under `skip_ui_design`.
    /// `current_stage` never regresses: a validated transition always moves
    /// forward in the declared order (or to `Failed`).
    pub async fn advance_stage(&self, to: WorkflowStage, skip_ui_design: bool) -> CrucibleResult<()> {
        let mut stage = self.current_stage.write().await;
        stage.validate_transition(to, skip_ui_design)?;
        info!(from = %*stage, to = %to, "advancing stage");
        *stage = to;
        drop(stage);
        self.touch().await;
        Ok(())
    }

    /// Forces `current_stage` to an arbitrary value without validation.
    /// Used only by the checkpoint subsystem when restoring a snapshot,
    /// where the value is already known-valid history rather than a
    /// freshly-proposed transition.
    async fn force_stage(&self, to: WorkflowStage) {
        *self.current_stage.write().await = to;
    }

    /// Deep-copies the whole state into a [`ProjectStateSnapshot`] for
    /// checkpointing. Acquires and releases one region's read lock at a
    /// time; a concurrent writer to a region not yet visited may be
    /// reflected in the snapshot, but no two regions are ever locked
    /// simultaneously, so this can never deadlock against a concurrent
    /// `restore`.
    pub async fn snapshot(&self) -> ProjectStateSnapshot {
        ProjectStateSnapshot {
            id: self.id,
            name: self.name.clone(),
            requirement_text: self.requirement_text.clone(),
            current_stage: self.current_stage().await,
            created_at: self.created_at,
            updated_at: self.updated_at().await,
            requirements: self.bucket_snapshot(Bucket::Requirements).await,
            architecture: self.bucket_snapshot(Bucket::Architecture).await,
            design: self.bucket_snapshot(Bucket::Design).await,
            implementation_plan: self.bucket_snapshot(Bucket::ImplementationPlan).await,
            metadata: self.bucket_snapshot(Bucket::Metadata).await,
            tasks: self.tasks.read().await.clone(),
            artifacts: self.artifacts_snapshot().await,
            decisions: self.decisions.read().await.clone(),
            client_feedback: self.client_feedback().await,
        }
    }

    /// Replaces every region's contents with `snapshot`'s, region by
    /// region. `id`, `name`, `requirement_text`, and `created_at` are
    /// identity fields fixed at construction and are not part of the
    /// mutable restore surface; callers restoring into a fresh
    /// `ProjectState` must have constructed it with matching identity.
    pub async fn restore(&self, snapshot: ProjectStateSnapshot) {
        self.force_stage(snapshot.current_stage).await;
        *self.updated_at.write().await = snapshot.updated_at;
        *self.requirements.write().await = snapshot.requirements;
        *self.architecture.write().await = snapshot.architecture;
        *self.design.write().await = snapshot.design;
        *self.implementation_plan.write().await = snapshot.implementation_plan;
        *self.metadata.write().await = snapshot.metadata;
        *self.tasks.write().await = snapshot.tasks;
        *self.artifacts.write().await = snapshot.artifacts;
        *self.decisions.write().await = snapshot.decisions;
        *self.client_feedback.write().await = snapshot.client_feedback;
        info!(workflow_id = %self.id, stage = %snapshot.current_stage, "restored project state from snapshot");
    }

    /// Builds a `ProjectState` already populated from `snapshot`, for the
    /// checkpoint-resume path where no prior in-memory instance exists.
    pub async fn from_snapshot(snapshot: ProjectStateSnapshot) -> Self {
        let state = Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            requirement_text: snapshot.requirement_text.clone(),
            created_at: snapshot.created_at,
            current_stage: RwLock::new(WorkflowStage::Initial),
            updated_at: RwLock::new(snapshot.updated_at),
            requirements: RwLock::new(HashMap::new()),
            architecture: RwLock::new(HashMap::new()),
            design: RwLock::new(HashMap::new()),
            implementation_plan: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
            decisions: RwLock::new(Vec::new()),
            client_feedback: RwLock::new(Vec::new()),
        };
        state.restore(snapshot).await;
        state
    }
}

impl PartialEq for ProjectState {
    /// Structural equality via snapshot comparison is exposed as an async
    /// free function (`states_equal`) because `RwLock` reads require
    /// `.await`; this synchronous impl compares only immutable identity so
    /// `ProjectState` can still be used as a map key or in assertions that
    /// don't need full structural equality.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.requirement_text == other.requirement_text
    }
}

/// Full structural equality between two states, via their snapshots.
/// Used by the checkpoint round-trip test: `restore(snapshot(state)) ==
/// state`.
pub async fn states_equal(a: &ProjectState, b: &ProjectState) -> bool {
    a.snapshot().await == b.snapshot().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::new_id;

    fn new_state() -> ProjectState {
        ProjectState::new(new_id(), "demo", "Build a CLI that reverses its standard input.")
    }

    #[tokio::test]
    async fn advance_stage_rejects_non_adjacent_jump() {
        let state = new_state();
        let err = state
            .advance_stage(WorkflowStage::Implementation, false)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), crucible_core::ErrorKind::InvalidStageTransition);
        assert_eq!(state.current_stage().await, WorkflowStage::Initial);
    }

    #[tokio::test]
    async fn advance_stage_allows_adjacent_and_failed() {
        let state = new_state();
        state.advance_stage(WorkflowStage::RequirementsAnalysis, false).await.unwrap();
        assert_eq!(state.current_stage().await, WorkflowStage::RequirementsAnalysis);
        state.advance_stage(WorkflowStage::Failed, false).await.unwrap();
        assert_eq!(state.current_stage().await, WorkflowStage::Failed);
    }

    #[tokio::test]
    async fn update_task_on_missing_id_is_noop() {
        let state = new_state();
        state.update_task(new_id(), |t| t.status = TaskStatus::Completed).await;
        assert!(state.get_tasks_by_status(TaskStatus::Completed).await.is_empty());
    }

    #[tokio::test]
    async fn update_task_mutates_existing_task() {
        let state = new_state();
        let task = Task::new("write the requirements doc", WorkflowStage::RequirementsAnalysis, AgentRole::RequirementsAnalyst);
        let id = task.id;
        state.add_task(task).await;
        state.update_task(id, |t| t.set_status(TaskStatus::Completed)).await;
        let fetched = state.get_task(id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip_is_structurally_equal() {
        let state = new_state();
        state.advance_stage(WorkflowStage::RequirementsAnalysis, false).await.unwrap();
        state.set_bucket_value(Bucket::Requirements, "summary", serde_json::json!("reverse stdin")).await;
        state
            .add_artifact("requirements_doc", ArtifactValue::Inline(serde_json::json!({"text": "..."})))
            .await;
        state.add_decision("use tokio", AgentRole::Architect, "async I/O throughout").await;

        let snap = state.snapshot().await;
        let restored = ProjectState::from_snapshot(snap).await;
        assert!(states_equal(&state, &restored).await);
    }

    #[tokio::test]
    async fn updated_at_refreshed_on_mutation() {
        let state = new_state();
        let before = state.updated_at().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        state.add_decision("x", AgentRole::ProjectManager, "y").await;
        let after = state.updated_at().await;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn last_decisions_returns_most_recent_n() {
        let state = new_state();
        for i in 0..5 {
            state.add_decision(format!("d{i}"), AgentRole::Architect, "why").await;
        }
        let last = state.last_decisions(2).await;
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].decision, "d3");
        assert_eq!(last[1].decision, "d4");
    }
}
