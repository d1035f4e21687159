use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use crucible_core::{CrucibleResult, WorkflowId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::progress::ProgressEvent;

/// Everything a host's relational database knows about a project that the
/// orchestrator needs to start or resume it. Mirrors `load_project`'s
/// return shape from the external interfaces contract; `llm_config` is
/// opaque to the core and passed through to whatever assembles the
/// `Generator` the host hands to [`crate::WorkflowOrchestrator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub id: WorkflowId,
    pub name: String,
    pub requirements: String,
    pub llm_config: serde_json::Value,
    pub output_directory: PathBuf,
}

/// The persistence seam the core consumes to load a project's identity and
/// configuration. A real implementation is a thin wrapper over the host's
/// relational database; this crate never implements one itself, per the
/// "out of scope, treated as external collaborator" boundary.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Loads the descriptor for `id`. Fails with `CrucibleError::ConfigurationError`
    /// (or a host-specific variant wrapped through it) if no such project exists.
    async fn load_project(&self, id: WorkflowId) -> CrucibleResult<ProjectDescriptor>;
}

/// An append-only destination for progress/usage events, distinct from
/// [`crate::EventSink`]: `EventSink` streams to the API/WebSocket layer for
/// a live observer, while `MetricsSink` is the durable record a host
/// persists (e.g. into its metrics tables) and never expects to be
/// consumed in real time. The orchestrator calls both on every event.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Records one progress event. Errors are the sink's own problem to log;
    /// this method has no `Result` because a metrics-recording failure must
    /// never be allowed to fail the workflow it's describing.
    async fn record(&self, event: &ProgressEvent);
}

/// Discards every event. The default when a caller does not care to persist
/// metrics (e.g. in tests).
pub struct NullMetricsSink;

#[async_trait]
impl MetricsSink for NullMetricsSink {
    async fn record(&self, _event: &ProgressEvent) {}
}

/// An in-memory `ProjectRepository` test double, keyed by workflow id.
/// Exists for the orchestration engine's own integration tests and for a
/// host's tests that want a `ProjectRepository` without standing up a
/// database.
#[derive(Default)]
pub struct InMemoryProjectRepository {
    projects: Mutex<std::collections::HashMap<WorkflowId, ProjectDescriptor>>,
}

impl InMemoryProjectRepository {
    pub fn new() -> Self {
        Self { projects: Mutex::new(std::collections::HashMap::new()) }
    }

    /// Registers a descriptor so a later `load_project` can find it.
    pub async fn insert(&self, descriptor: ProjectDescriptor) {
        self.projects.lock().await.insert(descriptor.id, descriptor);
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn load_project(&self, id: WorkflowId) -> CrucibleResult<ProjectDescriptor> {
        self.projects
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| crucible_core::CrucibleError::ConfigurationError(format!("no project registered for {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: WorkflowId) -> ProjectDescriptor {
        ProjectDescriptor {
            id,
            name: "demo".to_string(),
            requirements: "Build a CLI that reverses its standard input.".to_string(),
            llm_config: serde_json::json!({"provider": "stub"}),
            output_directory: PathBuf::from("out"),
        }
    }

    #[tokio::test]
    async fn load_project_returns_registered_descriptor() {
        let repo = InMemoryProjectRepository::new();
        let id = crucible_core::new_id();
        repo.insert(descriptor(id)).await;

        let loaded = repo.load_project(id).await.unwrap();
        assert_eq!(loaded.name, "demo");
    }

    #[tokio::test]
    async fn load_project_fails_for_unknown_id() {
        let repo = InMemoryProjectRepository::new();
        let err = repo.load_project(crucible_core::new_id()).await.unwrap_err();
        assert_eq!(err.error_kind(), crucible_core::ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn null_metrics_sink_accepts_without_panicking() {
        let sink = NullMetricsSink;
        sink.record(&ProgressEvent {
            event_type: crate::progress::ProgressEventType::StageStart,
            workflow_id: crucible_core::new_id(),
            current_stage: crucible_core::WorkflowStage::RequirementsAnalysis,
            percent_complete: 0.0,
            stage_history: vec![],
            total_tokens: 0,
            cache_hits: 0,
            cache_misses: 0,
            errors: vec![],
            timestamp: chrono::Utc::now(),
        })
        .await;
    }
}
