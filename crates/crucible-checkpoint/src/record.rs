use chrono::{DateTime, Utc};
use crucible_core::{StageHistoryEntry, WorkflowId, WorkflowStage};
use crucible_state::ProjectStateSnapshot;
use serde::{Deserialize, Serialize};

/// The current, and only, checkpoint schema version this crate writes.
/// `load_latest` rejects any record whose `schema_version` does not equal
/// this value rather than attempting a migration (§9: "do not guess
/// migration").
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Free-form metadata accompanying a checkpoint write: when it was taken and
/// why (`"stage-complete"`, `"task-complete"`, `"explicit"`,
/// `"cancellation"`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub created_at: DateTime<Utc>,
    pub reason: String,
}

impl CheckpointMetadata {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { created_at: Utc::now(), reason: reason.into() }
    }
}

/// A full, self-describing snapshot of one workflow at one point in its
/// execution: schema version, identity, stage position, complete history,
/// and the entire `ProjectState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    pub workflow_id: WorkflowId,
    pub current_stage: WorkflowStage,
    pub stage_history: Vec<StageHistoryEntry>,
    pub state: ProjectStateSnapshot,
    pub metadata: CheckpointMetadata,
    /// Monotonically increasing per workflow; the highest valid sequence on
    /// disk is authoritative for resume.
    pub sequence: u64,
}

impl CheckpointRecord {
    pub fn new(
        sequence: u64,
        current_stage: WorkflowStage,
        stage_history: Vec<StageHistoryEntry>,
        state: ProjectStateSnapshot,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            workflow_id: state.id,
            current_stage,
            stage_history,
            state,
            metadata: CheckpointMetadata::new(reason),
            sequence,
        }
    }
}
