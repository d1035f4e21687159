use chrono::{DateTime, Utc};
use crucible_core::{AgentRole, WorkflowStage};
use serde::{Deserialize, Serialize};

/// One recorded design or process decision, attributed to the agent that
/// made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub made_by: AgentRole,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(decision: impl Into<String>, made_by: AgentRole, rationale: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            made_by,
            rationale: rationale.into(),
            created_at: Utc::now(),
        }
    }
}

/// A piece of feedback supplied by the end user while a given stage was
/// current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFeedback {
    pub text: String,
    pub stage: WorkflowStage,
    pub created_at: DateTime<Utc>,
}

impl ClientFeedback {
    pub fn new(text: impl Into<String>, stage: WorkflowStage) -> Self {
        Self { text: text.into(), stage, created_at: Utc::now() }
    }
}

/// An artifact value: either an inline payload or a path rooted within the
/// workflow's output directory. The core does not interpret either variant;
/// it is opaque storage addressed by artifact key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactValue {
    /// An inline JSON payload (small documents, structured results).
    Inline(serde_json::Value),
    /// A path to a file written under the workflow's output directory.
    Path(String),
}
