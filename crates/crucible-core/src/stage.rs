use serde::{Deserialize, Serialize};

use crate::error::CrucibleError;

/// A discrete phase of the workflow pipeline.
///
/// The canonical ordinary stages form a fixed total order,
/// `RequirementsAnalysis < ArchitectureDesign < UiUxDesign < Implementation <
/// Testing < QualityAssurance`, bracketed by `Initial` below and `Completed`
/// above. `Failed` is an alternate terminal reachable from any stage.
///
/// This is the canonical enumeration: a shorter, nine-value list, never the
/// longer sub-phase breakdown (requirements-gathering/refinement/planning/
/// documentation/deployment) that appears in some upstream material — those
/// sub-phases fold into the adjacent stage here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStage {
    /// The workflow has been created but no stage has started yet.
    Initial,
    /// Turn the initial requirement into a structured requirements document.
    RequirementsAnalysis,
    /// Produce an architecture document from the requirements.
    ArchitectureDesign,
    /// Produce a UI/UX design document. Skippable via `skip_ui_design`.
    UiUxDesign,
    /// Produce source code from the architecture (and design, if present).
    Implementation,
    /// Refinement stage: run/evaluate tests, repairing until they pass or
    /// the iteration budget is exhausted.
    Testing,
    /// Refinement stage: review the implementation, repairing until
    /// approved or the iteration budget is exhausted.
    QualityAssurance,
    /// The workflow reached the end of the pipeline successfully.
    Completed,
    /// An alternate terminal reached on an unrecoverable failure or
    /// cancellation.
    Failed,
}

/// The ordinary pipeline in declared order, excluding the `Initial` starting
/// point and the two terminals. Used for adjacency checks and percent-complete
/// computation.
pub const ORDINARY_STAGES: [WorkflowStage; 6] = [
    WorkflowStage::RequirementsAnalysis,
    WorkflowStage::ArchitectureDesign,
    WorkflowStage::UiUxDesign,
    WorkflowStage::Implementation,
    WorkflowStage::Testing,
    WorkflowStage::QualityAssurance,
];

impl WorkflowStage {
    /// Stages in which a refinement loop (bounded by `max_iterations`) applies.
    pub fn is_refinement(self) -> bool {
        matches!(self, WorkflowStage::Testing | WorkflowStage::QualityAssurance)
    }

    /// Whether this stage is one of the two terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStage::Completed | WorkflowStage::Failed)
    }

    /// The stage immediately following this one in declared order, or `None`
    /// past `Completed`/`Failed`. `skip_ui_design` causes `ArchitectureDesign`
    /// to advance straight to `Implementation`.
    pub fn next(self, skip_ui_design: bool) -> Option<WorkflowStage> {
        use WorkflowStage::*;
        Some(match self {
            Initial => RequirementsAnalysis,
            RequirementsAnalysis => ArchitectureDesign,
            ArchitectureDesign => {
                if skip_ui_design {
                    Implementation
                } else {
                    UiUxDesign
                }
            }
            UiUxDesign => Implementation,
            Implementation => Testing,
            Testing => QualityAssurance,
            QualityAssurance => Completed,
            Completed | Failed => return None,
        })
    }

    /// Validates a proposed transition `self -> to` against the monotonic
    /// advancement invariant: `to` must be `Failed`, or must be the stage
    /// `self.next(skip_ui_design)` would produce.
    pub fn validate_transition(
        self,
        to: WorkflowStage,
        skip_ui_design: bool,
    ) -> Result<(), CrucibleError> {
        if to == WorkflowStage::Failed {
            return Ok(());
        }
        match self.next(skip_ui_design) {
            Some(expected) if expected == to => Ok(()),
            _ => Err(CrucibleError::InvalidStageTransition {
                from: self.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStage::Initial => "INITIAL",
            WorkflowStage::RequirementsAnalysis => "REQUIREMENTS_ANALYSIS",
            WorkflowStage::ArchitectureDesign => "ARCHITECTURE_DESIGN",
            WorkflowStage::UiUxDesign => "UI_UX_DESIGN",
            WorkflowStage::Implementation => "IMPLEMENTATION",
            WorkflowStage::Testing => "TESTING",
            WorkflowStage::QualityAssurance => "QUALITY_ASSURANCE",
            WorkflowStage::Completed => "COMPLETED",
            WorkflowStage::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// One entry in a workflow's recorded stage history. Ordinary progress
/// appends `Stage(s)` as each stage starts; resuming from a checkpoint
/// prepends a `Restored` marker ahead of the stages executed since resume,
/// per the checkpoint-resume contract (S5: "stage history begins with a
/// `RESTORED` marker and continues from the resumed stage").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageHistoryEntry {
    /// Marks the point at which a workflow resumed from a checkpoint.
    Restored,
    /// A stage that started (or was reached, for terminals) during this run.
    Stage(WorkflowStage),
}

impl std::fmt::Display for StageHistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageHistoryEntry::Restored => write!(f, "RESTORED"),
            StageHistoryEntry::Stage(stage) => write!(f, "{stage}"),
        }
    }
}

/// The closed set of specialized agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    ProjectManager,
    RequirementsAnalyst,
    Architect,
    UxuiDesigner,
    Developer,
    TestEngineer,
    QualityExpert,
}

/// All seven roles in a fixed, deterministic enumeration order. SEQUENTIAL
/// dispatch iterates agents in this order; it never depends on a `HashMap`.
pub const ALL_ROLES: [AgentRole; 7] = [
    AgentRole::ProjectManager,
    AgentRole::RequirementsAnalyst,
    AgentRole::Architect,
    AgentRole::UxuiDesigner,
    AgentRole::Developer,
    AgentRole::TestEngineer,
    AgentRole::QualityExpert,
];

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::ProjectManager => "PROJECT_MANAGER",
            AgentRole::RequirementsAnalyst => "REQUIREMENTS_ANALYST",
            AgentRole::Architect => "ARCHITECT",
            AgentRole::UxuiDesigner => "UXUI_DESIGNER",
            AgentRole::Developer => "DEVELOPER",
            AgentRole::TestEngineer => "TEST_ENGINEER",
            AgentRole::QualityExpert => "QUALITY_EXPERT",
        };
        write!(f, "{s}")
    }
}
