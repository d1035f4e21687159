//! Shared error, id, and stage/role vocabulary for the orchestration engine.
//!
//! Every other `crucible-*` crate depends on this one for [`CrucibleError`],
//! [`CrucibleResult`], and the [`WorkflowStage`]/[`AgentRole`] enumerations,
//! so that the stage order and role set are defined in exactly one place.

mod error;
mod ids;
mod stage;

pub use error::{CrucibleError, CrucibleResult, ErrorKind};
pub use ids::{new_id, CorrelationId, MessageId, SubscriptionId, TaskId, WorkflowId};
pub use stage::{AgentRole, StageHistoryEntry, WorkflowStage, ALL_ROLES, ORDINARY_STAGES};
