//! The shared mutable project state hub.
//!
//! `ProjectState` is the single authoritative in-memory representation of
//! one workflow's data: requirements/architecture/design/implementation-plan
//! buckets, the task list, artifacts, decisions, and client feedback. Every
//! section is an independently locked region (§4.1) so that writers to
//! different regions never block each other.

mod decision;
mod state;
mod task;

pub use decision::{ArtifactValue, ClientFeedback, Decision};
pub use state::{states_equal, Bucket, ProjectState, ProjectStateSnapshot};
pub use task::{Task, TaskStatus};
