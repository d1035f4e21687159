//! Crash-resumable, directory-per-workflow checkpoint storage.
//!
//! Each [`CheckpointRecord`] is a full, versioned snapshot of a workflow's
//! `ProjectState` plus its stage history. Writes are atomic
//! (write-to-temp + rename); `load_latest` restores from the
//! highest-sequence record that passes schema validation, discarding and
//! falling through past corrupted ones.

mod record;
mod store;

pub use record::{CheckpointMetadata, CheckpointRecord, CURRENT_SCHEMA_VERSION};
pub use store::{CheckpointPolicy, CheckpointStore};
