use std::path::{Path, PathBuf};

use crucible_core::{CrucibleError, CrucibleResult, WorkflowId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::record::{CheckpointRecord, CURRENT_SCHEMA_VERSION};

/// Configures checkpoint behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub enabled: bool,
    pub checkpoint_directory: PathBuf,
    /// Number of most-recent checkpoints kept per workflow; older ones are
    /// deleted on a successful newer write.
    pub retain_last: usize,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint_directory: PathBuf::from("checkpoints"),
            retain_last: 5,
        }
    }
}

fn filename(sequence: u64) -> String {
    format!("checkpoint_{sequence}.json")
}

fn parse_sequence(file_name: &str) -> Option<u64> {
    file_name.strip_prefix("checkpoint_")?.strip_suffix(".json")?.parse().ok()
}

/// Directory-per-workflow append-only checkpoint store. Writes are atomic
/// (write-to-temp + rename); concurrent writes within the same workflow
/// serialize via a per-workflow lock held by this store instance (callers
/// are expected to hold one `CheckpointStore` per running engine, shared
/// across a workflow's own tasks, matching §5's "concurrent writes within
/// the same workflow serialize via a per-workflow lock").
pub struct CheckpointStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Creates a store rooted at `root` (typically
    /// `<output_directory>/checkpoints`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), write_lock: Mutex::new(()) }
    }

    fn workflow_dir(&self, workflow_id: WorkflowId) -> PathBuf {
        self.root.join(workflow_id.to_string())
    }

    /// The next sequence number for `workflow_id`: one greater than the
    /// highest sequence currently on disk (parseable or not — a malformed
    /// file still reserves its number), or `0` if the directory is empty or
    /// absent.
    pub async fn next_sequence(&self, workflow_id: WorkflowId) -> CrucibleResult<u64> {
        let dir = self.workflow_dir(workflow_id);
        let mut max = None;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(seq) = parse_sequence(name) {
                    max = Some(max.map_or(seq, |m: u64| m.max(seq)));
                }
            }
        }
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Writes `record` atomically, then trims older checkpoints below
    /// `retain_last`. Retries once on a transient I/O failure before
    /// surfacing the error; callers treat a surfaced error as
    /// checkpoint-degraded (log a warning, do not fail the workflow), per
    /// the component's failure semantics.
    pub async fn write(&self, record: &CheckpointRecord, retain_last: usize) -> CrucibleResult<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.workflow_dir(record.workflow_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut attempt = 0;
        loop {
            match self.write_once(&dir, record).await {
                Ok(()) => break,
                Err(err) if attempt == 0 => {
                    warn!(workflow_id = %record.workflow_id, sequence = record.sequence, error = %err, "checkpoint write failed, retrying once");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(workflow_id = %record.workflow_id, sequence = record.sequence, "wrote checkpoint");
        self.trim_retention(&dir, retain_last).await?;
        Ok(())
    }

    async fn write_once(&self, dir: &Path, record: &CheckpointRecord) -> CrucibleResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let final_path = dir.join(filename(record.sequence));
        let tmp_path = dir.join(format!("{}.tmp", filename(record.sequence)));
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn trim_retention(&self, dir: &Path, retain_last: usize) -> CrucibleResult<()> {
        let mut sequences = self.list_sequences(dir).await?;
        sequences.sort_unstable_by(|a, b| b.cmp(a));
        for seq in sequences.into_iter().skip(retain_last) {
            let path = dir.join(filename(seq));
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "failed to remove retired checkpoint");
            }
        }
        Ok(())
    }

    async fn list_sequences(&self, dir: &Path) -> CrucibleResult<Vec<u64>> {
        let mut sequences = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(seq) = parse_sequence(name) {
                    sequences.push(seq);
                }
            }
        }
        Ok(sequences)
    }

    /// Scans the workflow's directory and restores from the
    /// highest-sequence record that passes schema validation; records that
    /// fail to parse or carry an unknown `schema_version` are discarded
    /// (logged as `CheckpointCorrupted`) and the next-highest sequence is
    /// tried. Returns `None` if no valid record exists (or the directory
    /// doesn't exist), meaning the caller should start fresh.
    pub async fn load_latest(&self, workflow_id: WorkflowId) -> CrucibleResult<Option<CheckpointRecord>> {
        let dir = self.workflow_dir(workflow_id);
        let mut sequences = match self.list_sequences(&dir).await {
            Ok(sequences) => sequences,
            Err(_) => return Ok(None),
        };
        sequences.sort_unstable_by(|a, b| b.cmp(a));

        for seq in sequences {
            let path = dir.join(filename(seq));
            match self.try_load(&path).await {
                Ok(record) => {
                    info!(workflow_id = %workflow_id, sequence = seq, "restored from checkpoint");
                    return Ok(Some(record));
                }
                Err(err) => {
                    warn!(workflow_id = %workflow_id, sequence = seq, error = %err, "discarding corrupted checkpoint, trying older");
                }
            }
        }
        Ok(None)
    }

    async fn try_load(&self, path: &Path) -> CrucibleResult<CheckpointRecord> {
        let bytes = tokio::fs::read(path).await?;
        let record: CheckpointRecord = serde_json::from_slice(&bytes)
            .map_err(|e| CrucibleError::CheckpointCorrupted(e.to_string()))?;
        if record.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(CrucibleError::CheckpointCorrupted(format!(
                "unknown schema_version {}",
                record.schema_version
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::new_id;
    use crucible_state::ProjectState;

    async fn sample_record(workflow_id: WorkflowId, sequence: u64) -> CheckpointRecord {
        let state = ProjectState::new(workflow_id, "demo", "reverse stdin");
        CheckpointRecord::new(
            sequence,
            crucible_core::WorkflowStage::Initial,
            vec![],
            state.snapshot().await,
            "explicit",
        )
    }

    #[tokio::test]
    async fn write_then_load_latest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let workflow_id = new_id();

        let record = sample_record(workflow_id, 0).await;
        store.write(&record, 5).await.unwrap();

        let loaded = store.load_latest(workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 0);
        assert_eq!(loaded.workflow_id, workflow_id);
    }

    #[tokio::test]
    async fn load_latest_picks_highest_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let workflow_id = new_id();

        for seq in 0..3 {
            store.write(&sample_record(workflow_id, seq).await, 10).await.unwrap();
        }

        let loaded = store.load_latest(workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 2);
    }

    #[tokio::test]
    async fn retention_trims_older_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let workflow_id = new_id();

        for seq in 0..5 {
            store.write(&sample_record(workflow_id, seq).await, 2).await.unwrap();
        }

        let wf_dir = store.workflow_dir(workflow_id);
        let remaining = store.list_sequences(&wf_dir).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&3));
        assert!(remaining.contains(&4));
    }

    #[tokio::test]
    async fn corrupted_latest_falls_back_to_older_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let workflow_id = new_id();

        store.write(&sample_record(workflow_id, 0).await, 10).await.unwrap();
        let wf_dir = store.workflow_dir(workflow_id);
        tokio::fs::write(wf_dir.join("checkpoint_1.json"), b"not json").await.unwrap();

        let loaded = store.load_latest(workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 0);
    }

    #[tokio::test]
    async fn no_checkpoints_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let loaded = store.load_latest(new_id()).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn next_sequence_is_one_past_highest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let workflow_id = new_id();
        assert_eq!(store.next_sequence(workflow_id).await.unwrap(), 0);
        store.write(&sample_record(workflow_id, 0).await, 10).await.unwrap();
        store.write(&sample_record(workflow_id, 1).await, 10).await.unwrap();
        assert_eq!(store.next_sequence(workflow_id).await.unwrap(), 2);
    }
}
