use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crucible_core::{ErrorKind, StageHistoryEntry, WorkflowId, WorkflowStage, ORDINARY_STAGES};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One observed, classified failure during a run, independent of whether it
/// was eventually retried away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: WorkflowStage,
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// What kind of milestone a [`ProgressEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressEventType {
    StageStart,
    StageComplete,
    Completed,
    Failed,
    Canceled,
}

/// A point-in-time snapshot of a workflow's progress, emitted to an
/// [`EventSink`] at every stage boundary and at the terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: ProgressEventType,
    pub workflow_id: WorkflowId,
    pub current_stage: WorkflowStage,
    pub percent_complete: f64,
    pub stage_history: Vec<StageHistoryEntry>,
    pub total_tokens: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: Vec<ErrorRecord>,
    pub timestamp: DateTime<Utc>,
}

/// Computes percent complete as the fraction of ordinary stages strictly
/// before `reference_stage`, excluding `UiUxDesign` from both the numerator
/// and denominator when `skip_ui_design` is set. `Completed` always yields
/// exactly `100.0` regardless of `reference_stage`, per the contract that
/// completion reaches the ceiling exactly.
pub fn percent_complete(reference_stage: WorkflowStage, skip_ui_design: bool) -> f64 {
    if reference_stage == WorkflowStage::Completed {
        return 100.0;
    }

    let applicable: Vec<WorkflowStage> = ORDINARY_STAGES
        .into_iter()
        .filter(|s| !(skip_ui_design && *s == WorkflowStage::UiUxDesign))
        .collect();

    let total = applicable.len();
    if total == 0 {
        return 100.0;
    }

    let completed = applicable.iter().filter(|s| **s < reference_stage).count();
    (completed as f64 / total as f64) * 100.0
}

/// Destination for [`ProgressEvent`]s. A host UI, log sink, or test harness
/// implements this; the engine itself never assumes a particular transport.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ProgressEvent);
}

/// Discards every event. The default when a caller does not care to observe
/// progress.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards every event onto an unbounded channel, for callers that want to
/// `.await` progress from outside the engine (a UI loop, an integration
/// test).
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: ProgressEvent) {
        // A receiver dropped by a caller that stopped watching progress is
        // not a failure of the run itself.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_complete_is_zero_at_first_stage() {
        assert_eq!(percent_complete(WorkflowStage::RequirementsAnalysis, false), 0.0);
    }

    #[test]
    fn percent_complete_reaches_exactly_100_at_completed() {
        assert_eq!(percent_complete(WorkflowStage::Completed, false), 100.0);
        assert_eq!(percent_complete(WorkflowStage::Completed, true), 100.0);
    }

    #[test]
    fn percent_complete_excludes_ui_design_when_skipped() {
        // Six ordinary stages normally; skipping UI/UX drops it to five, so
        // Implementation (the 4th stage, 3 completed before it) differs.
        let with_ui = percent_complete(WorkflowStage::Implementation, false);
        let without_ui = percent_complete(WorkflowStage::Implementation, true);
        assert!((with_ui - 50.0).abs() < f64::EPSILON, "{with_ui}");
        assert!((without_ui - 40.0).abs() < f64::EPSILON, "{without_ui}");
    }

    #[test]
    fn percent_complete_is_monotonic_across_ordinary_stages() {
        let mut previous = -1.0;
        for stage in ORDINARY_STAGES {
            let value = percent_complete(stage, false);
            assert!(value > previous, "percent complete must strictly increase");
            previous = value;
        }
    }

    #[tokio::test]
    async fn null_sink_accepts_events_without_panicking() {
        let sink = NullEventSink;
        sink.emit(ProgressEvent {
            event_type: ProgressEventType::StageStart,
            workflow_id: crucible_core::new_id(),
            current_stage: WorkflowStage::RequirementsAnalysis,
            percent_complete: 0.0,
            stage_history: vec![],
            total_tokens: 0,
            cache_hits: 0,
            cache_misses: 0,
            errors: vec![],
            timestamp: Utc::now(),
        })
        .await;
    }

    #[tokio::test]
    async fn channel_sink_forwards_events_to_receiver() {
        let (sink, mut receiver) = ChannelEventSink::new();
        sink.emit(ProgressEvent {
            event_type: ProgressEventType::Completed,
            workflow_id: crucible_core::new_id(),
            current_stage: WorkflowStage::Completed,
            percent_complete: 100.0,
            stage_history: vec![],
            total_tokens: 42,
            cache_hits: 1,
            cache_misses: 0,
            errors: vec![],
            timestamp: Utc::now(),
        })
        .await;
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.total_tokens, 42);
    }
}
