//! End-to-end orchestration tests against the public `WorkflowOrchestrator`
//! API, exercising scenarios the in-source unit tests don't: transient
//! failures that recover under retry, retries that exhaust and fail the
//! workflow, and crash-resume via checkpoint.

use std::sync::Arc;
use std::time::Duration;

use crucible_core::{CrucibleError, WorkflowStage};
use crucible_generator::{Generator, StubGenerator};
use crucible_orchestrator::{
    ChannelEventSink, OrchestratorConfig, ProgressEventType, WorkflowOrchestrator, WorkflowOutcome,
};

fn test_config(project_id: crucible_core::WorkflowId, output_directory: impl Into<std::path::PathBuf>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(
        project_id,
        "demo",
        "Build a CLI that reverses its standard input.",
        output_directory.into(),
    );
    config.retry_policy.initial_delay = Duration::from_millis(1);
    config.retry_policy.max_delay = Duration::from_millis(2);
    config
}

fn no_sleep() -> crucible_retry::SleepFn {
    Arc::new(|_| Box::pin(async {}))
}

#[tokio::test]
async fn transient_failures_recover_under_retry() {
    let dir = tempfile::tempdir().unwrap();
    let project_id = crucible_core::new_id();
    let generator = Arc::new(
        StubGenerator::new().with_injected_failures(vec![
            CrucibleError::Timeout("slow provider".to_string()),
            CrucibleError::NetworkError("connection reset".to_string()),
        ]),
    );
    let orchestrator = WorkflowOrchestrator::new(test_config(project_id, dir.path()), generator.clone() as Arc<dyn Generator>)
        .await
        .unwrap()
        .with_sleep_fn(no_sleep());

    let summary = orchestrator.run().await;

    assert_eq!(summary.outcome, WorkflowOutcome::Completed);
    assert!(summary.errors.is_empty(), "a retry that eventually succeeds must not be surfaced as a workflow error");
}

#[tokio::test]
async fn exhausted_retries_fail_the_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let project_id = crucible_core::new_id();
    // Default retry policy allows 3 retries (4 attempts total); 5 queued
    // failures outlast every attempt on the very first Agent invocation.
    let generator = Arc::new(StubGenerator::new().with_injected_failures(vec![
        CrucibleError::Timeout("t1".to_string()),
        CrucibleError::Timeout("t2".to_string()),
        CrucibleError::Timeout("t3".to_string()),
        CrucibleError::Timeout("t4".to_string()),
        CrucibleError::Timeout("t5".to_string()),
    ]));
    let orchestrator = WorkflowOrchestrator::new(test_config(project_id, dir.path()), generator as Arc<dyn Generator>)
        .await
        .unwrap()
        .with_sleep_fn(no_sleep());

    let summary = orchestrator.run().await;

    assert_eq!(summary.outcome, WorkflowOutcome::Failed);
    assert!(!summary.errors.is_empty());
    assert_eq!(orchestrator.state().current_stage().await, WorkflowStage::Failed);
}

#[tokio::test]
async fn cancellation_mid_run_stops_before_the_next_stage() {
    let dir = tempfile::tempdir().unwrap();
    let project_id = crucible_core::new_id();
    let generator: Arc<dyn Generator> = Arc::new(StubGenerator::new());
    let (sink, mut events) = ChannelEventSink::new();
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(test_config(project_id, dir.path()), generator)
            .await
            .unwrap()
            .with_sleep_fn(no_sleep())
            .with_event_sink(Arc::new(sink)),
    );

    let handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    // Cancel as soon as the first stage completes, before the loop in `run`
    // advances to the next one.
    while let Some(event) = events.recv().await {
        if event.event_type == ProgressEventType::StageComplete {
            orchestrator.cancel();
            break;
        }
    }

    let summary = handle.await.unwrap();
    assert_eq!(summary.outcome, WorkflowOutcome::Canceled);
}

#[tokio::test]
async fn resume_continues_from_the_last_checkpoint_after_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let project_id = crucible_core::new_id();
    let generator: Arc<dyn Generator> = Arc::new(StubGenerator::new());
    let (sink, mut events) = ChannelEventSink::new();
    let first_run_config = test_config(project_id, dir.path());
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(first_run_config, generator.clone())
            .await
            .unwrap()
            .with_sleep_fn(no_sleep())
            .with_event_sink(Arc::new(sink)),
    );

    let handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    let mut completed_stage = None;
    while let Some(event) = events.recv().await {
        if event.event_type == ProgressEventType::StageComplete {
            completed_stage = Some(event.current_stage);
            break;
        }
    }
    let completed_stage = completed_stage.expect("at least one stage must complete before the simulated crash");
    // Simulate the process dying outright: abort the task rather than
    // cancel it, so no graceful shutdown (and no FAILED transition) runs.
    handle.abort();
    let _ = handle.await;

    let resumed_config = test_config(project_id, dir.path());
    let resumed = WorkflowOrchestrator::resume(resumed_config, generator)
        .await
        .unwrap()
        .with_sleep_fn(no_sleep());

    assert_eq!(
        resumed.state().current_stage().await,
        completed_stage,
        "resume must restore the last checkpointed stage, not restart at INITIAL"
    );

    let summary = resumed.run().await;
    assert_eq!(summary.outcome, WorkflowOutcome::Completed);
}
