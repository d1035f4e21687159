//! The Workflow Orchestrator: the engine that drives one `ProjectState`
//! through the nine-stage pipeline, coordinating Agents, the result cache,
//! the retry controller, the checkpoint store, and progress events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crucible_agent::{profile_for, Agent, AgentContext, AgentOutputPayload};
use crucible_bus::{Message, MessageBus, MessageType, Participant};
use crucible_cache::{compute_cache_key, CacheEntry, CacheKeyInput, ResultCache};
use crucible_checkpoint::{CheckpointRecord, CheckpointStore};
use crucible_core::{
    AgentRole, CrucibleError, CrucibleResult, StageHistoryEntry, WorkflowStage, ALL_ROLES,
};
use crucible_generator::Generator;
use crucible_retry::{retry_with_policy, tokio_sleep, RetryAttempt, SleepFn};
use crucible_state::{Bucket, ProjectState, Task};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cancellation::CancellationToken;
use crate::config::{ExecutionStrategy, OrchestratorConfig};
use crate::outcome::{WorkflowOutcome, WorkflowSummary};
use crate::progress::{ErrorRecord, EventSink, NullEventSink, ProgressEvent, ProgressEventType};
use crate::repository::{MetricsSink, NullMetricsSink};

/// The outcome of one stage's dispatch, distinct from the workflow-level
/// `WorkflowOutcome`: a stage either runs to completion or is interrupted by
/// cancellation. A stage failure is instead surfaced as `Err`.
enum StageOutcome {
    Completed,
    Cancelled,
}

fn default_capability(role: AgentRole) -> &'static str {
    profile_for(role).capabilities.first().map(|c| c.name).unwrap_or("invoke")
}

/// Drives one workflow end to end: `INITIAL` through `COMPLETED` or
/// `FAILED`, dispatching the Agents responsible for each stage, running the
/// `TESTING`/`QUALITY_ASSURANCE` refinement loop, consulting the result
/// cache before every invocation, retrying transient `Generator` failures,
/// checkpointing after every stage, and emitting `ProgressEvent`s throughout.
pub struct WorkflowOrchestrator {
    config: OrchestratorConfig,
    bus: Arc<MessageBus>,
    state: Arc<ProjectState>,
    agents: HashMap<AgentRole, Arc<Agent>>,
    cache: ResultCache,
    checkpoint_store: CheckpointStore,
    cancellation: Arc<CancellationToken>,
    sleep_fn: SleepFn,
    event_sink: Arc<dyn EventSink>,
    metrics_sink: Arc<dyn MetricsSink>,
    stage_history: RwLock<Vec<StageHistoryEntry>>,
    errors: Mutex<Vec<ErrorRecord>>,
    stage_durations: Mutex<HashMap<String, Duration>>,
    total_tokens: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl WorkflowOrchestrator {
    /// Starts a fresh workflow at `WorkflowStage::Initial`.
    pub async fn new(config: OrchestratorConfig, generator: Arc<dyn Generator>) -> CrucibleResult<Self> {
        config.validate()?;
        let state = Arc::new(ProjectState::new(
            config.project_id,
            config.project_name.clone(),
            config.requirements.clone(),
        ));
        Self::build(config, state, Vec::new(), generator).await
    }

    /// Resumes a workflow from the latest valid checkpoint under
    /// `config.output_directory`. Falls back to a fresh workflow if no
    /// checkpoint exists for `config.project_id`, per the component's "start
    /// fresh" contract.
    pub async fn resume(config: OrchestratorConfig, generator: Arc<dyn Generator>) -> CrucibleResult<Self> {
        config.validate()?;
        let checkpoint_root = config.output_directory.join(&config.checkpoint_policy.checkpoint_directory);
        let store = CheckpointStore::new(checkpoint_root);
        match store.load_latest(config.project_id).await? {
            Some(record) => {
                let state = Arc::new(ProjectState::from_snapshot(record.state).await);
                Self::build(config, state, vec![StageHistoryEntry::Restored], generator).await
            }
            None => {
                let state = Arc::new(ProjectState::new(
                    config.project_id,
                    config.project_name.clone(),
                    config.requirements.clone(),
                ));
                Self::build(config, state, Vec::new(), generator).await
            }
        }
    }

    async fn build(
        config: OrchestratorConfig,
        state: Arc<ProjectState>,
        stage_history: Vec<StageHistoryEntry>,
        generator: Arc<dyn Generator>,
    ) -> CrucibleResult<Self> {
        let bus = Arc::new(MessageBus::new());
        let mut agents = HashMap::new();
        for role in ALL_ROLES {
            let agent = Agent::spawn(role, bus.clone(), state.clone(), generator.clone()).await;
            agents.insert(role, agent);
        }

        let checkpoint_root = config.output_directory.join(&config.checkpoint_policy.checkpoint_directory);
        let checkpoint_store = CheckpointStore::new(checkpoint_root);
        let cache = ResultCache::new(config.cache_policy.max_cache_size.max(1));
        if let Some(dir) = &config.cache_policy.cache_directory {
            cache.load(&dir.join("result_cache.json")).await;
        }

        Ok(Self {
            config,
            bus,
            state,
            agents,
            cache,
            checkpoint_store,
            cancellation: Arc::new(CancellationToken::new()),
            sleep_fn: tokio_sleep(),
            event_sink: Arc::new(NullEventSink),
            metrics_sink: Arc::new(NullMetricsSink),
            stage_history: RwLock::new(stage_history),
            errors: Mutex::new(Vec::new()),
            stage_durations: Mutex::new(HashMap::new()),
            total_tokens: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Replaces the destination for `ProgressEvent`s. Defaults to
    /// `NullEventSink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Replaces the durable metrics destination for `ProgressEvent`s.
    /// Defaults to `NullMetricsSink`. Called alongside the `EventSink` on
    /// every emitted event, never in its place.
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    /// Replaces the sleep hook the retry controller uses, e.g. with a
    /// delay-recording no-op for deterministic tests.
    pub fn with_sleep_fn(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = sleep_fn;
        self
    }

    /// A cloneable handle a caller can use to request cancellation from
    /// outside `run`.
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.cancellation.clone()
    }

    /// Requests cancellation. Equivalent to `cancellation_token().cancel()`.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn state(&self) -> &Arc<ProjectState> {
        &self.state
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drives the workflow from its current stage to a terminal outcome.
    pub async fn run(&self) -> WorkflowSummary {
        if self.cancellation.is_cancelled() {
            let stage = self.state.current_stage().await;
            return self.finalize_cancelled(stage).await;
        }

        loop {
            let current = self.state.current_stage().await;
            if current.is_terminal() {
                break;
            }
            let next_stage = match current.next(self.config.skip_ui_design) {
                Some(stage) => stage,
                None => break,
            };

            if let Err(err) = self.state.advance_stage(next_stage, self.config.skip_ui_design).await {
                return self.finalize_failed(&err, current).await;
            }
            self.append_history(StageHistoryEntry::Stage(next_stage)).await;
            self.broadcast_stage(MessageType::StageStart, next_stage).await;
            self.emit(ProgressEventType::StageStart, next_stage).await;

            let start = Instant::now();
            let outcome = self.run_stage(next_stage).await;
            self.record_stage_duration(next_stage, start.elapsed());

            match outcome {
                Ok(StageOutcome::Completed) => {
                    self.checkpoint("stage-complete").await;
                    self.broadcast_stage(MessageType::StageComplete, next_stage).await;
                    self.emit(ProgressEventType::StageComplete, next_stage).await;
                }
                Ok(StageOutcome::Cancelled) => {
                    return self.finalize_cancelled(next_stage).await;
                }
                Err(err) => {
                    return self.finalize_failed(&err, next_stage).await;
                }
            }
        }

        self.finalize_completed().await
    }

    async fn run_stage(&self, stage: WorkflowStage) -> CrucibleResult<StageOutcome> {
        if stage.is_refinement() {
            self.run_refinement_stage(stage).await
        } else {
            let responsible = self.responsible_agents(stage);
            self.dispatch_roles(stage, &responsible).await
        }
    }

    fn responsible_agents(&self, stage: WorkflowStage) -> Vec<AgentRole> {
        ALL_ROLES.into_iter().filter(|role| profile_for(*role).responsible_stages.contains(&stage)).collect()
    }

    /// Resolves `ADAPTIVE` down to a concrete `SEQUENTIAL`/`PARALLEL` choice
    /// for this stage's responsible roles: `SEQUENTIAL` only when two or more
    /// roles would write into the same output bucket, `PARALLEL` otherwise.
    fn resolve_strategy(&self, roles: &[AgentRole]) -> ExecutionStrategy {
        match self.config.execution_strategy {
            ExecutionStrategy::Sequential => ExecutionStrategy::Sequential,
            ExecutionStrategy::Parallel => ExecutionStrategy::Parallel,
            ExecutionStrategy::Adaptive => {
                if roles.len() <= 1 {
                    return ExecutionStrategy::Parallel;
                }
                let mut seen: Vec<Bucket> = Vec::new();
                let conflicting = roles.iter().any(|role| {
                    let bucket = profile_for(*role).output_bucket;
                    if seen.contains(&bucket) {
                        true
                    } else {
                        seen.push(bucket);
                        false
                    }
                });
                if conflicting {
                    ExecutionStrategy::Sequential
                } else {
                    ExecutionStrategy::Parallel
                }
            }
        }
    }

    async fn dispatch_roles(&self, stage: WorkflowStage, roles: &[AgentRole]) -> CrucibleResult<StageOutcome> {
        if roles.is_empty() {
            return Ok(StageOutcome::Completed);
        }
        if self.cancellation.is_cancelled() {
            return Ok(StageOutcome::Cancelled);
        }

        match self.resolve_strategy(roles) {
            ExecutionStrategy::Sequential => {
                for role in roles {
                    if self.cancellation.is_cancelled() {
                        return Ok(StageOutcome::Cancelled);
                    }
                    self.invoke_agent(stage, *role).await?;
                    if self.cancellation.is_cancelled() {
                        return Ok(StageOutcome::Cancelled);
                    }
                }
                Ok(StageOutcome::Completed)
            }
            // PARALLEL/ADAPTIVE-resolved-to-PARALLEL: bound concurrency with a
            // semaphore sized to `max_parallel_agents`, acquired before each
            // invocation. Invocations run as concurrently-polled futures
            // rather than spawned tasks, since `&self` is not `'static`; for
            // Agent invocations, which are I/O-bound on the Generator, this
            // still overlaps their wait time instead of serializing it.
            _ => {
                let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_parallel_agents));
                let futures = roles.iter().map(|role| {
                    let semaphore = semaphore.clone();
                    let role = *role;
                    async move {
                        if self.cancellation.is_cancelled() {
                            return Ok(());
                        }
                        let _permit = semaphore
                            .acquire()
                            .await
                            .map_err(|_| CrucibleError::InvalidRequest("semaphore closed unexpectedly".into()))?;
                        self.invoke_agent(stage, role).await
                    }
                });
                for result in futures_util::future::join_all(futures).await {
                    result?;
                }
                if self.cancellation.is_cancelled() {
                    Ok(StageOutcome::Cancelled)
                } else {
                    Ok(StageOutcome::Completed)
                }
            }
        }
    }

    /// Runs the bounded repair loop for `TESTING`/`QUALITY_ASSURANCE`:
    /// dispatch the stage's responsible role, check its success flag, and if
    /// not satisfied invoke `DEVELOPER` to repair before trying again, up to
    /// `max_iterations` attempts. Exhausting the budget without success is
    /// not treated as a stage failure: the workflow proceeds with whatever
    /// the last iteration produced, matching "abort the loop on success or
    /// exhaustion" rather than "fail the workflow on exhaustion".
    async fn run_refinement_stage(&self, stage: WorkflowStage) -> CrucibleResult<StageOutcome> {
        let responsible = self.responsible_agents(stage);
        for iteration in 0..self.config.max_iterations {
            if self.cancellation.is_cancelled() {
                return Ok(StageOutcome::Cancelled);
            }

            match self.dispatch_roles(stage, &responsible).await? {
                StageOutcome::Cancelled => return Ok(StageOutcome::Cancelled),
                StageOutcome::Completed => {}
            }

            if self.refinement_succeeded(stage).await {
                return Ok(StageOutcome::Completed);
            }

            if iteration + 1 < self.config.max_iterations {
                if self.cancellation.is_cancelled() {
                    return Ok(StageOutcome::Cancelled);
                }
                self.invoke_agent(stage, AgentRole::Developer).await?;
            }
        }

        info!(stage = %stage, max_iterations = self.config.max_iterations, "refinement loop exhausted without success, proceeding");
        Ok(StageOutcome::Completed)
    }

    /// Reads this iteration's success flag out of `ProjectState`. An absent
    /// key (the agent was never invoked, or wrote nothing) is treated as
    /// `false`, never as an implicit pass.
    async fn refinement_succeeded(&self, stage: WorkflowStage) -> bool {
        let (key, field) = match stage {
            WorkflowStage::Testing => ("test_results", "all_passed"),
            WorkflowStage::QualityAssurance => ("qa_results", "approved"),
            _ => return true,
        };
        self.state
            .get_bucket_value(Bucket::ImplementationPlan, key)
            .await
            .and_then(|value| value.get(field).and_then(|v| v.as_bool()))
            .unwrap_or(false)
    }

    /// Builds this role's context, consults the result cache, invokes the
    /// Generator under the retry policy on a miss, and applies the output to
    /// `ProjectState`.
    ///
    /// Bounded by `config.timeout_per_stage` at two distinct points, per the
    /// "Timeouts" contract: the wait for the Generator to produce output
    /// (including every retry attempt) is a retryable failure, surfaced as
    /// `CrucibleError::Timeout` — the same kind the retry controller already
    /// treats as transient at call sites that wrap it in `retry_with_policy`.
    /// Applying an already-produced output to `ProjectState` is not wrapped
    /// in any retry loop, so a timeout there is fatal by construction: it
    /// propagates straight out of `invoke_agent` and fails the stage with no
    /// second attempt.
    async fn invoke_agent(&self, stage: WorkflowStage, role: AgentRole) -> CrucibleResult<()> {
        let agent = self
            .agents
            .get(&role)
            .expect("an Agent is spawned for every AgentRole in build()")
            .clone();
        let context = agent.build_context().await;
        let capability = default_capability(role);

        let cache_key = if self.config.cache_policy.enabled {
            Some(compute_cache_key(&CacheKeyInput {
                agent_role: role.to_string(),
                context_fingerprint: context.to_fingerprint(),
                capability_name: capability.to_string(),
            }))
        } else {
            None
        };

        let payload = match &cache_key {
            Some(key) => match self.cache.get(key) {
                Some(entry) => {
                    self.cache_hits.fetch_add(1, Ordering::SeqCst);
                    serde_json::from_value::<AgentOutputPayload>(entry.output)?
                }
                None => {
                    self.cache_misses.fetch_add(1, Ordering::SeqCst);
                    let payload = self.generate_with_timeout(stage, &agent, &context).await?;
                    self.cache.set(
                        key.clone(),
                        CacheEntry {
                            output: serde_json::to_value(&payload)?,
                            total_tokens: payload.total_tokens,
                            created_at: Utc::now(),
                        },
                    );
                    payload
                }
            },
            None => self.generate_with_timeout(stage, &agent, &context).await?,
        };

        self.total_tokens.fetch_add(payload.total_tokens as u64, Ordering::SeqCst);

        let task = Task::new(format!("{role} output for {stage}"), stage, role);
        let task_id = task.id;
        self.state.add_task(task).await;

        match timeout(self.config.timeout_per_stage, agent.apply_output(task_id, &payload)).await {
            Ok(result) => result,
            Err(_) => Err(CrucibleError::Timeout(format!(
                "{role} at {stage} exceeded timeout_per_stage applying output after the Generator already succeeded"
            ))),
        }
    }

    /// Bounds the Generator call (including its internal retries) to
    /// `config.timeout_per_stage`. An elapsed deadline here means the stage
    /// never got its output, so it is reported with the same `Timeout` kind
    /// `retry_on_errors` already treats as transient.
    async fn generate_with_timeout(
        &self,
        stage: WorkflowStage,
        agent: &Arc<Agent>,
        context: &AgentContext,
    ) -> CrucibleResult<AgentOutputPayload> {
        match timeout(self.config.timeout_per_stage, self.generate_with_retry(stage, agent, context)).await {
            Ok(result) => result,
            Err(_) => Err(CrucibleError::Timeout(format!("{stage} exceeded timeout_per_stage before producing output"))),
        }
    }

    /// Calls the Generator under `config.retry_policy`, recording one
    /// `ErrorRecord` per failed attempt (even attempts the retry controller
    /// goes on to recover from) so a run that eventually succeeds still
    /// surfaces its transient failures in progress events.
    async fn generate_with_retry(
        &self,
        stage: WorkflowStage,
        agent: &Arc<Agent>,
        context: &AgentContext,
    ) -> CrucibleResult<AgentOutputPayload> {
        let errors = &self.errors;
        retry_with_policy(
            &self.config.retry_policy,
            &self.sleep_fn,
            |attempt: &RetryAttempt| {
                if let Some(kind) = attempt.error_kind {
                    errors.lock().push(ErrorRecord {
                        stage,
                        kind,
                        message: format!("attempt {} failed with {:?}", attempt.attempt, kind),
                        occurred_at: Utc::now(),
                    });
                }
            },
            || agent.generate_output(context),
        )
        .await
    }

    async fn append_history(&self, entry: StageHistoryEntry) {
        self.stage_history.write().await.push(entry);
    }

    fn record_stage_duration(&self, stage: WorkflowStage, elapsed: Duration) {
        self.stage_durations.lock().insert(stage.to_string(), elapsed);
    }

    async fn record_error(&self, stage: WorkflowStage, err: &CrucibleError) {
        self.errors.lock().push(ErrorRecord {
            stage,
            kind: err.error_kind(),
            message: err.to_string(),
            occurred_at: Utc::now(),
        });
    }

    async fn broadcast_stage(&self, message_type: MessageType, stage: WorkflowStage) {
        let message =
            Message::new(message_type, Participant::Workflow, None).with_payload("stage", serde_json::json!(stage));
        self.bus.publish(message).await;
    }

    /// Writes a checkpoint under best-effort semantics: a write failure is
    /// logged and otherwise swallowed rather than failing the workflow,
    /// leaving the run "checkpoint-degraded" but still progressing.
    async fn checkpoint(&self, reason: &str) {
        if !self.config.checkpoint_policy.enabled {
            return;
        }
        let sequence = match self.checkpoint_store.next_sequence(self.state.id()).await {
            Ok(seq) => seq,
            Err(err) => {
                warn!(workflow_id = %self.state.id(), error = %err, "failed to determine next checkpoint sequence");
                return;
            }
        };
        let history = self.stage_history.read().await.clone();
        let snapshot = self.state.snapshot().await;
        let record = CheckpointRecord::new(sequence, snapshot.current_stage, history, snapshot, reason);
        if let Err(err) = self.checkpoint_store.write(&record, self.config.checkpoint_policy.retain_last).await {
            warn!(workflow_id = %self.state.id(), error = %err, "checkpoint write failed, continuing checkpoint-degraded");
        }
    }

    async fn persist_cache(&self) {
        if let Some(dir) = &self.config.cache_policy.cache_directory {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(dir = %dir.display(), error = %err, "failed to create result cache directory");
                return;
            }
            self.cache.persist(&dir.join("result_cache.json")).await;
        }
    }

    async fn emit(&self, event_type: ProgressEventType, stage: WorkflowStage) {
        let event = ProgressEvent {
            event_type,
            workflow_id: self.state.id(),
            current_stage: stage,
            percent_complete: crate::progress::percent_complete(stage, self.config.skip_ui_design),
            stage_history: self.stage_history.read().await.clone(),
            total_tokens: self.total_tokens.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            cache_misses: self.cache_misses.load(Ordering::SeqCst),
            errors: self.errors.lock().clone(),
            timestamp: Utc::now(),
        };
        self.metrics_sink.record(&event).await;
        self.event_sink.emit(event).await;
    }

    async fn summary(&self, outcome: WorkflowOutcome) -> WorkflowSummary {
        let cache_hits = self.cache_hits.load(Ordering::SeqCst);
        let cache_misses = self.cache_misses.load(Ordering::SeqCst);
        WorkflowSummary {
            outcome,
            total_tokens: self.total_tokens.load(Ordering::SeqCst),
            cache_hit_rate: WorkflowSummary::cache_hit_rate(cache_hits, cache_misses),
            cache_hits,
            cache_misses,
            stage_durations: self.stage_durations.lock().clone(),
            errors: self.errors.lock().clone(),
        }
    }

    async fn finalize_completed(&self) -> WorkflowSummary {
        self.checkpoint("workflow-complete").await;
        self.persist_cache().await;
        self.emit(ProgressEventType::Completed, WorkflowStage::Completed).await;
        self.summary(WorkflowOutcome::Completed).await
    }

    async fn finalize_failed(&self, err: &CrucibleError, stage: WorkflowStage) -> WorkflowSummary {
        self.record_error(stage, err).await;
        let _ = self.state.advance_stage(WorkflowStage::Failed, self.config.skip_ui_design).await;
        self.append_history(StageHistoryEntry::Stage(WorkflowStage::Failed)).await;
        self.checkpoint("stage-failed").await;
        self.persist_cache().await;
        self.emit(ProgressEventType::Failed, WorkflowStage::Failed).await;
        self.summary(WorkflowOutcome::Failed).await
    }

    /// `stage` is the last stage that was actually running when cancellation
    /// was observed; it is what the terminal `ProgressEvent` reports, even
    /// though `ProjectState` and the checkpoint it is taken from move to
    /// `FAILED` (the only terminal `ProjectState` has for an unsuccessful
    /// run) with `reason = "cancellation"`.
    async fn finalize_cancelled(&self, stage: WorkflowStage) -> WorkflowSummary {
        let _ = self.state.advance_stage(WorkflowStage::Failed, self.config.skip_ui_design).await;
        self.checkpoint("cancellation").await;
        self.persist_cache().await;
        self.broadcast_stage(MessageType::WorkflowCanceled, stage).await;
        self.emit(ProgressEventType::Canceled, stage).await;
        self.summary(WorkflowOutcome::Canceled).await
    }
}
