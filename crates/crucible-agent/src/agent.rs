use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crucible_bus::{Message, MessageBus, MessageType, Participant, Selector, Subscriber};
use crucible_core::{AgentRole, CrucibleError, CrucibleResult, TaskId, WorkflowStage};
use crucible_generator::{GenerationOptions, Generator};
use crucible_state::{ArtifactValue, Bucket, ProjectState, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::AgentContext;
use crate::profiles::RoleProfile;

/// The generator-produced output of one agent invocation, in a form that
/// can be cached and later replayed into `ProjectState` exactly as if it
/// had been freshly produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub content: String,
    pub total_tokens: u32,
    pub artifact_key: String,
    pub artifact_value: ArtifactValue,
    pub bucket: Bucket,
    pub bucket_key: String,
    pub bucket_value: serde_json::Value,
    pub decision_rationale: Option<String>,
}

/// A role-tagged participant on the bus. One `Agent` instance exists per
/// `AgentRole`; its behavior is entirely data-driven by its
/// [`RoleProfile`], following a "one struct, N profile constants" pattern.
pub struct Agent {
    role: AgentRole,
    profile: &'static RoleProfile,
    bus: Arc<MessageBus>,
    state: Arc<ProjectState>,
    generator: Arc<dyn Generator>,
    total_tokens: AtomicU64,
    requests_count: AtomicU32,
}

impl Agent {
    /// Constructs and registers an `Agent`, subscribing it to
    /// `receiver:<role>` and `type:STAGE_START` as required by the
    /// component contract. Returns the shared handle the orchestrator holds
    /// to invoke directly (bus delivery covers passive/observational
    /// dispatch; the orchestrator calls methods on this handle directly to
    /// await results under cache/retry control).
    pub async fn spawn(
        role: AgentRole,
        bus: Arc<MessageBus>,
        state: Arc<ProjectState>,
        generator: Arc<dyn Generator>,
    ) -> Arc<Self> {
        let agent = Arc::new(Self {
            role,
            profile: crate::profiles::profile_for(role),
            bus: bus.clone(),
            state,
            generator,
            total_tokens: AtomicU64::new(0),
            requests_count: AtomicU32::new(0),
        });

        bus.subscribe(Selector::Receiver(role), agent.clone() as Arc<dyn Subscriber>).await;
        bus.subscribe(Selector::Type(MessageType::StageStart), agent.clone() as Arc<dyn Subscriber>).await;

        agent
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn profile(&self) -> &'static RoleProfile {
        self.profile
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::SeqCst)
    }

    pub fn requests_count(&self) -> u32 {
        self.requests_count.load(Ordering::SeqCst)
    }

    /// Assembles this role's deterministic context from `ProjectState`.
    /// Exposed so the Orchestrator can derive the same context to compute a
    /// cache fingerprint before deciding whether to invoke this agent at
    /// all.
    pub async fn build_context(&self) -> AgentContext {
        AgentContext::build(&self.state, &self.profile.context_buckets).await
    }

    /// Calls the Generator over `context`'s rendered prompt, updates token
    /// counters, and packages the result as a cacheable, replayable
    /// [`AgentOutputPayload`]. Performs no `ProjectState` writes; pair with
    /// [`Agent::apply_output`] to commit it, or let the Orchestrator cache
    /// the payload first.
    pub async fn generate_output(&self, context: &AgentContext) -> CrucibleResult<AgentOutputPayload> {
        let prompt = context.to_prompt();
        let result = self
            .generator
            .generate(
                self.role,
                context.current_stage,
                &prompt,
                Some(self.profile.system_prompt),
                &GenerationOptions::default(),
            )
            .await?;

        self.total_tokens.fetch_add(result.total_tokens as u64, Ordering::SeqCst);
        self.requests_count.fetch_add(1, Ordering::SeqCst);

        Ok(self.package_output(result.content, result.total_tokens))
    }

    fn package_output(&self, content: String, total_tokens: u32) -> AgentOutputPayload {
        let bucket_value = match self.role {
            AgentRole::TestEngineer => test_results_value(&content),
            AgentRole::QualityExpert => qa_results_value(&content),
            _ => serde_json::json!(content),
        };

        AgentOutputPayload {
            artifact_key: self.profile.output_artifact_key.to_string(),
            artifact_value: ArtifactValue::Inline(serde_json::json!(content)),
            bucket: self.profile.output_bucket,
            bucket_key: self.profile.output_bucket_key.to_string(),
            bucket_value,
            decision_rationale: Some(format!("produced by {}", self.role)),
            total_tokens,
            content,
        }
    }

    /// Writes `output` into `ProjectState`: the artifact, the mirrored
    /// bucket key, and a decision entry, then marks `task_id` `Completed`
    /// and publishes `TASK_COMPLETE`. Used identically whether `output` was
    /// just generated or replayed from a cache hit, satisfying "the cached
    /// output is written into Project State exactly as if it had been
    /// freshly produced."
    pub async fn apply_output(&self, task_id: TaskId, output: &AgentOutputPayload) -> CrucibleResult<()> {
        self.state.add_artifact(output.artifact_key.clone(), output.artifact_value.clone()).await;
        self.state.set_bucket_value(output.bucket, output.bucket_key.clone(), output.bucket_value.clone()).await;
        if let Some(rationale) = &output.decision_rationale {
            self.state
                .add_decision(format!("produced {}", output.artifact_key), self.role, rationale.clone())
                .await;
        }
        self.state
            .update_task(task_id, |task| {
                task.add_artifact_key(output.artifact_key.clone());
                task.set_status(TaskStatus::Completed);
            })
            .await;

        let message = Message::new(MessageType::TaskComplete, Participant::Agent(self.role), None)
            .with_payload("task_id", serde_json::json!(task_id))
            .with_payload("artifact_key", serde_json::json!(output.artifact_key));
        self.bus.publish(message).await;
        Ok(())
    }

    /// Handles an `AGENT_REQUEST` addressed to this role: generates a
    /// response and replies with `AGENT_RESPONSE`. Errors are converted to
    /// an error-status `AGENT_RESPONSE` rather than propagated, per the
    /// component's error policy.
    pub async fn process_request(&self, message: &Message) -> CrucibleResult<()> {
        let context = self.build_context().await;
        let result = self
            .generator
            .generate(
                self.role,
                context.current_stage,
                &context.to_prompt(),
                Some(self.profile.system_prompt),
                &GenerationOptions::default(),
            )
            .await;

        match result {
            Ok(generation) => {
                self.total_tokens.fetch_add(generation.total_tokens as u64, Ordering::SeqCst);
                self.requests_count.fetch_add(1, Ordering::SeqCst);
                let response = Message::new(MessageType::AgentResponse, Participant::Agent(self.role), sender_role(message))
                    .with_correlation_id(message.correlation_id)
                    .with_payload("status", serde_json::json!("ok"))
                    .with_payload("content", serde_json::json!(generation.content));
                self.bus.publish(response).await;
                Ok(())
            }
            Err(err) => {
                self.respond_with_error(message, &err).await;
                Err(err)
            }
        }
    }

    /// Handles a `TASK_ASSIGNED` message addressed to this role end to end:
    /// marks the task `InProgress`, generates output, applies it, marks it
    /// `Completed`. This is the bus-driven path; the orchestrator's
    /// synchronous, cache/retry-wrapped dispatch calls `generate_output`/
    /// `apply_output` directly instead so it can interpose the cache.
    pub async fn handle_task_assignment(&self, message: &Message) -> CrucibleResult<()> {
        let task_id: TaskId = message
            .payload
            .get("task_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| CrucibleError::InvalidRequest("TASK_ASSIGNED missing task_id".into()))?;

        self.state.update_task(task_id, |task| task.set_status(TaskStatus::InProgress)).await;

        let context = self.build_context().await;
        let output = self.generate_output(&context).await?;
        self.apply_output(task_id, &output).await
    }

    /// Appends user-supplied feedback to `ProjectState`.
    pub async fn handle_user_feedback(&self, message: &Message) -> CrucibleResult<()> {
        let text = message
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CrucibleError::InvalidRequest("USER_FEEDBACK missing text".into()))?;
        let stage = self.state.current_stage().await;
        self.state.add_client_feedback(text, stage).await;
        Ok(())
    }

    /// Invoked for each stage in this role's `responsible_stages`. The
    /// built-in roles take no proactive action beyond logging; a host may
    /// override behavior by wrapping `Agent` or reacting to the
    /// `STAGE_START` broadcast independently.
    pub async fn on_stage_start(&self, stage: WorkflowStage) {
        info!(role = %self.role, stage = %stage, "agent notified of stage start");
    }

    async fn respond_with_error(&self, original: &Message, err: &CrucibleError) {
        error!(role = %self.role, error = %err, "agent handler failed");
        let response = Message::new(MessageType::AgentResponse, Participant::Agent(self.role), sender_role(original))
            .with_correlation_id(original.correlation_id)
            .with_payload("status", serde_json::json!("error"))
            .with_payload("error", serde_json::json!(err.to_string()));
        self.bus.publish(response).await;
    }
}

fn sender_role(message: &Message) -> Option<AgentRole> {
    match message.sender {
        Participant::Agent(role) => Some(role),
        _ => None,
    }
}

fn test_results_value(content: &str) -> serde_json::Value {
    let all_passed = !content.to_lowercase().contains("fail");
    serde_json::json!({ "all_passed": all_passed, "failures": if all_passed { 0 } else { 1 } })
}

fn qa_results_value(content: &str) -> serde_json::Value {
    let lower = content.to_lowercase();
    let approved = !lower.contains("reject") && !lower.contains("issue");
    let issues: Vec<String> = if approved { vec![] } else { vec![content.to_string()] };
    serde_json::json!({ "approved": approved, "issues": issues })
}

#[async_trait]
impl Subscriber for Agent {
    async fn handle(&self, message: Message) -> Result<(), String> {
        let result = match message.message_type {
            MessageType::AgentRequest => self.process_request(&message).await,
            MessageType::TaskAssigned => self.handle_task_assignment(&message).await,
            MessageType::UserFeedback => self.handle_user_feedback(&message).await,
            MessageType::StageStart => {
                if let Some(stage) = message
                    .payload
                    .get("stage")
                    .and_then(|v| serde_json::from_value::<WorkflowStage>(v.clone()).ok())
                {
                    if self.profile.responsible_stages.contains(&stage) {
                        self.on_stage_start(stage).await;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(err) = &result {
            warn!(role = %self.role, message_type = %message.message_type, error = %err, "agent message handler failed, already converted to AGENT_RESPONSE");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::new_id;
    use crucible_generator::StubGenerator;

    async fn new_agent(role: AgentRole) -> (Arc<Agent>, Arc<ProjectState>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        let state = Arc::new(ProjectState::new(new_id(), "demo", "reverse stdin"));
        let generator: Arc<dyn Generator> = Arc::new(StubGenerator::new());
        let agent = Agent::spawn(role, bus.clone(), state.clone(), generator).await;
        (agent, state, bus)
    }

    #[tokio::test]
    async fn generate_and_apply_output_writes_artifact_and_completes_task() {
        let (agent, state, _bus) = new_agent(AgentRole::RequirementsAnalyst).await;
        let task = crucible_state::Task::new("analyze requirements", WorkflowStage::RequirementsAnalysis, agent.role());
        let task_id = task.id;
        state.add_task(task).await;

        let context = agent.build_context().await;
        let output = agent.generate_output(&context).await.unwrap();
        agent.apply_output(task_id, &output).await.unwrap();

        assert!(state.get_artifact("requirements_doc").await.is_some());
        let task = state.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.artifact_keys.contains(&"requirements_doc".to_string()));
    }

    #[tokio::test]
    async fn test_engineer_reports_all_passed_by_default() {
        let (agent, _state, _bus) = new_agent(AgentRole::TestEngineer).await;
        let context = agent.build_context().await;
        let output = agent.generate_output(&context).await.unwrap();
        assert_eq!(output.bucket_value["all_passed"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_engineer_reports_failure_when_stub_says_fail() {
        let bus = Arc::new(MessageBus::new());
        let state = Arc::new(ProjectState::new(new_id(), "demo", "reverse stdin"));
        let generator: Arc<dyn Generator> = Arc::new(
            StubGenerator::new().with_response(AgentRole::TestEngineer, WorkflowStage::Testing, "2 tests FAIL"),
        );
        let agent = Agent::spawn(AgentRole::TestEngineer, bus, state, generator).await;
        let context = agent.build_context().await;
        let output = agent.generate_output(&context).await.unwrap();
        assert_eq!(output.bucket_value["all_passed"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn handle_user_feedback_appends_to_state() {
        let (agent, state, _bus) = new_agent(AgentRole::ProjectManager).await;
        let message = Message::new(MessageType::UserFeedback, Participant::User, Some(AgentRole::ProjectManager))
            .with_payload("text", serde_json::json!("please add dark mode"));
        agent.handle_user_feedback(&message).await.unwrap();
        let feedback = state.client_feedback().await;
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].text, "please add dark mode");
    }
}
