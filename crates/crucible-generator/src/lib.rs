//! The `Generator` capability: the narrow text-generation interface the
//! orchestration core consumes from an external AI provider client.
//!
//! No concrete HTTP-backed provider ships here — that client is an
//! out-of-scope external collaborator. This crate defines the trait and
//! ships [`StubGenerator`], a deterministic test double keyed by
//! `(agent_role, stage)`, suitable for the orchestrator's own integration
//! tests and for a host application's tests.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use crucible_core::{AgentRole, CrucibleError, CrucibleResult, WorkflowStage};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

/// Generation parameters understood by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Upper bound on completion length, in tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling parameter.
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            top_p: 1.0,
        }
    }
}

/// The outcome of a non-streaming [`Generator::generate`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The generated text.
    pub content: String,
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens consumed by the completion.
    pub completion_tokens: u32,
    /// `prompt_tokens + completion_tokens`.
    pub total_tokens: u32,
}

/// A finite, non-restartable sequence of text chunks.
pub type GenerationStream = Pin<Box<dyn Stream<Item = CrucibleResult<String>> + Send>>;

/// The text-generation capability consumed by Agents.
///
/// `agent_role`/`stage` identify which Agent is calling and for which stage,
/// so a test double can key canned responses without parsing them back out
/// of the rendered prompt; a real provider-backed implementation is free to
/// ignore them and derive its behavior purely from `prompt`/`system_prompt`.
///
/// Implementations are expected to classify failures into the error
/// taxonomy's retryable-transient kinds (`Timeout`, `RateLimited`,
/// `NetworkError`) where applicable, so the retry controller can act on them.
#[async_trait]
pub trait Generator: Send + Sync {
    /// The provider name, used for cost-accounting attribution.
    fn provider_name(&self) -> &str;

    /// The model name, used for cost-accounting attribution.
    fn model_name(&self) -> &str;

    /// Generates text for a single prompt.
    async fn generate(
        &self,
        agent_role: AgentRole,
        stage: WorkflowStage,
        prompt: &str,
        system_prompt: Option<&str>,
        options: &GenerationOptions,
    ) -> CrucibleResult<GenerationResult>;

    /// Generates text as a lazy, finite sequence of chunks.
    async fn generate_stream(
        &self,
        agent_role: AgentRole,
        stage: WorkflowStage,
        prompt: &str,
        system_prompt: Option<&str>,
        options: &GenerationOptions,
    ) -> CrucibleResult<GenerationStream>;
}

/// A deterministic `Generator` test double.
///
/// Responses are looked up by `(agent_role, stage)`; a miss falls back to a
/// generic templated response so orchestrator integration tests don't need
/// to enumerate every role/stage pair. Can be configured to fail the first
/// `N` calls with a given error before succeeding, to drive retry tests.
pub struct StubGenerator {
    responses: Mutex<HashMap<(AgentRole, WorkflowStage), String>>,
    fail_before_success: Mutex<Vec<CrucibleError>>,
    calls: AtomicU64,
}

impl StubGenerator {
    /// Creates a stub with no canned responses (falls back to the generic
    /// template for every call) and no injected failures.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            fail_before_success: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Registers a canned response for `(role, stage)`.
    pub fn with_response(
        self,
        role: AgentRole,
        stage: WorkflowStage,
        content: impl Into<String>,
    ) -> Self {
        self.responses
            .lock()
            .expect("stub generator mutex poisoned")
            .insert((role, stage), content.into());
        self
    }

    /// Queues errors to return, in order, before any subsequent call
    /// succeeds. Used to drive deterministic retry-exhaustion and
    /// retry-recovery tests.
    pub fn with_injected_failures(self, errors: Vec<CrucibleError>) -> Self {
        *self.fail_before_success.lock().expect("stub generator mutex poisoned") = errors;
        self
    }

    /// Number of `generate` calls made so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn response_for(&self, role: AgentRole, stage: WorkflowStage) -> String {
        self.responses
            .lock()
            .expect("stub generator mutex poisoned")
            .get(&(role, stage))
            .cloned()
            .unwrap_or_else(|| format!("stub output for {role} at {stage}"))
    }

    fn next_injected_failure(&self) -> Option<CrucibleError> {
        let mut queue = self.fail_before_success.lock().expect("stub generator mutex poisoned");
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for StubGenerator {
    fn provider_name(&self) -> &str {
        "stub"
    }

    fn model_name(&self) -> &str {
        "stub-1"
    }

    async fn generate(
        &self,
        agent_role: AgentRole,
        stage: WorkflowStage,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _options: &GenerationOptions,
    ) -> CrucibleResult<GenerationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_injected_failure() {
            return Err(err);
        }
        let content = self.response_for(agent_role, stage);
        let prompt_tokens = 32;
        let completion_tokens = (content.len() / 4).max(1) as u32;
        Ok(GenerationResult {
            total_tokens: prompt_tokens + completion_tokens,
            content,
            prompt_tokens,
            completion_tokens,
        })
    }

    async fn generate_stream(
        &self,
        agent_role: AgentRole,
        stage: WorkflowStage,
        prompt: &str,
        system_prompt: Option<&str>,
        options: &GenerationOptions,
    ) -> CrucibleResult<GenerationStream> {
        let result = self.generate(agent_role, stage, prompt, system_prompt, options).await?;
        let chunks: Vec<CrucibleResult<String>> = result
            .content
            .split_whitespace()
            .map(|w| Ok(format!("{w} ")))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn returns_canned_response_for_role_and_stage() {
        let stub = StubGenerator::new().with_response(
            AgentRole::Architect,
            WorkflowStage::ArchitectureDesign,
            "the architecture doc",
        );
        let result = stub
            .generate(
                AgentRole::Architect,
                WorkflowStage::ArchitectureDesign,
                "irrelevant prompt",
                None,
                &GenerationOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.content, "the architecture doc");
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_generic_template_on_miss() {
        let stub = StubGenerator::new();
        let result = stub
            .generate(
                AgentRole::Developer,
                WorkflowStage::Implementation,
                "irrelevant prompt",
                None,
                &GenerationOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.content.contains("DEVELOPER"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let stub = StubGenerator::new().with_injected_failures(vec![
            CrucibleError::Timeout("1".into()),
            CrucibleError::Timeout("2".into()),
        ]);
        let opts = GenerationOptions::default();
        let first = stub
            .generate(AgentRole::Developer, WorkflowStage::Implementation, "p", None, &opts)
            .await;
        let second = stub
            .generate(AgentRole::Developer, WorkflowStage::Implementation, "p", None, &opts)
            .await;
        let third = stub
            .generate(AgentRole::Developer, WorkflowStage::Implementation, "p", None, &opts)
            .await;
        assert!(first.is_err());
        assert!(second.is_err());
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn generate_stream_yields_chunks() {
        let stub = StubGenerator::new();
        let mut stream = stub
            .generate_stream(
                AgentRole::Developer,
                WorkflowStage::Implementation,
                "hello world",
                None,
                &GenerationOptions::default(),
            )
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert!(!chunks.is_empty());
    }
}
