use std::time::Duration;

use crucible_cache::CachePolicy;
use crucible_checkpoint::CheckpointPolicy;
use crucible_core::WorkflowId;
use crucible_retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// How the Orchestrator dispatches the Agents responsible for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    /// Invoke responsible Agents one at a time, in `ALL_ROLES` order.
    Sequential,
    /// Invoke responsible Agents concurrently, bounded by `max_parallel_agents`.
    Parallel,
    /// Per stage, pick `Sequential` if more than one Agent is responsible and
    /// any two of them share an output bucket (a conflicting region),
    /// `Parallel` otherwise.
    Adaptive,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::Sequential
    }
}

fn default_max_iterations() -> u32 {
    3
}

fn default_timeout_per_stage() -> Duration {
    Duration::from_secs(300)
}

fn default_max_parallel_agents() -> usize {
    4
}

fn default_project_name() -> String {
    "untitled".to_string()
}

/// Top-level configuration for one workflow run.
///
/// `project_id`, `requirements`, and `output_directory` identify the
/// workflow and have no default; everything else is `#[serde(default)]` so
/// a host's TOML only needs to override what it cares about, mirroring how
/// `RetryPolicy`/`CheckpointPolicy`/`CachePolicy` are themselves loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub project_id: WorkflowId,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    pub requirements: String,
    pub output_directory: std::path::PathBuf,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub skip_ui_design: bool,
    #[serde(default = "default_timeout_per_stage")]
    pub timeout_per_stage: Duration,
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
}

impl OrchestratorConfig {
    /// Builds a config with every non-identity field at its documented
    /// default.
    pub fn new(
        project_id: WorkflowId,
        project_name: impl Into<String>,
        requirements: impl Into<String>,
        output_directory: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            project_id,
            project_name: project_name.into(),
            requirements: requirements.into(),
            output_directory: output_directory.into(),
            execution_strategy: ExecutionStrategy::default(),
            max_iterations: default_max_iterations(),
            skip_ui_design: false,
            timeout_per_stage: default_timeout_per_stage(),
            max_parallel_agents: default_max_parallel_agents(),
            retry_policy: RetryPolicy::default(),
            cache_policy: CachePolicy::default(),
            checkpoint_policy: CheckpointPolicy::default(),
        }
    }

    /// Builds a config from a [`crate::ProjectDescriptor`] loaded through a
    /// [`crate::ProjectRepository`], at documented defaults for everything
    /// the descriptor doesn't carry. `llm_config` is not consulted here: it
    /// is the host's input for assembling the `Generator` it passes to
    /// `WorkflowOrchestrator::new` alongside this config.
    pub fn from_descriptor(descriptor: crate::ProjectDescriptor) -> Self {
        Self::new(descriptor.id, descriptor.name, descriptor.requirements, descriptor.output_directory)
    }

    /// Parses a config from TOML text, the same way model/provider
    /// configuration is loaded elsewhere in this ecosystem.
    pub fn from_toml_str(text: &str) -> crucible_core::CrucibleResult<Self> {
        toml::from_str(text)
            .map_err(|e| crucible_core::CrucibleError::ConfigurationError(e.to_string()))
    }

    /// Validates the configuration before a workflow is allowed to start.
    pub fn validate(&self) -> crucible_core::CrucibleResult<()> {
        if self.requirements.trim().is_empty() {
            return Err(crucible_core::CrucibleError::ConfigurationError(
                "requirements must not be empty".to_string(),
            ));
        }
        if self.max_parallel_agents == 0 {
            return Err(crucible_core::CrucibleError::ConfigurationError(
                "max_parallel_agents must be at least 1".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(crucible_core::CrucibleError::ConfigurationError(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::new(crucible_core::new_id(), "demo", "reverse stdin", "out");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.max_parallel_agents, 4);
        assert_eq!(config.timeout_per_stage, Duration::from_secs(300));
        assert!(!config.skip_ui_design);
        assert_eq!(config.execution_strategy, ExecutionStrategy::Sequential);
    }

    #[test]
    fn from_toml_only_requires_identity_fields() {
        let toml = r#"
            project_id = "4d1a6f1e-8b8b-4b0b-8b0b-4b0b8b0b8b0b"
            requirements = "Build a CLI that reverses its standard input."
            output_directory = "out"
        "#;
        let config = OrchestratorConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.project_name, "untitled");
    }

    #[test]
    fn from_descriptor_carries_through_identity_fields() {
        let id = crucible_core::new_id();
        let descriptor = crate::ProjectDescriptor {
            id,
            name: "demo".to_string(),
            requirements: "reverse stdin".to_string(),
            llm_config: serde_json::json!({"provider": "stub"}),
            output_directory: "out".into(),
        };
        let config = OrchestratorConfig::from_descriptor(descriptor);
        assert_eq!(config.project_id, id);
        assert_eq!(config.project_name, "demo");
        assert_eq!(config.max_iterations, 3);
    }

    #[test]
    fn validate_rejects_empty_requirements() {
        let config = OrchestratorConfig::new(crucible_core::new_id(), "demo", "   ", "out");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_parallel_agents() {
        let mut config = OrchestratorConfig::new(crucible_core::new_id(), "demo", "reverse stdin", "out");
        config.max_parallel_agents = 0;
        assert!(config.validate().is_err());
    }
}
