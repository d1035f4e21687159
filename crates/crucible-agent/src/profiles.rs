use std::collections::HashMap;
use std::sync::OnceLock;

use crucible_core::{AgentRole, WorkflowStage};
use crucible_state::Bucket;

/// One capability an agent exposes: a name plus a human-readable
/// description of its input/output shape. The core does not enforce these
/// schemas mechanically; they document the contract a host's richer
/// `Generator`-backed agent would validate against.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: &'static str,
    pub description: &'static str,
}

/// Per-role configuration: system prompt, capability set, the stages this
/// role is invoked for, which buckets it reads for context, and which
/// bucket/artifact key its output is written to.
#[derive(Debug, Clone)]
pub struct RoleProfile {
    pub role: AgentRole,
    pub system_prompt: &'static str,
    pub capabilities: Vec<Capability>,
    pub responsible_stages: Vec<WorkflowStage>,
    pub context_buckets: Vec<Bucket>,
    /// The artifact key this role's output is recorded under, keyed by the
    /// stage it was produced for (a role may be responsible for more than
    /// one stage in a host's extended profile, though the built-in seven
    /// are each single-stage).
    pub output_artifact_key: &'static str,
    /// The bucket and key this role's primary output is mirrored into,
    /// alongside the artifact, so downstream stages can read it as
    /// structured data rather than re-parsing the artifact blob.
    pub output_bucket: Bucket,
    pub output_bucket_key: &'static str,
}

fn capability(name: &'static str, description: &'static str) -> Capability {
    Capability { name, description }
}

fn build_profiles() -> HashMap<AgentRole, RoleProfile> {
    use AgentRole::*;
    use WorkflowStage::*;

    let mut profiles = HashMap::new();

    profiles.insert(
        ProjectManager,
        RoleProfile {
            role: ProjectManager,
            system_prompt: "You are the project manager. You track progress, \
                surface blockers, and relay client feedback to the team, but \
                you do not author stage artifacts yourself.",
            capabilities: vec![capability(
                "coordinate",
                "summarize workflow progress and outstanding blockers",
            )],
            responsible_stages: vec![],
            context_buckets: vec![Bucket::Metadata],
            output_artifact_key: "status_report",
            output_bucket: Bucket::Metadata,
            output_bucket_key: "status_report",
        },
    );

    profiles.insert(
        RequirementsAnalyst,
        RoleProfile {
            role: RequirementsAnalyst,
            system_prompt: "You are a requirements analyst. Turn the client's \
                initial requirement into a structured requirements document: \
                goals, scope, functional and non-functional requirements, \
                acceptance criteria.",
            capabilities: vec![capability(
                "analyze_requirements",
                "produce a structured requirements document from the initial requirement text",
            )],
            responsible_stages: vec![RequirementsAnalysis],
            context_buckets: vec![],
            output_artifact_key: "requirements_doc",
            output_bucket: Bucket::Requirements,
            output_bucket_key: "summary",
        },
    );

    profiles.insert(
        Architect,
        RoleProfile {
            role: Architect,
            system_prompt: "You are a software architect. Given the \
                requirements document, produce an architecture document: \
                component breakdown, data flow, technology choices, key \
                design decisions.",
            capabilities: vec![capability(
                "design_architecture",
                "produce an architecture document from the requirements document",
            )],
            responsible_stages: vec![ArchitectureDesign],
            context_buckets: vec![Bucket::Requirements],
            output_artifact_key: "architecture_doc",
            output_bucket: Bucket::Architecture,
            output_bucket_key: "summary",
        },
    );

    profiles.insert(
        UxuiDesigner,
        RoleProfile {
            role: UxuiDesigner,
            system_prompt: "You are a UI/UX designer. Given the requirements \
                and architecture documents, produce a design document: screen \
                inventory, interaction flows, and visual guidelines.",
            capabilities: vec![capability(
                "design_ui",
                "produce a UI/UX design document from the requirements and architecture documents",
            )],
            responsible_stages: vec![UiUxDesign],
            context_buckets: vec![Bucket::Requirements, Bucket::Architecture],
            output_artifact_key: "design_doc",
            output_bucket: Bucket::Design,
            output_bucket_key: "summary",
        },
    );

    profiles.insert(
        Developer,
        RoleProfile {
            role: Developer,
            system_prompt: "You are a software developer. Given the \
                requirements, architecture, and (if present) design \
                documents, produce the source code implementing them.",
            capabilities: vec![
                capability("implement", "produce source code from the upstream documents"),
                capability("repair", "revise source code to address a test failure or review finding"),
            ],
            responsible_stages: vec![Implementation],
            context_buckets: vec![
                Bucket::Requirements,
                Bucket::Architecture,
                Bucket::Design,
                Bucket::ImplementationPlan,
            ],
            output_artifact_key: "source_code",
            output_bucket: Bucket::ImplementationPlan,
            output_bucket_key: "source",
        },
    );

    profiles.insert(
        TestEngineer,
        RoleProfile {
            role: TestEngineer,
            system_prompt: "You are a test engineer. Given the source code, \
                write and evaluate a test suite, then report whether every \
                test passes.",
            capabilities: vec![capability(
                "run_tests",
                "evaluate the implementation and report pass/fail results",
            )],
            responsible_stages: vec![Testing],
            context_buckets: vec![Bucket::Requirements, Bucket::ImplementationPlan],
            output_artifact_key: "test_results",
            output_bucket: Bucket::ImplementationPlan,
            output_bucket_key: "test_results",
        },
    );

    profiles.insert(
        QualityExpert,
        RoleProfile {
            role: QualityExpert,
            system_prompt: "You are a quality assurance expert. Given the \
                source code and test results, review the implementation for \
                correctness, maintainability, and adherence to the \
                requirements, then approve or reject it.",
            capabilities: vec![capability(
                "review",
                "review the implementation and report approval status and issues",
            )],
            responsible_stages: vec![QualityAssurance],
            context_buckets: vec![Bucket::Requirements, Bucket::ImplementationPlan],
            output_artifact_key: "qa_report",
            output_bucket: Bucket::ImplementationPlan,
            output_bucket_key: "qa_results",
        },
    );

    profiles
}

/// Returns the process-wide profile table, built once on first access.
pub fn profiles() -> &'static HashMap<AgentRole, RoleProfile> {
    static PROFILES: OnceLock<HashMap<AgentRole, RoleProfile>> = OnceLock::new();
    PROFILES.get_or_init(build_profiles)
}

/// Looks up the profile for `role`.
///
/// # Panics
/// Panics if `role` is missing from the built-in table, which cannot happen
/// for any variant of the closed `AgentRole` enum since `build_profiles`
/// inserts all seven.
pub fn profile_for(role: AgentRole) -> &'static RoleProfile {
    profiles().get(&role).expect("every AgentRole variant has a built-in profile")
}
