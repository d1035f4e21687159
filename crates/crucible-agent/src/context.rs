use std::collections::BTreeMap;

use crucible_core::WorkflowStage;
use crucible_state::{Bucket, ProjectState};
use serde::Serialize;

/// How many of the most recent decisions are folded into an agent's
/// context. Fixed rather than configurable, since varying it would change
/// cache fingerprints for reasons unrelated to actual project content.
const RECENT_DECISION_COUNT: usize = 5;

/// A deterministic summary of `ProjectState`, assembled by an Agent before
/// calling the Generator. `relevant_buckets` is a `BTreeMap` (rather than a
/// `HashMap`) specifically so its serialized form — and therefore any cache
/// fingerprint derived from it — never depends on insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct AgentContext {
    pub project_name: String,
    pub requirement_text: String,
    pub current_stage: WorkflowStage,
    pub relevant_buckets: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    pub recent_decisions: Vec<String>,
}

impl AgentContext {
    /// Builds a context snapshot for `buckets`, reading `state`.
    pub async fn build(state: &ProjectState, buckets: &[Bucket]) -> Self {
        let mut relevant_buckets = BTreeMap::new();
        for bucket in buckets {
            let name = bucket_name(*bucket);
            let contents: BTreeMap<String, serde_json::Value> =
                state.bucket_snapshot(*bucket).await.into_iter().collect();
            relevant_buckets.insert(name.to_string(), contents);
        }

        let recent_decisions = state
            .last_decisions(RECENT_DECISION_COUNT)
            .await
            .into_iter()
            .map(|d| format!("{} (by {}): {}", d.decision, d.made_by, d.rationale))
            .collect();

        Self {
            project_name: state.name().to_string(),
            requirement_text: state.requirement_text().to_string(),
            current_stage: state.current_stage().await,
            relevant_buckets,
            recent_decisions,
        }
    }

    /// Renders this context as a deterministic prompt body. Field order and
    /// bucket/key order are fixed by construction (`BTreeMap` everywhere),
    /// so two calls over unchanged state always render byte-identical text.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Project: {}\n", self.project_name));
        out.push_str(&format!("Requirement: {}\n", self.requirement_text));
        out.push_str(&format!("Current stage: {}\n", self.current_stage));
        for (bucket, entries) in &self.relevant_buckets {
            out.push_str(&format!("\n[{bucket}]\n"));
            for (key, value) in entries {
                out.push_str(&format!("{key}: {value}\n"));
            }
        }
        if !self.recent_decisions.is_empty() {
            out.push_str("\n[recent decisions]\n");
            for decision in &self.recent_decisions {
                out.push_str(&format!("- {decision}\n"));
            }
        }
        out
    }

    /// Canonical JSON form of this context, suitable as the `Orchestrator`'s
    /// context fingerprint input for the result cache. `serde_json::Value`
    /// object keys already sort on `PartialEq`/hash-independent comparison
    /// because every map here is a `BTreeMap`, so this needs no further
    /// canonicalization pass.
    pub fn to_fingerprint(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("AgentContext always serializes")
    }
}

fn bucket_name(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::Requirements => "requirements",
        Bucket::Architecture => "architecture",
        Bucket::Design => "design",
        Bucket::ImplementationPlan => "implementation_plan",
        Bucket::Metadata => "metadata",
    }
}
