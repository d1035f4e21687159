use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::ErrorRecord;

/// The terminal disposition of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed,
    Failed,
    Canceled,
}

/// Accounting totals emitted alongside the terminal [`WorkflowOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub outcome: WorkflowOutcome,
    pub total_tokens: u64,
    /// `cache_hits / (cache_hits + cache_misses)`, or `0.0` if no agent was
    /// ever invoked.
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Wall-clock time spent in each ordinary stage that was entered.
    pub stage_durations: HashMap<String, Duration>,
    pub errors: Vec<ErrorRecord>,
}

impl WorkflowSummary {
    pub fn cache_hit_rate(cache_hits: u64, cache_misses: u64) -> f64 {
        let total = cache_hits + cache_misses;
        if total == 0 {
            0.0
        } else {
            cache_hits as f64 / total as f64
        }
    }
}
