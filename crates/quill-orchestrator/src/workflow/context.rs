// Shared execution context for one workflow
//
// The context accumulates intermediate worker outputs so later stages can
// build on earlier ones. It is exclusively owned by its workflow and never
// visible across workflows.

use super::plan::InvocationRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded worker output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Invocation that produced the output.
    pub invocation_id: String,
    /// Worker that produced it.
    pub worker_id: String,
    /// Role of the invocation.
    pub role: InvocationRole,
    /// Stage the invocation ran in.
    pub stage: usize,
    /// The output content.
    pub content: String,
    /// When the output was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Shared context for a workflow: seed material plus accumulated outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContext {
    /// Owning workflow.
    pub workflow_id: String,
    /// Document material the workflow started from.
    seed: Option<String>,
    /// Outputs recorded so far.
    entries: Vec<ContextEntry>,
}

impl SharedContext {
    /// Creates an empty context for a workflow.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self { workflow_id: workflow_id.into(), seed: None, entries: Vec::new() }
    }

    /// Seeds the context with document material.
    #[must_use]
    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    /// Records a worker output.
    pub fn record_output(
        &mut self,
        invocation_id: impl Into<String>,
        worker_id: impl Into<String>,
        role: InvocationRole,
        stage: usize,
        content: impl Into<String>,
    ) {
        self.entries.push(ContextEntry {
            invocation_id: invocation_id.into(),
            worker_id: worker_id.into(),
            role,
            stage,
            content: content.into(),
            recorded_at: Utc::now(),
        });
    }

    /// Material visible to a stage: the seed plus outputs of earlier stages.
    /// Outputs within the requesting stage are not visible (invocations in
    /// one stage have disjoint dependencies).
    #[must_use]
    pub fn excerpt_for_stage(&self, stage: usize) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(seed) = &self.seed {
            parts.push(seed);
        }

        let mut earlier: Vec<&ContextEntry> =
            self.entries.iter().filter(|e| e.stage < stage).collect();
        earlier.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.invocation_id.cmp(&b.invocation_id)));
        parts.extend(earlier.iter().map(|e| e.content.as_str()));

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Deterministic aggregation of all outputs: stage order, then
    /// invocation id, independent of completion order.
    #[must_use]
    pub fn combined_output(&self) -> String {
        let mut ordered: Vec<&ContextEntry> = self.entries.iter().collect();
        ordered.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.invocation_id.cmp(&b.invocation_id)));
        ordered.iter().map(|e| e.content.as_str()).collect::<Vec<_>>().join("\n\n")
    }

    /// The primary worker's final output, if recorded: the primary entry
    /// from the highest stage.
    #[must_use]
    pub fn primary_output(&self) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| e.role == InvocationRole::Primary)
            .max_by_key(|e| e.stage)
            .map(|e| e.content.as_str())
    }

    /// All outputs keyed by invocation, in deterministic order.
    #[must_use]
    pub fn partial_outputs(&self) -> Vec<(String, String)> {
        let mut ordered: Vec<&ContextEntry> = self.entries.iter().collect();
        ordered.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.invocation_id.cmp(&b.invocation_id)));
        ordered.iter().map(|e| (e.invocation_id.clone(), e.content.clone())).collect()
    }

    /// Number of recorded outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any output has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
