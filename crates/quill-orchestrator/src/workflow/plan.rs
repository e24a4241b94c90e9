//! Workflow planning: turning a classification and a worker selection into
//! an ordered set of stages.
//!
//! Stages run in order; invocations within a stage have disjoint context
//! dependencies and may run concurrently. The collaboration mode decides the
//! shape:
//!
//! - `Single`: one stage with the primary worker.
//! - `Sequential`: the primary drafts, each supporting worker refines in its
//!   own later stage.
//! - `Parallel`: primary and supporting workers cover disjoint parts
//!   concurrently in one stage.
//! - `Collaborative`: supporting workers produce material first, the primary
//!   synthesizes in a final stage.

use crate::selector::Selection;
use crate::task::{Classification, CollaborationMode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of an invocation within its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationRole {
    /// Carries the workflow's main output; failure fails the workflow.
    Primary,
    /// Enriches or refines; failure degrades but does not fail the workflow.
    Supporting,
}

impl fmt::Display for InvocationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationRole::Primary => write!(f, "primary"),
            InvocationRole::Supporting => write!(f, "supporting"),
        }
    }
}

/// One planned invocation, before any execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedInvocation {
    /// Invocation identifier.
    pub id: String,
    /// Worker bound to this invocation.
    pub worker_id: String,
    /// Role within the workflow.
    pub role: InvocationRole,
    /// Stage index this invocation runs in.
    pub stage: usize,
    /// Capability the invocation exercises (content-type tag).
    pub capability: String,
    /// Estimated units, used for approval and quota checks.
    pub estimated_units: u64,
    /// Whether workflow completion tolerates this invocation failing.
    pub optional: bool,
}

/// One stage of concurrent invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the workflow.
    pub index: usize,
    /// Invocations that run concurrently in this stage.
    pub invocations: Vec<PlannedInvocation>,
}

/// The full plan of invocations for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    /// Ordered stages.
    pub stages: Vec<Stage>,
}

impl WorkflowPlan {
    /// Builds a plan from a classification and a worker selection.
    #[must_use]
    pub fn build(classification: &Classification, selection: &Selection) -> Self {
        let capability = classification.content_type.capability_tag().to_string();
        let primary_units = classification.complexity.estimated_units();
        let supporting_units = primary_units / 2;

        let primary = |stage: usize| PlannedInvocation {
            id: format!("inv-{}", uuid::Uuid::new_v4()),
            worker_id: selection.primary.snapshot.id.clone(),
            role: InvocationRole::Primary,
            stage,
            capability: capability.clone(),
            estimated_units: primary_units,
            optional: false,
        };
        let supporting = |worker_id: &str, stage: usize| PlannedInvocation {
            id: format!("inv-{}", uuid::Uuid::new_v4()),
            worker_id: worker_id.to_string(),
            role: InvocationRole::Supporting,
            stage,
            capability: capability.clone(),
            estimated_units: supporting_units,
            optional: true,
        };

        let stages = match classification.collaboration_mode {
            CollaborationMode::Single => {
                vec![Stage { index: 0, invocations: vec![primary(0)] }]
            }
            CollaborationMode::Sequential => {
                let mut stages = vec![Stage { index: 0, invocations: vec![primary(0)] }];
                for (offset, worker) in selection.supporting.iter().enumerate() {
                    let index = offset + 1;
                    stages.push(Stage {
                        index,
                        invocations: vec![supporting(&worker.snapshot.id, index)],
                    });
                }
                stages
            }
            CollaborationMode::Parallel => {
                let mut invocations = vec![primary(0)];
                invocations.extend(
                    selection.supporting.iter().map(|worker| supporting(&worker.snapshot.id, 0)),
                );
                vec![Stage { index: 0, invocations }]
            }
            CollaborationMode::Collaborative => {
                if selection.supporting.is_empty() {
                    vec![Stage { index: 0, invocations: vec![primary(0)] }]
                } else {
                    let gather = Stage {
                        index: 0,
                        invocations: selection
                            .supporting
                            .iter()
                            .map(|worker| supporting(&worker.snapshot.id, 0))
                            .collect(),
                    };
                    let synthesize = Stage { index: 1, invocations: vec![primary(1)] };
                    vec![gather, synthesize]
                }
            }
        };

        Self { stages }
    }

    /// Total planned invocations.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.stages.iter().map(|s| s.invocations.len()).sum()
    }

    /// Iterates all planned invocations in stage order.
    pub fn iter_invocations(&self) -> impl Iterator<Item = &PlannedInvocation> {
        self.stages.iter().flat_map(|s| s.invocations.iter())
    }

    /// The primary invocation's estimated units (for submission pre-checks).
    #[must_use]
    pub fn primary_estimate(&self) -> Option<(String, u64)> {
        self.iter_invocations()
            .find(|inv| inv.role == InvocationRole::Primary)
            .map(|inv| (inv.worker_id.clone(), inv.estimated_units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerSnapshot;
    use crate::selector::ScoredWorker;
    use crate::task::{Complexity, ContentType};
    use std::collections::{BTreeSet, HashMap};

    fn scored(id: &str) -> ScoredWorker {
        ScoredWorker {
            snapshot: WorkerSnapshot {
                id: id.to_string(),
                description: String::new(),
                capabilities: BTreeSet::new(),
                load: 0,
                performance: HashMap::new(),
            },
            score: 0.8,
        }
    }

    fn selection(supporting: &[&str]) -> Selection {
        Selection {
            primary: scored("drafter"),
            supporting: supporting.iter().map(|id| scored(id)).collect(),
        }
    }

    fn classification(mode: CollaborationMode) -> Classification {
        Classification {
            content_type: ContentType::Article,
            complexity: Complexity::Medium,
            domain: "general".to_string(),
            collaboration_mode: mode,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_single_plan() {
        let plan = WorkflowPlan::build(&classification(CollaborationMode::Single), &selection(&[]));
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.invocation_count(), 1);
        let inv = &plan.stages[0].invocations[0];
        assert_eq!(inv.role, InvocationRole::Primary);
        assert!(!inv.optional);
        assert_eq!(inv.estimated_units, Complexity::Medium.estimated_units());
    }

    #[test]
    fn test_sequential_plan_orders_refinement_stages() {
        let plan = WorkflowPlan::build(
            &classification(CollaborationMode::Sequential),
            &selection(&["editor", "stylist"]),
        );
        assert_eq!(plan.stages.len(), 3);
        assert_eq!(plan.stages[0].invocations[0].worker_id, "drafter");
        assert_eq!(plan.stages[1].invocations[0].worker_id, "editor");
        assert_eq!(plan.stages[2].invocations[0].worker_id, "stylist");
        assert!(plan.stages[1].invocations[0].optional);
    }

    #[test]
    fn test_parallel_plan_is_one_stage() {
        let plan = WorkflowPlan::build(
            &classification(CollaborationMode::Parallel),
            &selection(&["fact-checker", "researcher"]),
        );
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].invocations.len(), 3);
    }

    #[test]
    fn test_collaborative_plan_synthesizes_last() {
        let plan = WorkflowPlan::build(
            &classification(CollaborationMode::Collaborative),
            &selection(&["researcher"]),
        );
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].invocations[0].role, InvocationRole::Supporting);
        assert_eq!(plan.stages[1].invocations[0].role, InvocationRole::Primary);

        // Without supporting workers it degenerates to a single stage.
        let solo = WorkflowPlan::build(
            &classification(CollaborationMode::Collaborative),
            &selection(&[]),
        );
        assert_eq!(solo.stages.len(), 1);
    }

    #[test]
    fn test_primary_estimate() {
        let plan = WorkflowPlan::build(
            &classification(CollaborationMode::Collaborative),
            &selection(&["researcher"]),
        );
        let (worker, units) = plan.primary_estimate().unwrap();
        assert_eq!(worker, "drafter");
        assert_eq!(units, Complexity::Medium.estimated_units());
    }
}
