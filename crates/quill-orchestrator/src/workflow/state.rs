//! Workflow and invocation state records.
//!
//! A `WorkflowState` is the single owner of everything mutable about one
//! workflow: its shared context, invocation records, status, and cancellation
//! token. Other components read it through snapshots.

use super::context::SharedContext;
use super::plan::{PlannedInvocation, WorkflowPlan};
use crate::task::{Classification, Task};
use quill_abstraction::UnitUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Status of one invocation (the latest attempt's view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Planned, not yet gated.
    Pending,
    /// Approval granted, not yet executing.
    Approved,
    /// Running against a provider.
    Executing,
    /// Finished successfully. Terminal.
    Succeeded,
    /// Failed (provider exhaustion, timeout, or expiry). Terminal.
    Failed,
    /// Approval denied. Terminal.
    Denied,
    /// Approval expired. Terminal.
    Expired,
    /// Cancelled with its workflow. Terminal.
    Cancelled,
}

impl InvocationStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Denied | Self::Expired | Self::Cancelled
        )
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// One execution attempt of an invocation. Failover never swaps a provider
/// mid-flight: each provider gets its own attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Provider the attempt was bound to.
    pub provider_id: String,
    /// Outcome of the attempt.
    pub status: InvocationStatus,
    /// Error rendering for failed attempts.
    pub error: Option<String>,
    /// Measured usage, when the provider reported it.
    pub usage: Option<UnitUsage>,
    /// Cost of the attempt in USD.
    pub cost: f64,
}

/// Full record of one invocation across its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// The plan entry this record executes.
    pub planned: PlannedInvocation,
    /// Latest status.
    pub status: InvocationStatus,
    /// Attempts in order.
    pub attempts: Vec<InvocationAttempt>,
    /// Approval request currently gating the invocation.
    pub approval_request_id: Option<String>,
    /// Specific failure reason for terminal failures.
    pub failure: Option<String>,
}

impl InvocationRecord {
    fn new(planned: PlannedInvocation) -> Self {
        Self {
            planned,
            status: InvocationStatus::Pending,
            attempts: Vec::new(),
            approval_request_id: None,
            failure: None,
        }
    }

    /// Units actually consumed across attempts so far.
    #[must_use]
    pub fn consumed_units(&self) -> u64 {
        self.attempts.iter().filter_map(|a| a.usage.map(|u| u.total_units())).sum()
    }

    /// Cost accrued across attempts so far.
    #[must_use]
    pub fn accrued_cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }
}

/// Terminal (or running) status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Executing or waiting on approvals.
    Running,
    /// Every required invocation succeeded and validation passed.
    Completed,
    /// The primary succeeded but non-critical supporting invocations failed.
    PartiallyCompleted,
    /// The primary invocation or validation failed.
    Failed,
    /// Explicit cancellation, or approval denial on a non-optional invocation.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Caller-facing status report for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    /// The workflow.
    pub workflow_id: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Structured failure reason for failed/cancelled workflows.
    pub failure: Option<String>,
    /// Outputs recorded so far, keyed by invocation.
    pub partial_outputs: Vec<(String, String)>,
    /// Per-invocation records.
    pub invocations: Vec<InvocationRecord>,
}

/// Mutable state of one running workflow.
pub struct WorkflowState {
    /// Workflow identifier.
    pub id: String,
    /// The task this workflow satisfies.
    pub task: Task,
    /// Subject the workflow is charged to.
    pub subject: String,
    /// Cached classification.
    pub classification: Classification,
    /// The execution plan.
    pub plan: WorkflowPlan,
    /// Cancellation token; cancelling propagates to every suspension point.
    pub cancel: CancellationToken,
    shared: Mutex<SharedContext>,
    invocations: Mutex<HashMap<String, InvocationRecord>>,
    status: Mutex<WorkflowStatus>,
    failure: Mutex<Option<String>>,
}

impl fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowState")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl WorkflowState {
    /// Creates the state for a freshly planned workflow.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        task: Task,
        subject: impl Into<String>,
        classification: Classification,
        plan: WorkflowPlan,
        seed_context: Option<String>,
    ) -> Self {
        let id = id.into();
        let mut shared = SharedContext::new(id.clone());
        if let Some(seed) = seed_context {
            shared = shared.with_seed(seed);
        }

        let invocations = plan
            .iter_invocations()
            .map(|planned| (planned.id.clone(), InvocationRecord::new(planned.clone())))
            .collect();

        Self {
            id,
            task,
            subject: subject.into(),
            classification,
            plan,
            cancel: CancellationToken::new(),
            shared: Mutex::new(shared),
            invocations: Mutex::new(invocations),
            status: Mutex::new(WorkflowStatus::Running),
            failure: Mutex::new(None),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets the status.
    pub fn set_status(&self, status: WorkflowStatus) {
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    /// Records the workflow-level failure reason (first writer wins, so the
    /// original cause is not overwritten by knock-on effects).
    pub fn set_failure(&self, reason: impl Into<String>) {
        let mut failure = self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(reason.into());
        }
    }

    /// The recorded failure reason, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Runs a closure against the shared context.
    pub fn with_shared<R>(&self, f: impl FnOnce(&mut SharedContext) -> R) -> R {
        let mut shared = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut shared)
    }

    /// Runs a closure against one invocation record.
    ///
    /// # Panics
    /// Never panics: unknown ids return `None`.
    pub fn with_invocation<R>(
        &self,
        invocation_id: &str,
        f: impl FnOnce(&mut InvocationRecord) -> R,
    ) -> Option<R> {
        let mut invocations =
            self.invocations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        invocations.get_mut(invocation_id).map(f)
    }

    /// Latest status of one invocation.
    #[must_use]
    pub fn invocation_status(&self, invocation_id: &str) -> Option<InvocationStatus> {
        let invocations =
            self.invocations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        invocations.get(invocation_id).map(|record| record.status)
    }

    /// Snapshot of all invocation records, in stage order.
    #[must_use]
    pub fn invocation_records(&self) -> Vec<InvocationRecord> {
        let invocations =
            self.invocations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut records: Vec<InvocationRecord> = invocations.values().cloned().collect();
        records.sort_by(|a, b| {
            a.planned.stage.cmp(&b.planned.stage).then_with(|| a.planned.id.cmp(&b.planned.id))
        });
        records
    }

    /// Caller-facing status report.
    #[must_use]
    pub fn report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id.clone(),
            status: self.status(),
            failure: self.failure(),
            partial_outputs: self.with_shared(|shared| shared.partial_outputs()),
            invocations: self.invocation_records(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerSnapshot;
    use crate::selector::{ScoredWorker, Selection};
    use crate::task::{CollaborationMode, Complexity, ContentType, DocumentScope};
    use std::collections::BTreeSet;

    fn state() -> WorkflowState {
        let classification = Classification {
            content_type: ContentType::Article,
            complexity: Complexity::Low,
            domain: "general".to_string(),
            collaboration_mode: CollaborationMode::Single,
            confidence: 0.9,
        };
        let selection = Selection {
            primary: ScoredWorker {
                snapshot: WorkerSnapshot {
                    id: "drafter".to_string(),
                    description: String::new(),
                    capabilities: BTreeSet::new(),
                    load: 0,
                    performance: HashMap::new(),
                },
                score: 0.9,
            },
            supporting: Vec::new(),
        };
        let plan = WorkflowPlan::build(&classification, &selection);
        let task = Task::new("t-1", "write", DocumentScope::new("doc/1"));
        WorkflowState::new("wf-1", task, "user-1", classification, plan, None)
    }

    #[test]
    fn test_initial_state() {
        let wf = state();
        assert_eq!(wf.status(), WorkflowStatus::Running);
        assert!(wf.failure().is_none());
        let records = wf.invocation_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InvocationStatus::Pending);
    }

    #[test]
    fn test_first_failure_reason_wins() {
        let wf = state();
        wf.set_failure("original cause");
        wf.set_failure("knock-on effect");
        assert_eq!(wf.failure().as_deref(), Some("original cause"));
    }

    #[test]
    fn test_consumed_units_across_attempts() {
        let wf = state();
        let inv_id = wf.invocation_records()[0].planned.id.clone();
        wf.with_invocation(&inv_id, |record| {
            record.attempts.push(InvocationAttempt {
                attempt: 1,
                provider_id: "a".to_string(),
                status: InvocationStatus::Failed,
                error: Some("unavailable".to_string()),
                usage: Some(UnitUsage::new(50, 0)),
                cost: 0.001,
            });
            record.attempts.push(InvocationAttempt {
                attempt: 2,
                provider_id: "b".to_string(),
                status: InvocationStatus::Succeeded,
                error: None,
                usage: Some(UnitUsage::new(100, 400)),
                cost: 0.01,
            });
        });

        let record = &wf.invocation_records()[0];
        assert_eq!(record.consumed_units(), 550);
        assert!((record.accrued_cost() - 0.011).abs() < 1e-9);
    }

    #[test]
    fn test_report_contains_partial_outputs() {
        let wf = state();
        wf.with_shared(|shared| {
            shared.record_output("inv-x", "drafter", super::super::plan::InvocationRole::Primary, 0, "draft text");
        });

        let report = wf.report();
        assert_eq!(report.partial_outputs.len(), 1);
        assert_eq!(report.partial_outputs[0].1, "draft text");
    }
}
