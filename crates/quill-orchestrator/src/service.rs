//! Orchestration service facade.
//!
//! This is the surface exposed to collaborators: submit a task, poll a
//! workflow, resolve an approval, cancel a workflow. Submission runs the
//! classify → select → pre-check pipeline before anything executes, so
//! oversized or unservable tasks are rejected before any provider call.

use crate::classifier::{ClassifierBackend, TaskClassifier};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::events::{EventBus, WorkflowEvent};
use crate::ledger::{LedgerEntry, LedgerEvent, UsageLedger};
use crate::permission::{ApprovalDecision, PermissionManager};
use crate::registry::WorkerRegistry;
use crate::routing::{ProviderRouter, RouteRequest};
use crate::selector::WorkerSelector;
use crate::task::{Task, TaskId};
use crate::workflow::{
    AcceptAllValidator, WorkflowEngine, WorkflowPlan, WorkflowState, WorkflowStatusReport,
};
use quill_abstraction::{
    ContextSource, MetricsSink, NotificationSink, OutputValidator, SubjectResolver,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Response code classifying a service outcome, for callers that need a
/// stable discriminator rather than an error rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// The request was accepted.
    Accepted,
    /// The input was malformed or unclassifiable.
    RejectedInvalidInput,
    /// A grant quota would be exceeded.
    RejectedQuotaExceeded,
    /// No worker met the selection threshold.
    RejectedNoQualifiedWorker,
    /// A referenced resource does not exist.
    RejectedNotFound,
    /// The referenced resource is not in a state that allows the operation.
    RejectedWrongState,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::RejectedInvalidInput => "rejected-invalid-input",
            Self::RejectedQuotaExceeded => "rejected-quota-exceeded",
            Self::RejectedNoQualifiedWorker => "rejected-no-qualified-worker",
            Self::RejectedNotFound => "rejected-not-found",
            Self::RejectedWrongState => "rejected-wrong-state",
        };
        write!(f, "{}", name)
    }
}

impl ResponseCode {
    /// Classifies an orchestration error.
    #[must_use]
    pub fn from_error(err: &OrchestrationError) -> Self {
        use crate::permission::PermissionError;
        match err {
            OrchestrationError::QuotaExceeded { .. } => Self::RejectedQuotaExceeded,
            OrchestrationError::NoQualifiedWorker { .. } => Self::RejectedNoQualifiedWorker,
            OrchestrationError::NotFound { .. } => Self::RejectedNotFound,
            OrchestrationError::Permission(PermissionError::WrongState { .. }) => {
                Self::RejectedWrongState
            }
            OrchestrationError::Permission(PermissionError::QuotaExceeded { .. }) => {
                Self::RejectedQuotaExceeded
            }
            _ => Self::RejectedInvalidInput,
        }
    }
}

/// Builder wiring the service's collaborators before first use.
pub struct ServiceBuilder {
    config: OrchestratorConfig,
    classifier_backend: Option<Arc<dyn ClassifierBackend>>,
    validator: Arc<dyn OutputValidator>,
    context_source: Option<Arc<dyn ContextSource>>,
    notification_sink: Option<Arc<dyn NotificationSink>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    subject_resolver: Option<Arc<dyn SubjectResolver>>,
}

impl ServiceBuilder {
    /// Attaches a classification backend (a language-model classifier).
    #[must_use]
    pub fn with_classifier_backend(mut self, backend: Arc<dyn ClassifierBackend>) -> Self {
        self.classifier_backend = Some(backend);
        self
    }

    /// Replaces the output validator (defaults to accept-all).
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Attaches the document context source collaborator.
    #[must_use]
    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_source = Some(source);
        self
    }

    /// Attaches the approval notification sink collaborator.
    #[must_use]
    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notification_sink = Some(sink);
        self
    }

    /// Attaches the telemetry sink collaborator (best effort, never on the
    /// approval or execution critical path).
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Attaches the identity collaborator used by token-based submission.
    #[must_use]
    pub fn with_subject_resolver(mut self, resolver: Arc<dyn SubjectResolver>) -> Self {
        self.subject_resolver = Some(resolver);
        self
    }

    /// Builds the service.
    #[must_use]
    pub fn build(self) -> OrchestrationService {
        let ledger = Arc::new(UsageLedger::new());
        let registry = Arc::new(WorkerRegistry::with_alpha(self.config.registry.performance_alpha));
        let router = Arc::new(ProviderRouter::new(self.config.router.clone()));
        let permissions =
            Arc::new(PermissionManager::new(Arc::clone(&ledger), &self.config.approval));
        let events = EventBus::default();

        if let Some(sink) = self.notification_sink {
            events.forward_approvals(sink);
        }
        if let Some(sink) = self.metrics_sink {
            events.forward_metrics(sink);
        }

        let mut classifier = TaskClassifier::new(self.config.classifier.clone());
        if let Some(backend) = self.classifier_backend {
            classifier = classifier.with_backend(backend);
        }

        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&permissions),
            Arc::clone(&ledger),
            events.clone(),
            self.validator,
            self.config.engine.clone(),
        ));

        OrchestrationService {
            classifier: Arc::new(classifier),
            selector: WorkerSelector::new(Arc::clone(&registry), self.config.selector.clone()),
            registry,
            router,
            permissions,
            ledger,
            engine,
            events,
            context_source: self.context_source,
            subject_resolver: self.subject_resolver,
            workflows: Mutex::new(HashMap::new()),
            task_index: Mutex::new(HashMap::new()),
        }
    }
}

/// The orchestration core's public facade.
pub struct OrchestrationService {
    classifier: Arc<TaskClassifier>,
    selector: WorkerSelector,
    registry: Arc<WorkerRegistry>,
    router: Arc<ProviderRouter>,
    permissions: Arc<PermissionManager>,
    ledger: Arc<UsageLedger>,
    engine: Arc<WorkflowEngine>,
    events: EventBus,
    context_source: Option<Arc<dyn ContextSource>>,
    subject_resolver: Option<Arc<dyn SubjectResolver>>,
    workflows: Mutex<HashMap<String, Arc<WorkflowState>>>,
    task_index: Mutex<HashMap<TaskId, String>>,
}

impl fmt::Debug for OrchestrationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationService")
            .field(
                "workflow_count",
                &self.workflows.lock().map(|w| w.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl OrchestrationService {
    /// Starts a builder with the given configuration.
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> ServiceBuilder {
        ServiceBuilder {
            config,
            classifier_backend: None,
            validator: Arc::new(AcceptAllValidator),
            context_source: None,
            notification_sink: None,
            metrics_sink: None,
            subject_resolver: None,
        }
    }

    /// Submits a task for a subject. Idempotent per external task id: a
    /// resubmission returns the original workflow id without creating a
    /// duplicate workflow.
    ///
    /// # Errors
    /// Returns `InvalidInput`, `ClassificationLowConfidence`,
    /// `NoQualifiedWorker`, or `QuotaExceeded` — all before any provider
    /// call.
    pub async fn submit_task(&self, task: Task, subject: &str) -> Result<String> {
        if task.id.as_str().trim().is_empty() {
            return Err(OrchestrationError::InvalidInput("task id must not be empty".to_string()));
        }
        if task.description.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "task description must not be empty".to_string(),
            ));
        }
        if subject.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput("subject must not be empty".to_string()));
        }

        // Fast idempotence path.
        if let Some(existing) = self.lookup_workflow_id(&task.id) {
            info!(task_id = %task.id, workflow_id = %existing, "Duplicate submission, returning existing workflow");
            return Ok(existing);
        }

        let classification = self.classifier.classify(&task).await?;
        let selection = self.selector.select(&classification).await?;
        let plan = WorkflowPlan::build(&classification, &selection);

        // Pre-execution quota check on the primary invocation: an estimate
        // over the grant's per-invocation cost cap is rejected here, before
        // any provider is called.
        if let Some((worker_id, units)) = plan.primary_estimate() {
            let estimated_cost = self
                .router
                .cheapest_estimate(&RouteRequest {
                    content_type: classification.content_type,
                    estimated_units: units,
                })
                .unwrap_or(0.0);
            self.permissions.precheck_invocation(
                subject,
                &worker_id,
                &selection.primary.snapshot.capabilities,
                classification.content_type.capability_tag(),
                units,
                estimated_cost,
            )?;
        }

        let seed = match &self.context_source {
            Some(source) => match source.get_context(&task.scope.scope_ref).await {
                Ok(context) => Some(context.text),
                Err(err) => {
                    warn!(scope = %task.scope.scope_ref, error = %err, "Context fetch failed, continuing without seed");
                    None
                }
            },
            None => None,
        };

        let workflow_id = format!("wf-{}", uuid::Uuid::new_v4());
        let state = Arc::new(WorkflowState::new(
            workflow_id.clone(),
            task.clone(),
            subject,
            classification.clone(),
            plan,
            seed,
        ));

        // Idempotence under a submission race: first insert wins, the loser
        // returns the winner's workflow id.
        {
            let mut index =
                self.task_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(existing) = index.get(&task.id) {
                return Ok(existing.clone());
            }
            index.insert(task.id.clone(), workflow_id.clone());
            let mut workflows =
                self.workflows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            workflows.insert(workflow_id.clone(), Arc::clone(&state));
        }

        self.ledger.append(
            LedgerEntry::new(subject, LedgerEvent::TaskSubmitted { task_id: task.id.to_string() })
                .with_workflow(&workflow_id),
        );
        self.events.emit(WorkflowEvent::TaskAccepted {
            workflow_id: workflow_id.clone(),
            task_id: task.id.to_string(),
        });
        self.events.emit(WorkflowEvent::TaskClassified {
            workflow_id: workflow_id.clone(),
            domain: classification.domain.clone(),
            confidence: classification.confidence,
        });
        self.events.emit(WorkflowEvent::WorkersSelected {
            workflow_id: workflow_id.clone(),
            primary: selection.primary.snapshot.id.clone(),
            supporting: selection.supporting.iter().map(|w| w.snapshot.id.clone()).collect(),
        });

        info!(
            task_id = %task.id,
            workflow_id = %workflow_id,
            primary = %selection.primary.snapshot.id,
            "Task accepted"
        );

        tokio::spawn(Arc::clone(&self.engine).run(state));

        Ok(workflow_id)
    }

    /// Submits a task on behalf of whoever a request token resolves to,
    /// through the identity collaborator.
    ///
    /// # Errors
    /// Returns `InvalidInput` for unresolvable tokens (or when no resolver
    /// is attached), plus everything `submit_task` can return.
    pub async fn submit_task_for_token(&self, task: Task, request_token: &str) -> Result<String> {
        let resolver = self.subject_resolver.as_ref().ok_or_else(|| {
            OrchestrationError::InvalidInput("no subject resolver configured".to_string())
        })?;
        let subject = resolver.resolve_subject(request_token).await.map_err(|err| {
            OrchestrationError::InvalidInput(format!("subject resolution failed: {}", err))
        })?;
        self.submit_task(task, &subject).await
    }

    /// Current status and partial outputs for a workflow.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown workflow id.
    pub fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusReport> {
        let workflows = self.workflows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        workflows
            .get(workflow_id)
            .map(|wf| wf.report())
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: "workflow".to_string(),
                id: workflow_id.to_string(),
            })
    }

    /// Resolves a pending approval request.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown requests and a wrong-state error when
    /// the request is not `PendingApproval`.
    pub fn resolve_approval(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
        resolved_by: &str,
        reason: Option<String>,
    ) -> Result<()> {
        self.permissions
            .resolve(request_id, decision, resolved_by, reason)
            .map_err(OrchestrationError::from)
    }

    /// Cancels a workflow: every pending invocation and outstanding approval
    /// drains to a terminal state and no further provider calls are issued.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown workflow id.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflows = self.workflows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let wf = workflows.get(workflow_id).ok_or_else(|| OrchestrationError::NotFound {
            resource: "workflow".to_string(),
            id: workflow_id.to_string(),
        })?;
        info!(workflow_id = %workflow_id, "Cancelling workflow");
        wf.cancel.cancel();
        Ok(())
    }

    /// Subscribes to the workflow event stream.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// The worker registry (registration surface for deployments).
    #[must_use]
    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    /// The provider router (registration surface for deployments).
    #[must_use]
    pub fn router(&self) -> Arc<ProviderRouter> {
        Arc::clone(&self.router)
    }

    /// The permission manager (grant administration surface).
    #[must_use]
    pub fn permissions(&self) -> Arc<PermissionManager> {
        Arc::clone(&self.permissions)
    }

    /// The usage ledger (audit and reporting surface).
    #[must_use]
    pub fn ledger(&self) -> Arc<UsageLedger> {
        Arc::clone(&self.ledger)
    }

    fn lookup_workflow_id(&self, task_id: &TaskId) -> Option<String> {
        let index = self.task_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        index.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_rendering() {
        assert_eq!(ResponseCode::Accepted.to_string(), "accepted");
        assert_eq!(
            ResponseCode::RejectedQuotaExceeded.to_string(),
            "rejected-quota-exceeded"
        );
    }

    #[test]
    fn test_response_code_classification() {
        let quota = OrchestrationError::QuotaExceeded {
            subject: "user-1".to_string(),
            detail: "daily".to_string(),
        };
        assert_eq!(ResponseCode::from_error(&quota), ResponseCode::RejectedQuotaExceeded);

        let missing = OrchestrationError::NotFound {
            resource: "workflow".to_string(),
            id: "wf-x".to_string(),
        };
        assert_eq!(ResponseCode::from_error(&missing), ResponseCode::RejectedNotFound);

        let invalid = OrchestrationError::InvalidInput("empty".to_string());
        assert_eq!(ResponseCode::from_error(&invalid), ResponseCode::RejectedInvalidInput);

        let no_worker = OrchestrationError::NoQualifiedWorker { detail: "none".to_string() };
        assert_eq!(
            ResponseCode::from_error(&no_worker),
            ResponseCode::RejectedNoQualifiedWorker
        );
    }
}
