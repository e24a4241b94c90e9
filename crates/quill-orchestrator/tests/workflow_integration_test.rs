//! Integration tests for workflow execution end-to-end.
//!
//! Covers:
//! - Parallel collaboration fan-out and deterministic aggregation
//! - Cancellation draining every pending invocation without provider calls
//! - Approval expiry failing the invocation with the specific reason
//! - Validation failures surfacing the violated checks

use async_trait::async_trait;
use quill_abstraction::{Provider, ProviderError, UnitUsage, WorkRequest, WorkResponse};
use quill_orchestrator::config::OrchestratorConfig;
use quill_orchestrator::permission::{ApprovalPolicy, GrantTarget, PermissionGrant, Quotas};
use quill_orchestrator::routing::ProviderProfile;
use quill_orchestrator::task::{ContentType, DocumentScope, Task};
use quill_orchestrator::workflow::{InvocationStatus, MinLengthValidator, WorkflowStatus, WorkflowStatusReport};
use quill_orchestrator::{EchoProvider, OrchestrationService, PromptWorker, ServiceBuilder};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn caps(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

struct CountingProvider {
    id: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Provider for CountingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: &WorkRequest) -> Result<WorkResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorkResponse {
            content: format!("[{}] {}", self.id, request.instructions),
            provider_id: Some(self.id.clone()),
            usage: Some(UnitUsage::new(100, 300)),
        })
    }
}

async fn build_service(
    builder: ServiceBuilder,
    policy: ApprovalPolicy,
    provider: Arc<dyn Provider>,
) -> OrchestrationService {
    let service = builder.build();

    for (id, tags) in [
        ("drafter", vec!["article", "general"]),
        ("researcher", vec!["research", "general"]),
        ("fact-checker", vec!["citations", "general"]),
    ] {
        service
            .registry()
            .register_worker(Arc::new(PromptWorker::new(
                id.to_string(),
                format!("{} worker", id),
                tags.iter().map(|t| t.to_string()).collect(),
            )))
            .await;
    }

    service.router().register_provider(
        ProviderProfile::new("northwind", vec![ContentType::Article], 3.0, 15.0, 500),
        provider,
    );

    service.permissions().add_grant(PermissionGrant::new(
        "user-1",
        GrantTarget::WorkerClass("general".to_string()),
        caps(&["article"]),
        Quotas::new(100_000, 1_000_000, 50.0),
        policy,
    ));

    service
}

fn parallel_task(id: &str) -> Task {
    Task::new(
        id,
        "Write an article with three sections covering updates, risks, and roadmap",
        DocumentScope::new("doc-1/brief"),
    )
}

async fn wait_terminal(service: &OrchestrationService, workflow_id: &str) -> WorkflowStatusReport {
    for _ in 0..800 {
        let report = service.workflow_status(workflow_id).unwrap();
        if report.status.is_terminal() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} did not reach a terminal status", workflow_id);
}

/// Parallel collaboration: the primary plus diverse supporting workers run
/// in one stage and every output lands in the aggregated result.
#[tokio::test]
async fn test_parallel_collaboration_aggregates_outputs() {
    let service = build_service(
        OrchestrationService::builder(OrchestratorConfig::default()),
        ApprovalPolicy::Never,
        Arc::new(EchoProvider::new("northwind".to_string())),
    )
    .await;

    let workflow_id = service.submit_task(parallel_task("doc-1:parallel"), "user-1").await.unwrap();
    let report = wait_terminal(&service, &workflow_id).await;

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.invocations.len(), 3, "primary plus two diverse supporting workers");
    assert!(report.invocations.iter().all(|r| r.status == InvocationStatus::Succeeded));
    assert_eq!(report.partial_outputs.len(), 3);

    let workers: BTreeSet<String> =
        report.invocations.iter().map(|r| r.planned.worker_id.clone()).collect();
    assert!(workers.contains("drafter"));
    assert_eq!(workers.len(), 3);
}

/// A failed supporting invocation degrades the workflow to partially
/// completed instead of failing it, as long as the primary succeeds.
#[tokio::test]
async fn test_failed_supporting_worker_degrades_gracefully() {
    use quill_orchestrator::{WorkAssignment, WorkOutput, Worker};

    /// Worker that always reports a non-transient failure.
    struct BrokenWorker;

    #[async_trait]
    impl Worker for BrokenWorker {
        fn id(&self) -> &str {
            "broken-researcher"
        }

        fn description(&self) -> &str {
            "Worker that always fails"
        }

        fn capabilities(&self) -> BTreeSet<String> {
            caps(&["research", "general"])
        }

        async fn run(
            &self,
            _assignment: &WorkAssignment,
            _provider: &dyn Provider,
        ) -> Result<WorkOutput, ProviderError> {
            Err(ProviderError::ResponseError("research corpus offline".to_string()))
        }
    }

    let service = OrchestrationService::builder(OrchestratorConfig::default()).build();
    service
        .registry()
        .register_worker(Arc::new(PromptWorker::new(
            "drafter".to_string(),
            "General drafter".to_string(),
            caps(&["article", "general"]),
        )))
        .await;
    service.registry().register_worker(Arc::new(BrokenWorker)).await;

    service.router().register_provider(
        ProviderProfile::new("northwind", vec![ContentType::Article], 3.0, 15.0, 500),
        Arc::new(EchoProvider::new("northwind".to_string())),
    );
    service.permissions().add_grant(PermissionGrant::new(
        "user-1",
        GrantTarget::WorkerClass("general".to_string()),
        caps(&["article"]),
        Quotas::new(100_000, 1_000_000, 50.0),
        ApprovalPolicy::Never,
    ));

    let workflow_id =
        service.submit_task(parallel_task("doc-1:degraded"), "user-1").await.unwrap();
    let report = wait_terminal(&service, &workflow_id).await;

    assert_eq!(report.status, WorkflowStatus::PartiallyCompleted);

    let primary = report
        .invocations
        .iter()
        .find(|r| r.planned.worker_id == "drafter")
        .unwrap();
    assert_eq!(primary.status, InvocationStatus::Succeeded);

    let supporting = report
        .invocations
        .iter()
        .find(|r| r.planned.worker_id == "broken-researcher")
        .unwrap();
    assert_eq!(supporting.status, InvocationStatus::Failed);
    assert!(supporting.failure.as_deref().unwrap().contains("research corpus offline"));
}

/// Cancelling a workflow blocked on approval drains every invocation to
/// cancelled, releases the quota, and issues no provider calls.
#[tokio::test]
async fn test_cancellation_drains_pending_invocations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = build_service(
        OrchestrationService::builder(OrchestratorConfig::default()),
        ApprovalPolicy::Always,
        Arc::new(CountingProvider { id: "northwind".to_string(), calls: Arc::clone(&calls) }),
    )
    .await;

    let workflow_id = service.submit_task(parallel_task("doc-1:cancel"), "user-1").await.unwrap();

    // Wait until at least one approval request is outstanding.
    for _ in 0..200 {
        let report = service.workflow_status(&workflow_id).unwrap();
        if report.invocations.iter().any(|r| r.approval_request_id.is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    service.cancel_workflow(&workflow_id).unwrap();
    let report = wait_terminal(&service, &workflow_id).await;

    assert_eq!(report.status, WorkflowStatus::Cancelled);
    assert!(report
        .invocations
        .iter()
        .all(|r| r.status == InvocationStatus::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no provider calls after cancellation");

    // All reservations were released.
    assert_eq!(service.permissions().outstanding("user-1"), (0, 0));
}

/// An unresolved approval expires on the policy clock and the invocation
/// fails with the expiry as its reason.
#[tokio::test]
async fn test_approval_expiry_fails_invocation() {
    let mut config = OrchestratorConfig::default();
    config.approval.timeout_secs = 1;

    let calls = Arc::new(AtomicUsize::new(0));
    let service = build_service(
        OrchestrationService::builder(config),
        ApprovalPolicy::Always,
        Arc::new(CountingProvider { id: "northwind".to_string(), calls: Arc::clone(&calls) }),
    )
    .await;

    let task = Task::new(
        "doc-1:expiry",
        "Write an article about the quarterly product updates for our customers",
        DocumentScope::new("doc-1/brief"),
    );
    let workflow_id = service.submit_task(task, "user-1").await.unwrap();
    let report = wait_terminal(&service, &workflow_id).await;

    assert_eq!(report.status, WorkflowStatus::Failed);
    let record = &report.invocations[0];
    assert_eq!(record.status, InvocationStatus::Failed);
    assert!(record.failure.as_deref().unwrap().contains("approval expired"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(service.permissions().outstanding("user-1"), (0, 0));
}

/// Output failing the validation pass fails the workflow with the specific
/// violated checks, never a bare error.
#[tokio::test]
async fn test_validation_failure_surfaces_checks() {
    let service = build_service(
        OrchestrationService::builder(OrchestratorConfig::default())
            .with_validator(Arc::new(MinLengthValidator::new(100_000))),
        ApprovalPolicy::Never,
        Arc::new(EchoProvider::new("northwind".to_string())),
    )
    .await;

    let workflow_id =
        service.submit_task(parallel_task("doc-1:validation"), "user-1").await.unwrap();
    let report = wait_terminal(&service, &workflow_id).await;

    assert_eq!(report.status, WorkflowStatus::Failed);
    let failure = report.failure.unwrap();
    assert!(failure.contains("validation failed"));
    assert!(failure.contains("min-length"));

    // The invocations themselves succeeded; validation failed the workflow.
    assert!(report.invocations.iter().all(|r| r.status == InvocationStatus::Succeeded));
}
