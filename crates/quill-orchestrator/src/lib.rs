//! Agent orchestration and permission-gated execution core for Quill.
//!
//! This crate classifies incoming writing tasks, selects specialized workers,
//! gates every execution behind capability/quota/approval policy, routes each
//! execution to an upstream provider with failover, and coordinates
//! multi-worker workflows into a single validated result.

pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod permission;
pub mod registry;
pub mod routing;
pub mod selector;
pub mod service;
pub mod task;
pub mod workflow;

use async_trait::async_trait;
use quill_abstraction::{Provider, ProviderError, UnitUsage, WorkRequest, WorkResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

pub use classifier::{ClassifierBackend, TaskClassifier};
pub use config::OrchestratorConfig;
pub use error::{OrchestrationError, Result};
pub use events::{EventBus, WorkflowEvent};
pub use ledger::{LedgerEntry, LedgerEvent, UsageLedger};
pub use permission::{
    ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalState, GrantTarget,
    PermissionGrant, PermissionManager, Quotas,
};
pub use registry::{WorkerRegistry, WorkerSnapshot};
pub use routing::{CircuitState, ProviderProfile, ProviderRouter};
pub use selector::{Selection, SelectionError, WorkerSelector};
pub use service::{OrchestrationService, ResponseCode, ServiceBuilder};
pub use task::{
    Classification, CollaborationMode, Complexity, ContentType, DocumentScope, Task, TaskId,
    TaskPriority,
};
pub use workflow::{
    InvocationRole, InvocationStatus, SharedContext, WorkflowEngine, WorkflowPlan, WorkflowState,
    WorkflowStatus, WorkflowStatusReport,
};

/// The material handed to a worker for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// Workflow the invocation belongs to.
    pub workflow_id: String,
    /// The invocation being executed.
    pub invocation_id: String,
    /// Role within the workflow.
    pub role: workflow::InvocationRole,
    /// Stage the invocation runs in.
    pub stage: usize,
    /// The task's description.
    pub description: String,
    /// Domain of the classification.
    pub domain: String,
    /// Shared-context material visible to this stage.
    pub context: Option<String>,
    /// Unit budget for the invocation.
    pub max_units: Option<u64>,
}

/// The output a worker produced for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOutput {
    /// The produced content.
    pub content: String,
    /// Units consumed producing it.
    pub usage: UnitUsage,
}

/// A trait that defines the interface for any specialized worker.
///
/// Workers declare capability tags the selector matches against a task's
/// classification, and execute assignments against the provider the router
/// bound to the invocation.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Returns the unique ID of the worker.
    fn id(&self) -> &str;

    /// Returns a description of the worker's purpose.
    fn description(&self) -> &str;

    /// Returns the worker's declared capability tags.
    fn capabilities(&self) -> BTreeSet<String>;

    /// Executes an assignment against the bound provider.
    ///
    /// # Errors
    /// Returns a `ProviderError` if the underlying provider call fails; the
    /// engine decides whether to fail over based on `is_transient()`.
    async fn run(
        &self,
        assignment: &WorkAssignment,
        provider: &dyn Provider,
    ) -> std::result::Result<WorkOutput, ProviderError>;
}

/// A general-purpose worker that turns its assignment into a provider
/// request. Specialized workers differ in capability tags and in how they
/// frame the instructions.
#[derive(Debug, Clone)]
pub struct PromptWorker {
    id: String,
    description: String,
    capabilities: BTreeSet<String>,
}

impl PromptWorker {
    /// Creates a worker with the given identity and capability tags.
    #[must_use]
    pub fn new(id: String, description: String, capabilities: BTreeSet<String>) -> Self {
        Self { id, description, capabilities }
    }
}

#[async_trait]
impl Worker for PromptWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn run(
        &self,
        assignment: &WorkAssignment,
        provider: &dyn Provider,
    ) -> std::result::Result<WorkOutput, ProviderError> {
        debug!(
            worker_id = %self.id,
            invocation_id = %assignment.invocation_id,
            provider_id = %provider.id(),
            "Worker executing"
        );

        let instructions = match assignment.role {
            workflow::InvocationRole::Primary => assignment.description.clone(),
            workflow::InvocationRole::Supporting => format!(
                "Contribute supporting {} material for: {}",
                assignment.domain, assignment.description
            ),
        };

        let mut request = WorkRequest::new(instructions);
        if let Some(context) = &assignment.context {
            request = request.with_context(context.clone());
        }
        if let Some(max_units) = assignment.max_units {
            request = request.with_max_units(max_units);
        }

        let response: WorkResponse = provider.execute(&request).await?;
        let usage = response.usage.unwrap_or_else(|| {
            // Providers that report no usage get a character-based estimate.
            UnitUsage::new(
                (request.instructions.len() / 4) as u64 + 1,
                (response.content.len() / 4) as u64 + 1,
            )
        });

        Ok(WorkOutput { content: response.content, usage })
    }
}

/// A provider that deterministically echoes its instructions. Used in tests
/// and as the demo backend for the CLI.
#[derive(Debug, Clone)]
pub struct EchoProvider {
    id: String,
}

impl EchoProvider {
    /// Creates an echo provider with the given id.
    #[must_use]
    pub fn new(id: String) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        request: &WorkRequest,
    ) -> std::result::Result<WorkResponse, ProviderError> {
        let content = match &request.context {
            Some(context) => format!(
                "[{}] {}\n\nBuilding on prior material ({} chars).",
                self.id,
                request.instructions,
                context.len()
            ),
            None => format!("[{}] {}", self.id, request.instructions),
        };

        let usage = UnitUsage::new(
            (request.instructions.len() / 4) as u64 + 1,
            (content.len() / 4) as u64 + 1,
        );

        Ok(WorkResponse { content, provider_id: Some(self.id.clone()), usage: Some(usage) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_prompt_worker_forwards_to_provider() {
        let worker = PromptWorker::new(
            "drafter".to_string(),
            "General drafter".to_string(),
            caps(&["article"]),
        );
        let provider = EchoProvider::new("northwind".to_string());

        let assignment = WorkAssignment {
            workflow_id: "wf-1".to_string(),
            invocation_id: "inv-1".to_string(),
            role: workflow::InvocationRole::Primary,
            stage: 0,
            description: "write an intro".to_string(),
            domain: "general".to_string(),
            context: None,
            max_units: Some(500),
        };

        let output = worker.run(&assignment, &provider).await.unwrap();
        assert!(output.content.contains("write an intro"));
        assert!(output.content.contains("northwind"));
        assert!(output.usage.total_units() > 0);
    }

    #[tokio::test]
    async fn test_supporting_role_changes_framing() {
        let worker = PromptWorker::new(
            "researcher".to_string(),
            "Researcher".to_string(),
            caps(&["research"]),
        );
        let provider = EchoProvider::new("northwind".to_string());

        let assignment = WorkAssignment {
            workflow_id: "wf-1".to_string(),
            invocation_id: "inv-1".to_string(),
            role: workflow::InvocationRole::Supporting,
            stage: 0,
            description: "write an intro".to_string(),
            domain: "legal".to_string(),
            context: Some("earlier draft".to_string()),
            max_units: None,
        };

        let output = worker.run(&assignment, &provider).await.unwrap();
        assert!(output.content.contains("supporting legal material"));
        assert!(output.content.contains("prior material"));
    }

    #[test]
    fn test_worker_capabilities() {
        let worker = PromptWorker::new(
            "drafter".to_string(),
            "General drafter".to_string(),
            caps(&["article", "summary"]),
        );
        assert_eq!(worker.capabilities().len(), 2);
        assert_eq!(worker.id(), "drafter");
    }
}
