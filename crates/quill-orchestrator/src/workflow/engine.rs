// Workflow engine: stage-ordered, approval-gated, failover-capable execution
//
// The engine walks a workflow's stages in order. Within a stage, invocations
// run concurrently under the per-workflow and global concurrency caps. Every
// invocation blocks on its approval request (a suspension point), executes
// against the routed provider with a timeout, and fails over to the next
// provider in the route as a new attempt. All state transitions hit the
// ledger before they become visible anywhere else.

use super::plan::PlannedInvocation;
use super::state::{InvocationAttempt, InvocationStatus, WorkflowState, WorkflowStatus};
use crate::config::EngineConfig;
use crate::events::{EventBus, WorkflowEvent};
use crate::ledger::{LedgerEntry, LedgerEvent, UsageLedger};
use crate::permission::{ApprovalSpec, ApprovalTicket, PermissionError, PermissionManager};
use crate::registry::WorkerRegistry;
use crate::routing::{ProviderRouter, RouteRequest};
use crate::{WorkAssignment, Worker};
use quill_abstraction::{ApprovalNotice, OutputValidator, UnitUsage};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Workflow engine over the shared registries and services.
pub struct WorkflowEngine {
    registry: Arc<WorkerRegistry>,
    router: Arc<ProviderRouter>,
    permissions: Arc<PermissionManager>,
    ledger: Arc<UsageLedger>,
    events: EventBus,
    validator: Arc<dyn OutputValidator>,
    global_slots: Arc<Semaphore>,
    config: EngineConfig,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        router: Arc<ProviderRouter>,
        permissions: Arc<PermissionManager>,
        ledger: Arc<UsageLedger>,
        events: EventBus,
        validator: Arc<dyn OutputValidator>,
        config: EngineConfig,
    ) -> Self {
        let global_slots = Arc::new(Semaphore::new(config.global_concurrency));
        Self { registry, router, permissions, ledger, events, validator, global_slots, config }
    }

    /// Executes a workflow to a terminal status.
    pub async fn run(self: Arc<Self>, wf: Arc<WorkflowState>) -> WorkflowStatus {
        info!(workflow_id = %wf.id, stages = wf.plan.stages.len(), "Workflow execution starting");
        self.ledger.append(
            LedgerEntry::new(
                &wf.subject,
                LedgerEvent::WorkflowTransition { status: WorkflowStatus::Running.to_string() },
            )
            .with_workflow(&wf.id),
        );

        for stage in wf.plan.stages.clone() {
            if wf.cancel.is_cancelled() {
                break;
            }

            let stage_slots = Arc::new(Semaphore::new(self.config.stage_concurrency));
            let mut join_set = JoinSet::new();

            for planned in stage.invocations.clone() {
                let engine = Arc::clone(&self);
                let wf = Arc::clone(&wf);
                let stage_slots = Arc::clone(&stage_slots);
                let global_slots = Arc::clone(&engine.global_slots);
                join_set.spawn(async move {
                    let _stage_permit = stage_slots.acquire_owned().await.ok();
                    let _global_permit = global_slots.acquire_owned().await.ok();
                    engine.run_invocation(&wf, planned).await;
                });
            }

            while join_set.join_next().await.is_some() {}

            let stage_fatal = stage.invocations.iter().any(|planned| {
                !planned.optional
                    && wf.invocation_status(&planned.id) != Some(InvocationStatus::Succeeded)
            });
            if stage_fatal {
                debug!(workflow_id = %wf.id, stage = stage.index, "Required invocation failed, stopping workflow");
                break;
            }
        }

        self.finish(&wf)
    }

    /// Runs one invocation end-to-end: approval gate, then execution with
    /// provider failover.
    async fn run_invocation(&self, wf: &Arc<WorkflowState>, planned: PlannedInvocation) {
        let Some(worker) = self.registry.get_worker(&planned.worker_id).await else {
            self.mark_invocation(
                wf,
                &planned,
                0,
                InvocationStatus::Failed,
                Some(format!("worker '{}' is no longer registered", planned.worker_id)),
            );
            return;
        };

        let estimated_cost = self
            .router
            .cheapest_estimate(&RouteRequest {
                content_type: wf.classification.content_type,
                estimated_units: planned.estimated_units,
            })
            .unwrap_or(0.0);

        let Some(mut ticket) =
            self.approval_gate(wf, &planned, worker.capabilities(), estimated_cost).await
        else {
            return;
        };

        self.registry.begin_work(&planned.worker_id).await;

        let route = match self.router.route(&RouteRequest {
            content_type: wf.classification.content_type,
            estimated_units: planned.estimated_units,
        }) {
            Ok(route) => route,
            Err(err) => {
                self.permissions.cancel_request(&ticket.request_id);
                self.registry.abort_work(&planned.worker_id).await;
                self.mark_invocation(
                    wf,
                    &planned,
                    0,
                    InvocationStatus::Failed,
                    Some(err.to_string()),
                );
                return;
            }
        };

        let max_attempts = self.config.max_retries + 1;
        let mut attempt: u32 = 0;
        let mut last_error = "no provider attempted".to_string();

        for provider_id in route.ordered() {
            if attempt >= max_attempts {
                break;
            }
            if wf.cancel.is_cancelled() {
                self.registry.abort_work(&planned.worker_id).await;
                self.cancel_invocation(wf, &planned, attempt, Some(&ticket));
                return;
            }
            // A provider may have tripped its breaker since the route was
            // computed; skip it rather than burn an attempt.
            if self.router.circuit_state(&provider_id).excludes_from_routing() {
                self.ledger.append(
                    LedgerEntry::new(
                        &wf.subject,
                        LedgerEvent::ProviderCall {
                            attempt: attempt + 1,
                            provider_id: provider_id.clone(),
                            outcome: "skipped: circuit open".to_string(),
                        },
                    )
                    .with_workflow(&wf.id)
                    .with_invocation(&planned.id),
                );
                continue;
            }

            let consumed_units =
                wf.with_invocation(&planned.id, |r| r.consumed_units()).unwrap_or(0);
            let accrued_cost = wf.with_invocation(&planned.id, |r| r.accrued_cost()).unwrap_or(0.0);

            // Retries reuse the original approval only while the projected
            // total stays within the approved scope; otherwise the old
            // request is finalized and a fresh approval cycle begins.
            if attempt > 0
                && !self
                    .permissions
                    .scope_allows(&ticket.request_id, consumed_units + planned.estimated_units)
            {
                let _ = self.permissions.consume(&ticket.request_id, consumed_units, accrued_cost);
                match self
                    .approval_gate(wf, &planned, worker.capabilities(), estimated_cost)
                    .await
                {
                    Some(new_ticket) => ticket = new_ticket,
                    None => {
                        self.registry.abort_work(&planned.worker_id).await;
                        return;
                    }
                }
            }

            let Some(handle) = self.router.handle(&provider_id) else {
                continue;
            };

            attempt += 1;
            self.begin_attempt(wf, &planned, attempt, &provider_id);

            let assignment = WorkAssignment {
                workflow_id: wf.id.clone(),
                invocation_id: planned.id.clone(),
                role: planned.role,
                stage: planned.stage,
                description: wf.task.description.clone(),
                domain: wf.classification.domain.clone(),
                context: wf.with_shared(|shared| shared.excerpt_for_stage(planned.stage)),
                max_units: Some(planned.estimated_units),
            };

            // Provider-class timeout overrides the engine default.
            let timeout = self
                .router
                .profile(&provider_id)
                .and_then(|p| p.timeout_secs)
                .map_or_else(|| self.config.invocation_timeout(), std::time::Duration::from_secs);

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = wf.cancel.cancelled() => {
                    self.record_attempt(wf, &planned, InvocationStatus::Cancelled, Some("workflow cancelled".to_string()), None, 0.0);
                    self.registry.abort_work(&planned.worker_id).await;
                    self.cancel_invocation(wf, &planned, attempt, Some(&ticket));
                    return;
                }
                result = tokio::time::timeout(
                    timeout,
                    worker.run(&assignment, handle.as_ref()),
                ) => result,
            };

            match outcome {
                Ok(Ok(output)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let usage = output.usage;
                    let cost = self
                        .router
                        .profile(&provider_id)
                        .map(|p| p.exact_cost(usage.input_units, usage.output_units))
                        .unwrap_or(0.0);

                    self.router.record_success(&provider_id, latency_ms, &usage);
                    self.ledger.append(
                        LedgerEntry::new(
                            &wf.subject,
                            LedgerEvent::ProviderCall {
                                attempt,
                                provider_id: provider_id.clone(),
                                outcome: "ok".to_string(),
                            },
                        )
                        .with_workflow(&wf.id)
                        .with_invocation(&planned.id),
                    );

                    self.record_attempt(
                        wf,
                        &planned,
                        InvocationStatus::Succeeded,
                        None,
                        Some(usage),
                        cost,
                    );
                    self.mark_invocation(wf, &planned, attempt, InvocationStatus::Succeeded, None);

                    let total_units = consumed_units + usage.total_units();
                    let total_cost = accrued_cost + cost;
                    if let Err(err) =
                        self.permissions.consume(&ticket.request_id, total_units, total_cost)
                    {
                        warn!(request_id = %ticket.request_id, error = %err, "Charge finalization failed");
                    }

                    self.registry
                        .finish_work(&planned.worker_id, &wf.classification.domain, 1.0)
                        .await;

                    wf.with_shared(|shared| {
                        shared.record_output(
                            &planned.id,
                            &planned.worker_id,
                            planned.role,
                            planned.stage,
                            &output.content,
                        );
                    });
                    return;
                }
                Ok(Err(provider_err)) => {
                    self.router.record_failure(&provider_id);
                    self.ledger.append(
                        LedgerEntry::new(
                            &wf.subject,
                            LedgerEvent::ProviderCall {
                                attempt,
                                provider_id: provider_id.clone(),
                                outcome: provider_err.to_string(),
                            },
                        )
                        .with_workflow(&wf.id)
                        .with_invocation(&planned.id),
                    );
                    self.record_attempt(
                        wf,
                        &planned,
                        InvocationStatus::Failed,
                        Some(provider_err.to_string()),
                        None,
                        0.0,
                    );
                    self.events.emit(WorkflowEvent::AttemptFailed {
                        workflow_id: wf.id.clone(),
                        invocation_id: planned.id.clone(),
                        attempt,
                        provider_id: provider_id.clone(),
                        error: provider_err.to_string(),
                    });

                    last_error = provider_err.to_string();
                    if !provider_err.is_transient() {
                        break;
                    }
                }
                Err(_elapsed) => {
                    self.router.record_failure(&provider_id);
                    let message =
                        format!("execution timed out after {}s", timeout.as_secs());
                    self.ledger.append(
                        LedgerEntry::new(
                            &wf.subject,
                            LedgerEvent::ProviderCall {
                                attempt,
                                provider_id: provider_id.clone(),
                                outcome: message.clone(),
                            },
                        )
                        .with_workflow(&wf.id)
                        .with_invocation(&planned.id),
                    );
                    self.record_attempt(
                        wf,
                        &planned,
                        InvocationStatus::Failed,
                        Some(message.clone()),
                        None,
                        0.0,
                    );
                    self.events.emit(WorkflowEvent::AttemptFailed {
                        workflow_id: wf.id.clone(),
                        invocation_id: planned.id.clone(),
                        attempt,
                        provider_id: provider_id.clone(),
                        error: message.clone(),
                    });
                    last_error = message;
                }
            }
        }

        // Route exhausted: finalize whatever was consumed and fail.
        let consumed_units = wf.with_invocation(&planned.id, |r| r.consumed_units()).unwrap_or(0);
        let accrued_cost = wf.with_invocation(&planned.id, |r| r.accrued_cost()).unwrap_or(0.0);
        let _ = self.permissions.consume(&ticket.request_id, consumed_units, accrued_cost);
        self.registry.finish_work(&planned.worker_id, &wf.classification.domain, 0.0).await;
        self.mark_invocation(
            wf,
            &planned,
            attempt,
            InvocationStatus::Failed,
            Some(format!("all providers failed after {} attempts: {}", attempt, last_error)),
        );
    }

    /// Opens an approval request and suspends until it resolves. Terminal
    /// outcomes are marked on the invocation; `None` means the invocation is
    /// finished and the caller must stop.
    async fn approval_gate(
        &self,
        wf: &Arc<WorkflowState>,
        planned: &PlannedInvocation,
        worker_capabilities: BTreeSet<String>,
        estimated_cost: f64,
    ) -> Option<ApprovalTicket> {
        let spec = ApprovalSpec {
            workflow_id: wf.id.clone(),
            invocation_id: planned.id.clone(),
            subject: wf.subject.clone(),
            worker_id: planned.worker_id.clone(),
            worker_capabilities,
            capability: planned.capability.clone(),
            units: planned.estimated_units,
            estimated_cost,
            stage: planned.stage,
        };

        let ticket = match self.permissions.request_approval(&spec) {
            Ok(ticket) => ticket,
            Err(PermissionError::Denied { reason, .. }) => {
                self.mark_invocation(
                    wf,
                    planned,
                    0,
                    InvocationStatus::Denied,
                    reason.or_else(|| Some("approval denied".to_string())),
                );
                return None;
            }
            Err(err) => {
                self.mark_invocation(wf, planned, 0, InvocationStatus::Failed, Some(err.to_string()));
                return None;
            }
        };

        wf.with_invocation(&planned.id, |record| {
            record.approval_request_id = Some(ticket.request_id.clone());
        });

        if !ticket.auto_approved {
            self.events.emit(WorkflowEvent::ApprovalRequired {
                workflow_id: wf.id.clone(),
                notice: ApprovalNotice {
                    request_id: ticket.request_id.clone(),
                    subject: wf.subject.clone(),
                    worker_id: planned.worker_id.clone(),
                    capability: planned.capability.clone(),
                    units: planned.estimated_units,
                    estimated_cost,
                },
            });
        }

        let resolution = tokio::select! {
            _ = wf.cancel.cancelled() => {
                self.cancel_invocation(wf, planned, 0, Some(&ticket));
                return None;
            }
            result = self.permissions.wait_for_resolution(&ticket.request_id) => result,
        };

        match resolution {
            Ok(()) => {
                self.mark_invocation(wf, planned, 0, InvocationStatus::Approved, None);
                self.events.emit(WorkflowEvent::ApprovalResolved {
                    workflow_id: wf.id.clone(),
                    request_id: ticket.request_id.clone(),
                    outcome: "approved".to_string(),
                });
                Some(ticket)
            }
            Err(PermissionError::Denied { reason, .. }) => {
                self.events.emit(WorkflowEvent::ApprovalResolved {
                    workflow_id: wf.id.clone(),
                    request_id: ticket.request_id.clone(),
                    outcome: "denied".to_string(),
                });
                self.mark_invocation(
                    wf,
                    planned,
                    0,
                    InvocationStatus::Denied,
                    reason.or_else(|| Some("approval denied".to_string())),
                );
                None
            }
            Err(PermissionError::Expired { .. }) => {
                self.events.emit(WorkflowEvent::ApprovalResolved {
                    workflow_id: wf.id.clone(),
                    request_id: ticket.request_id.clone(),
                    outcome: "expired".to_string(),
                });
                self.mark_invocation(
                    wf,
                    planned,
                    0,
                    InvocationStatus::Failed,
                    Some("approval expired before resolution".to_string()),
                );
                None
            }
            Err(err) => {
                self.mark_invocation(wf, planned, 0, InvocationStatus::Failed, Some(err.to_string()));
                None
            }
        }
    }

    /// Marks an invocation cancelled and releases its approval. Callers
    /// that hold a load slot release it themselves before calling this.
    fn cancel_invocation(
        &self,
        wf: &Arc<WorkflowState>,
        planned: &PlannedInvocation,
        attempt: u32,
        ticket: Option<&ApprovalTicket>,
    ) {
        if let Some(ticket) = ticket {
            self.permissions.cancel_request(&ticket.request_id);
        }
        self.mark_invocation(
            wf,
            planned,
            attempt,
            InvocationStatus::Cancelled,
            Some("workflow cancelled".to_string()),
        );
    }

    /// Appends the write-ahead transition and pushes the attempt record for
    /// an execution start.
    fn begin_attempt(
        &self,
        wf: &Arc<WorkflowState>,
        planned: &PlannedInvocation,
        attempt: u32,
        provider_id: &str,
    ) {
        let from = wf.invocation_status(&planned.id).unwrap_or(InvocationStatus::Pending);
        self.ledger.append(
            LedgerEntry::new(
                &wf.subject,
                LedgerEvent::InvocationTransition {
                    attempt,
                    from: from.to_string(),
                    to: InvocationStatus::Executing.to_string(),
                },
            )
            .with_workflow(&wf.id)
            .with_invocation(&planned.id),
        );

        wf.with_invocation(&planned.id, |record| {
            record.status = InvocationStatus::Executing;
            record.attempts.push(InvocationAttempt {
                attempt,
                provider_id: provider_id.to_string(),
                status: InvocationStatus::Executing,
                error: None,
                usage: None,
                cost: 0.0,
            });
        });

        self.events.emit(WorkflowEvent::InvocationStarted {
            workflow_id: wf.id.clone(),
            invocation_id: planned.id.clone(),
            attempt,
            worker_id: planned.worker_id.clone(),
            provider_id: provider_id.to_string(),
        });
    }

    /// Finalizes the latest attempt record.
    fn record_attempt(
        &self,
        wf: &Arc<WorkflowState>,
        planned: &PlannedInvocation,
        status: InvocationStatus,
        error: Option<String>,
        usage: Option<UnitUsage>,
        cost: f64,
    ) {
        wf.with_invocation(&planned.id, |record| {
            if let Some(last) = record.attempts.last_mut() {
                last.status = status;
                last.error = error;
                last.usage = usage;
                last.cost = cost;
            }
        });
    }

    /// Ledger-first status transition for an invocation, emitting the
    /// terminal event when applicable.
    fn mark_invocation(
        &self,
        wf: &Arc<WorkflowState>,
        planned: &PlannedInvocation,
        attempt: u32,
        to: InvocationStatus,
        failure: Option<String>,
    ) {
        let from = wf.invocation_status(&planned.id).unwrap_or(InvocationStatus::Pending);
        if from == to {
            return;
        }

        self.ledger.append(
            LedgerEntry::new(
                &wf.subject,
                LedgerEvent::InvocationTransition {
                    attempt,
                    from: from.to_string(),
                    to: to.to_string(),
                },
            )
            .with_workflow(&wf.id)
            .with_invocation(&planned.id),
        );

        wf.with_invocation(&planned.id, |record| {
            record.status = to;
            if record.failure.is_none() {
                record.failure = failure;
            }
        });

        if to.is_terminal() {
            self.events.emit(WorkflowEvent::InvocationFinished {
                workflow_id: wf.id.clone(),
                invocation_id: planned.id.clone(),
                status: to.to_string(),
            });
        }
    }

    /// Computes the workflow's terminal status, runs validation, and settles
    /// leftover invocations.
    fn finish(&self, wf: &Arc<WorkflowState>) -> WorkflowStatus {
        // Invocations that never started (later stages after an abort, or a
        // cancellation) drain to Cancelled, and their approvals are released.
        for record in wf.invocation_records() {
            if !record.status.is_terminal() {
                if let Some(request_id) = &record.approval_request_id {
                    self.permissions.cancel_request(request_id);
                }
                self.mark_invocation(
                    wf,
                    &record.planned,
                    0,
                    InvocationStatus::Cancelled,
                    Some("workflow stopped before execution".to_string()),
                );
            }
        }

        let records = wf.invocation_records();
        let denied_required = records
            .iter()
            .find(|r| !r.planned.optional && r.status == InvocationStatus::Denied);
        let failed_required = records.iter().find(|r| {
            !r.planned.optional
                && matches!(
                    r.status,
                    InvocationStatus::Failed | InvocationStatus::Expired
                )
        });
        let required_ok = records
            .iter()
            .filter(|r| !r.planned.optional)
            .all(|r| r.status == InvocationStatus::Succeeded);
        let degraded = records
            .iter()
            .any(|r| r.planned.optional && r.status != InvocationStatus::Succeeded);

        let status = if wf.cancel.is_cancelled() {
            wf.set_failure("workflow cancelled");
            WorkflowStatus::Cancelled
        } else if let Some(denied) = denied_required {
            wf.set_failure(format!(
                "approval denied for invocation '{}': {}",
                denied.planned.id,
                denied.failure.as_deref().unwrap_or("no reason given")
            ));
            WorkflowStatus::Cancelled
        } else if let Some(failed) = failed_required {
            wf.set_failure(format!(
                "invocation '{}' failed: {}",
                failed.planned.id,
                failed.failure.as_deref().unwrap_or("unknown failure")
            ));
            WorkflowStatus::Failed
        } else if !required_ok {
            wf.set_failure("required invocation did not succeed".to_string());
            WorkflowStatus::Failed
        } else {
            let aggregated = wf.with_shared(|shared| shared.combined_output());
            let violations = self.validator.validate(&aggregated);
            if violations.is_empty() {
                if degraded {
                    WorkflowStatus::PartiallyCompleted
                } else {
                    WorkflowStatus::Completed
                }
            } else {
                let checks: Vec<String> = violations.iter().map(|v| v.check.clone()).collect();
                wf.set_failure(format!(
                    "validation failed: {}",
                    violations
                        .iter()
                        .map(|v| format!("{} ({})", v.check, v.detail))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
                self.events.emit(WorkflowEvent::ValidationFailed {
                    workflow_id: wf.id.clone(),
                    checks,
                });
                WorkflowStatus::Failed
            }
        };

        self.ledger.append(
            LedgerEntry::new(
                &wf.subject,
                LedgerEvent::WorkflowTransition { status: status.to_string() },
            )
            .with_workflow(&wf.id),
        );
        wf.set_status(status);
        self.events.emit(WorkflowEvent::WorkflowDone {
            workflow_id: wf.id.clone(),
            status: status.to_string(),
        });

        info!(workflow_id = %wf.id, status = %status, "Workflow finished");
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApprovalConfig, RouterConfig};
    use crate::permission::{ApprovalPolicy, GrantTarget, PermissionGrant, Quotas};
    use crate::routing::ProviderProfile;
    use crate::selector::{ScoredWorker, Selection};
    use crate::task::{
        Classification, CollaborationMode, Complexity, ContentType, DocumentScope, Task,
    };
    use crate::workflow::plan::WorkflowPlan;
    use crate::workflow::validation::AcceptAllValidator;
    use crate::{EchoProvider, PromptWorker};
    use std::collections::BTreeSet;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    struct Harness {
        engine: Arc<WorkflowEngine>,
        registry: Arc<WorkerRegistry>,
        permissions: Arc<PermissionManager>,
        ledger: Arc<UsageLedger>,
    }

    async fn harness(policy: ApprovalPolicy) -> Harness {
        let ledger = Arc::new(UsageLedger::new());
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .register_worker(Arc::new(PromptWorker::new(
                "drafter".to_string(),
                "General drafter".to_string(),
                caps(&["article", "general"]),
            )))
            .await;

        let router = Arc::new(ProviderRouter::new(RouterConfig::default()));
        router.register_provider(
            ProviderProfile::new("northwind", vec![ContentType::Article], 3.0, 15.0, 100),
            Arc::new(EchoProvider::new("northwind".to_string())),
        );

        let permissions =
            Arc::new(PermissionManager::new(Arc::clone(&ledger), &ApprovalConfig::default()));
        permissions.add_grant(PermissionGrant::new(
            "user-1",
            GrantTarget::WorkerClass("article".to_string()),
            caps(&["article"]),
            Quotas::new(10_000, 100_000, 5.0),
            policy,
        ));

        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&registry),
            router,
            Arc::clone(&permissions),
            Arc::clone(&ledger),
            EventBus::default(),
            Arc::new(AcceptAllValidator),
            EngineConfig::default(),
        ));

        Harness { engine, registry, permissions, ledger }
    }

    fn workflow(mode: CollaborationMode) -> Arc<WorkflowState> {
        let classification = Classification {
            content_type: ContentType::Article,
            complexity: Complexity::Low,
            domain: "general".to_string(),
            collaboration_mode: mode,
            confidence: 0.9,
        };
        let selection = Selection {
            primary: ScoredWorker {
                snapshot: crate::registry::WorkerSnapshot {
                    id: "drafter".to_string(),
                    description: String::new(),
                    capabilities: caps(&["article", "general"]),
                    load: 0,
                    performance: std::collections::HashMap::new(),
                },
                score: 0.9,
            },
            supporting: Vec::new(),
        };
        let plan = WorkflowPlan::build(&classification, &selection);
        let task = Task::new("t-1", "write an intro paragraph", DocumentScope::new("doc/1"));
        Arc::new(WorkflowState::new("wf-1", task, "user-1", classification, plan, None))
    }

    #[tokio::test]
    async fn test_single_workflow_completes_with_auto_approval() {
        let h = harness(ApprovalPolicy::Never).await;
        let wf = workflow(CollaborationMode::Single);

        let status = Arc::clone(&h.engine).run(Arc::clone(&wf)).await;
        assert_eq!(status, WorkflowStatus::Completed);

        let records = wf.invocation_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InvocationStatus::Succeeded);
        assert_eq!(records[0].attempts.len(), 1);
        assert_eq!(records[0].attempts[0].provider_id, "northwind");

        // Output landed in shared context.
        let outputs = wf.with_shared(|s| s.partial_outputs());
        assert_eq!(outputs.len(), 1);

        // Worker load returned to zero and performance improved.
        assert_eq!(h.registry.load_of("drafter").await, 0);

        // Charge was finalized against the grant.
        assert_eq!(h.permissions.outstanding("user-1"), (0, 0));
        assert!(h.ledger.charged_units_last_day("user-1") > 0);
    }

    #[tokio::test]
    async fn test_cancellation_before_run_drains_invocations() {
        let h = harness(ApprovalPolicy::Never).await;
        let wf = workflow(CollaborationMode::Single);
        wf.cancel.cancel();

        let status = Arc::clone(&h.engine).run(Arc::clone(&wf)).await;
        assert_eq!(status, WorkflowStatus::Cancelled);
        assert_eq!(wf.invocation_records()[0].status, InvocationStatus::Cancelled);
        // Nothing was reserved or charged.
        assert_eq!(h.permissions.outstanding("user-1"), (0, 0));
        assert_eq!(h.ledger.charged_units_last_day("user-1"), 0);
    }

    #[tokio::test]
    async fn test_pending_approval_blocks_then_denial_cancels() {
        let h = harness(ApprovalPolicy::Always).await;
        let wf = workflow(CollaborationMode::Single);

        let run = {
            let engine = Arc::clone(&h.engine);
            let wf = Arc::clone(&wf);
            tokio::spawn(async move { engine.run(wf).await })
        };

        // Wait for the approval request to appear.
        let request_id = loop {
            let records = wf.invocation_records();
            if let Some(id) = records[0].approval_request_id.clone() {
                break id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };

        h.permissions
            .resolve(
                &request_id,
                crate::permission::ApprovalDecision::Deny,
                "alice",
                Some("out of scope".to_string()),
            )
            .unwrap();

        let status = run.await.unwrap();
        // Denial of a non-optional invocation cancels the workflow.
        assert_eq!(status, WorkflowStatus::Cancelled);
        assert_eq!(wf.invocation_records()[0].status, InvocationStatus::Denied);
        assert!(wf.failure().unwrap().contains("approval denied"));
    }
}
