//! Permission management: grants, approval requests, and quota accounting.
//!
//! The permission manager owns the approval-request state machine and the
//! quota accountant. Every transition is appended to the usage ledger before
//! it becomes visible to any other component. Waiting for a resolution is a
//! suspension point: callers park on a per-request notifier and are woken by
//! resolution or expiry, never by polling.

pub mod approval;
pub mod grant;
pub mod quota;

pub use approval::{ApprovalDecision, ApprovalRequest, ApprovalState};
pub use grant::{ApprovalPolicy, GrantTarget, PermissionGrant, Quotas};
pub use quota::QuotaAccountant;

use crate::config::ApprovalConfig;
use crate::ledger::{LedgerEntry, LedgerEvent, UsageLedger};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Errors from the permission manager.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// The approval request does not exist.
    #[error("Approval request '{request_id}' not found")]
    RequestNotFound {
        /// The missing request id.
        request_id: String,
    },

    /// The request is not in a state that allows the operation.
    #[error("Approval request '{request_id}' is in state '{state}'")]
    WrongState {
        /// The request.
        request_id: String,
        /// Its current state.
        state: ApprovalState,
    },

    /// A quota limit would be exceeded.
    #[error("Quota exceeded for '{subject}': {reason}")]
    QuotaExceeded {
        /// Subject whose grant was charged.
        subject: String,
        /// Which limit and by how much.
        reason: String,
    },

    /// No grant covers the worker for this subject.
    #[error("No grant for subject '{subject}' covering worker '{worker_id}'")]
    NoGrant {
        /// The subject.
        subject: String,
        /// The uncovered worker.
        worker_id: String,
    },

    /// The grant does not include the requested capability.
    #[error("Capability '{capability}' not granted to subject '{subject}'")]
    CapabilityNotGranted {
        /// The subject.
        subject: String,
        /// The missing capability.
        capability: String,
    },

    /// The state machine does not allow this transition.
    #[error("Invalid approval transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ApprovalState,
        /// Attempted state.
        to: ApprovalState,
    },

    /// The request was explicitly denied.
    #[error("Approval request '{request_id}' denied{}", reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Denied {
        /// The denied request.
        request_id: String,
        /// Approver-supplied reason, if any.
        reason: Option<String>,
    },

    /// The request expired without resolution.
    #[error("Approval request '{request_id}' expired")]
    Expired {
        /// The expired request.
        request_id: String,
    },
}

/// Everything needed to open an approval request for one invocation.
#[derive(Debug, Clone)]
pub struct ApprovalSpec {
    /// Workflow the invocation belongs to.
    pub workflow_id: String,
    /// The invocation being gated.
    pub invocation_id: String,
    /// Subject whose grant is charged.
    pub subject: String,
    /// Worker that will execute.
    pub worker_id: String,
    /// The worker's capability tags (for worker-class grant matching).
    pub worker_capabilities: BTreeSet<String>,
    /// Capability being exercised.
    pub capability: String,
    /// Requested units.
    pub units: u64,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
    /// Stage index within the workflow (milestone bookkeeping).
    pub stage: usize,
}

/// Handle returned when an approval request is opened.
#[derive(Debug, Clone)]
pub struct ApprovalTicket {
    /// The request id, used to wait on or resolve the request.
    pub request_id: String,
    /// Whether the policy auto-approved without a human.
    pub auto_approved: bool,
    /// Units the approval covers (retry attempts must stay within them).
    pub approved_units: u64,
    /// When a pending request expires.
    pub expires_at: DateTime<Utc>,
}

struct RequestEntry {
    request: ApprovalRequest,
    notify: Arc<Notify>,
    policy: ApprovalPolicy,
    workflow_id: String,
    stage: usize,
}

/// Permission manager holding grants, requests, and the quota accountant.
pub struct PermissionManager {
    grants: Mutex<HashMap<String, Vec<PermissionGrant>>>,
    requests: Mutex<HashMap<String, RequestEntry>>,
    milestones: Mutex<HashMap<(String, usize), ApprovalDecision>>,
    accountant: QuotaAccountant,
    ledger: Arc<UsageLedger>,
    timeout: std::time::Duration,
}

impl std::fmt::Debug for PermissionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionManager")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PermissionManager {
    /// Creates a permission manager over the shared ledger.
    #[must_use]
    pub fn new(ledger: Arc<UsageLedger>, config: &ApprovalConfig) -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            milestones: Mutex::new(HashMap::new()),
            accountant: QuotaAccountant::new(Arc::clone(&ledger)),
            ledger,
            timeout: config.timeout(),
        }
    }

    /// Adds a grant, assigning the next version for its subject.
    ///
    /// A new grant supersedes older ones for future requests; invocations
    /// already approved keep the version they were approved under.
    ///
    /// # Returns
    /// The assigned version.
    pub fn add_grant(&self, mut grant: PermissionGrant) -> u32 {
        let mut grants = self.grants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let versions = grants.entry(grant.subject.clone()).or_default();
        let version = versions.iter().map(|g| g.version).max().unwrap_or(0) + 1;
        grant.version = version;
        debug!(subject = %grant.subject, version, "Grant added");
        versions.push(grant);
        version
    }

    /// Finds the highest-versioned grant covering a worker for a subject.
    #[must_use]
    pub fn grant_for(
        &self,
        subject: &str,
        worker_id: &str,
        worker_capabilities: &BTreeSet<String>,
    ) -> Option<PermissionGrant> {
        let grants = self.grants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        grants
            .get(subject)?
            .iter()
            .filter(|g| g.covers(worker_id, worker_capabilities))
            .max_by_key(|g| g.version)
            .cloned()
    }

    /// Checks per-invocation limits without reserving anything. Used by the
    /// submission path to reject oversized tasks before any provider call.
    ///
    /// # Errors
    /// Returns `NoGrant`, `CapabilityNotGranted`, or `QuotaExceeded`.
    pub fn precheck_invocation(
        &self,
        subject: &str,
        worker_id: &str,
        worker_capabilities: &BTreeSet<String>,
        capability: &str,
        units: u64,
        estimated_cost: f64,
    ) -> Result<(), PermissionError> {
        let grant = self.grant_for(subject, worker_id, worker_capabilities).ok_or_else(|| {
            PermissionError::NoGrant { subject: subject.to_string(), worker_id: worker_id.to_string() }
        })?;

        if !grant.allows_capability(capability) {
            return Err(PermissionError::CapabilityNotGranted {
                subject: subject.to_string(),
                capability: capability.to_string(),
            });
        }

        if units > grant.quotas.max_units_per_invocation {
            return Err(PermissionError::QuotaExceeded {
                subject: subject.to_string(),
                reason: format!(
                    "requested {} units exceeds max_units_per_invocation {}",
                    units, grant.quotas.max_units_per_invocation
                ),
            });
        }

        if estimated_cost > grant.quotas.max_cost_per_invocation {
            return Err(PermissionError::QuotaExceeded {
                subject: subject.to_string(),
                reason: format!(
                    "estimated cost ${:.2} exceeds max_cost_per_invocation ${:.2}",
                    estimated_cost, grant.quotas.max_cost_per_invocation
                ),
            });
        }

        Ok(())
    }

    /// Opens an approval request for an invocation, reserving quota.
    ///
    /// Depending on the grant's policy the request may auto-approve (still
    /// logged); otherwise it parks in `PendingApproval` until resolved or
    /// expired.
    ///
    /// # Errors
    /// Returns `NoGrant`, `CapabilityNotGranted`, `QuotaExceeded`, or
    /// `Denied` (when the stage milestone was already denied).
    pub fn request_approval(&self, spec: &ApprovalSpec) -> Result<ApprovalTicket, PermissionError> {
        let grant = self
            .grant_for(&spec.subject, &spec.worker_id, &spec.worker_capabilities)
            .ok_or_else(|| PermissionError::NoGrant {
                subject: spec.subject.clone(),
                worker_id: spec.worker_id.clone(),
            })?;

        if !grant.allows_capability(&spec.capability) {
            return Err(PermissionError::CapabilityNotGranted {
                subject: spec.subject.clone(),
                capability: spec.capability.clone(),
            });
        }

        // Reservation and quota check are atomic; the reservation is released
        // on every non-approved outcome.
        self.accountant.check_and_reserve(
            &spec.subject,
            &grant.quotas,
            spec.units,
            spec.estimated_cost,
        )?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let mut request = ApprovalRequest::new(
            spec.invocation_id.clone(),
            spec.subject.clone(),
            spec.worker_id.clone(),
            spec.capability.clone(),
            spec.units,
            spec.estimated_cost,
            expires_at,
        );
        let request_id = request.id.clone();

        self.ledger.append(
            LedgerEntry::new(&spec.subject, LedgerEvent::QuotaReserved { units: spec.units })
                .with_workflow(&spec.workflow_id)
                .with_invocation(&spec.invocation_id)
                .with_approval(&request_id),
        );

        let auto_approval_reason = match grant.approval_policy {
            ApprovalPolicy::Never => Some("policy: never requires approval".to_string()),
            ApprovalPolicy::PerUnitThreshold(threshold) if spec.units <= threshold => {
                Some(format!("policy: below per-unit threshold {}", threshold))
            }
            ApprovalPolicy::PerMilestone => {
                let milestones =
                    self.milestones.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                match milestones.get(&(spec.workflow_id.clone(), spec.stage)) {
                    Some(ApprovalDecision::Approve) => {
                        Some(format!("policy: stage {} milestone already approved", spec.stage))
                    }
                    Some(ApprovalDecision::Deny) => {
                        drop(milestones);
                        return self.deny_at_creation(request, spec, "stage milestone denied");
                    }
                    None => None,
                }
            }
            _ => None,
        };

        let mut requests =
            self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(reason) = auto_approval_reason {
            self.ledger.append(
                LedgerEntry::new(
                    &spec.subject,
                    LedgerEvent::ApprovalTransition {
                        from: ApprovalState::Created.to_string(),
                        to: ApprovalState::Approved.to_string(),
                        reason: Some(reason.clone()),
                    },
                )
                .with_workflow(&spec.workflow_id)
                .with_invocation(&spec.invocation_id)
                .with_approval(&request_id),
            );
            self.ledger.append(
                LedgerEntry::new(&spec.subject, LedgerEvent::QuotaCommitted { units: spec.units })
                    .with_workflow(&spec.workflow_id)
                    .with_approval(&request_id),
            );

            request.transition(ApprovalState::Approved)?;
            request.resolution_reason = Some(reason);
            self.accountant.commit(&spec.subject, spec.units);
            info!(request_id = %request_id, subject = %spec.subject, "Approval auto-granted");

            requests.insert(
                request_id.clone(),
                RequestEntry {
                    request,
                    notify: Arc::new(Notify::new()),
                    policy: grant.approval_policy,
                    workflow_id: spec.workflow_id.clone(),
                    stage: spec.stage,
                },
            );

            return Ok(ApprovalTicket {
                request_id,
                auto_approved: true,
                approved_units: spec.units,
                expires_at,
            });
        }

        self.ledger.append(
            LedgerEntry::new(
                &spec.subject,
                LedgerEvent::ApprovalTransition {
                    from: ApprovalState::Created.to_string(),
                    to: ApprovalState::PendingApproval.to_string(),
                    reason: None,
                },
            )
            .with_workflow(&spec.workflow_id)
            .with_invocation(&spec.invocation_id)
            .with_approval(&request_id),
        );

        request.transition(ApprovalState::PendingApproval)?;
        debug!(request_id = %request_id, subject = %spec.subject, "Approval pending");

        requests.insert(
            request_id.clone(),
            RequestEntry {
                request,
                notify: Arc::new(Notify::new()),
                policy: grant.approval_policy,
                workflow_id: spec.workflow_id.clone(),
                stage: spec.stage,
            },
        );

        Ok(ApprovalTicket { request_id, auto_approved: false, approved_units: spec.units, expires_at })
    }

    /// Denies a freshly created request because its stage milestone was
    /// already denied. The reservation is released and the terminal request
    /// is kept for audit queries.
    fn deny_at_creation(
        &self,
        mut request: ApprovalRequest,
        spec: &ApprovalSpec,
        reason: &str,
    ) -> Result<ApprovalTicket, PermissionError> {
        let request_id = request.id.clone();

        for (to, ledger_reason) in [
            (ApprovalState::PendingApproval, None),
            (ApprovalState::Denied, Some(reason.to_string())),
        ] {
            self.ledger.append(
                LedgerEntry::new(
                    &spec.subject,
                    LedgerEvent::ApprovalTransition {
                        from: request.state.to_string(),
                        to: to.to_string(),
                        reason: ledger_reason,
                    },
                )
                .with_workflow(&spec.workflow_id)
                .with_invocation(&spec.invocation_id)
                .with_approval(&request_id),
            );
            request.transition(to)?;
        }
        request.resolution_reason = Some(reason.to_string());

        self.ledger.append(
            LedgerEntry::new(&spec.subject, LedgerEvent::QuotaReleased { units: spec.units })
                .with_workflow(&spec.workflow_id)
                .with_approval(&request_id),
        );
        self.accountant.release_reserved(&spec.subject, spec.units);

        let mut requests =
            self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        requests.insert(
            request_id.clone(),
            RequestEntry {
                request,
                notify: Arc::new(Notify::new()),
                policy: ApprovalPolicy::PerMilestone,
                workflow_id: spec.workflow_id.clone(),
                stage: spec.stage,
            },
        );

        Err(PermissionError::Denied { request_id, reason: Some(reason.to_string()) })
    }

    /// Waits until the request is approved, denied, or expired.
    ///
    /// This is a suspension point: the caller parks on the request's
    /// notifier and re-checks on wake-up or when the expiry deadline passes.
    ///
    /// # Errors
    /// Returns `Denied` or `Expired` for those resolutions.
    pub async fn wait_for_resolution(&self, request_id: &str) -> Result<(), PermissionError> {
        loop {
            let (notify, remaining) = {
                let mut requests =
                    self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let entry = requests.get_mut(request_id).ok_or_else(|| {
                    PermissionError::RequestNotFound { request_id: request_id.to_string() }
                })?;

                if entry.request.is_past_expiry(Utc::now()) {
                    self.expire_locked(entry);
                }

                match entry.request.state {
                    ApprovalState::Approved | ApprovalState::Consumed => return Ok(()),
                    ApprovalState::Denied => {
                        return Err(PermissionError::Denied {
                            request_id: request_id.to_string(),
                            reason: entry.request.resolution_reason.clone(),
                        });
                    }
                    ApprovalState::Expired => {
                        return Err(PermissionError::Expired {
                            request_id: request_id.to_string(),
                        });
                    }
                    ApprovalState::Created | ApprovalState::PendingApproval => {
                        let remaining = (entry.request.expires_at - Utc::now())
                            .to_std()
                            .unwrap_or(std::time::Duration::ZERO);
                        (Arc::clone(&entry.notify), remaining)
                    }
                }
            };

            // Wake on resolution or at the expiry deadline, whichever first.
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    /// Resolves a pending request.
    ///
    /// # Errors
    /// Returns `RequestNotFound` or `WrongState` if the request is not in
    /// `PendingApproval` (an expired-on-the-clock request counts as
    /// `Expired`, not pending).
    pub fn resolve(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
        resolved_by: &str,
        reason: Option<String>,
    ) -> Result<(), PermissionError> {
        let mut requests =
            self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = requests.get_mut(request_id).ok_or_else(|| {
            PermissionError::RequestNotFound { request_id: request_id.to_string() }
        })?;

        if entry.request.is_past_expiry(Utc::now()) {
            self.expire_locked(entry);
        }

        if entry.request.state != ApprovalState::PendingApproval {
            return Err(PermissionError::WrongState {
                request_id: request_id.to_string(),
                state: entry.request.state,
            });
        }

        let subject = entry.request.subject.clone();
        let units = entry.request.units;

        match decision {
            ApprovalDecision::Approve => {
                self.ledger.append(
                    LedgerEntry::new(
                        &subject,
                        LedgerEvent::ApprovalTransition {
                            from: entry.request.state.to_string(),
                            to: ApprovalState::Approved.to_string(),
                            reason: reason.clone(),
                        },
                    )
                    .with_workflow(&entry.workflow_id)
                    .with_invocation(&entry.request.invocation_id)
                    .with_approval(request_id),
                );
                self.ledger.append(
                    LedgerEntry::new(&subject, LedgerEvent::QuotaCommitted { units })
                        .with_workflow(&entry.workflow_id)
                        .with_approval(request_id),
                );

                entry.request.transition(ApprovalState::Approved)?;
                self.accountant.commit(&subject, units);
                info!(request_id = %request_id, resolved_by = %resolved_by, "Approval granted");
            }
            ApprovalDecision::Deny => {
                self.ledger.append(
                    LedgerEntry::new(
                        &subject,
                        LedgerEvent::ApprovalTransition {
                            from: entry.request.state.to_string(),
                            to: ApprovalState::Denied.to_string(),
                            reason: reason.clone(),
                        },
                    )
                    .with_workflow(&entry.workflow_id)
                    .with_invocation(&entry.request.invocation_id)
                    .with_approval(request_id),
                );
                self.ledger.append(
                    LedgerEntry::new(&subject, LedgerEvent::QuotaReleased { units })
                        .with_workflow(&entry.workflow_id)
                        .with_approval(request_id),
                );

                entry.request.transition(ApprovalState::Denied)?;
                self.accountant.release_reserved(&subject, units);
                info!(request_id = %request_id, resolved_by = %resolved_by, "Approval denied");
            }
        }

        entry.request.resolved_by = Some(resolved_by.to_string());
        entry.request.resolution_reason = reason;

        if entry.policy == ApprovalPolicy::PerMilestone {
            let mut milestones =
                self.milestones.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            milestones.insert((entry.workflow_id.clone(), entry.stage), decision);
        }

        entry.notify.notify_waiters();
        entry.notify.notify_one();
        Ok(())
    }

    /// Finalizes an approved request's charge from actual usage and marks it
    /// consumed.
    ///
    /// # Errors
    /// Returns `RequestNotFound` or `WrongState` if the request is not
    /// `Approved`.
    pub fn consume(
        &self,
        request_id: &str,
        actual_units: u64,
        actual_cost: f64,
    ) -> Result<(), PermissionError> {
        let mut requests =
            self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = requests.get_mut(request_id).ok_or_else(|| {
            PermissionError::RequestNotFound { request_id: request_id.to_string() }
        })?;

        if entry.request.state != ApprovalState::Approved {
            return Err(PermissionError::WrongState {
                request_id: request_id.to_string(),
                state: entry.request.state,
            });
        }

        let subject = entry.request.subject.clone();

        self.ledger.append(
            LedgerEntry::new(
                &subject,
                LedgerEvent::ChargeFinalized { units: actual_units, cost: actual_cost },
            )
            .with_workflow(&entry.workflow_id)
            .with_invocation(&entry.request.invocation_id)
            .with_approval(request_id),
        );
        self.ledger.append(
            LedgerEntry::new(
                &subject,
                LedgerEvent::ApprovalTransition {
                    from: entry.request.state.to_string(),
                    to: ApprovalState::Consumed.to_string(),
                    reason: None,
                },
            )
            .with_workflow(&entry.workflow_id)
            .with_invocation(&entry.request.invocation_id)
            .with_approval(request_id),
        );

        entry.request.transition(ApprovalState::Consumed)?;
        self.accountant.release_committed(&subject, entry.request.units);
        debug!(request_id = %request_id, actual_units, "Approval consumed");
        Ok(())
    }

    /// Cancels a request on workflow cancellation: pending requests expire,
    /// approved-but-unused requests expire and release their commitment.
    /// Terminal or unknown requests are left alone.
    pub fn cancel_request(&self, request_id: &str) {
        let mut requests =
            self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = requests.get_mut(request_id) else {
            return;
        };

        match entry.request.state {
            ApprovalState::PendingApproval | ApprovalState::Created => {
                self.expire_locked_with_reason(entry, "workflow cancelled");
            }
            ApprovalState::Approved => {
                let subject = entry.request.subject.clone();
                let units = entry.request.units;
                self.ledger.append(
                    LedgerEntry::new(
                        &subject,
                        LedgerEvent::ApprovalTransition {
                            from: entry.request.state.to_string(),
                            to: ApprovalState::Expired.to_string(),
                            reason: Some("workflow cancelled".to_string()),
                        },
                    )
                    .with_workflow(&entry.workflow_id)
                    .with_approval(request_id),
                );
                self.ledger.append(
                    LedgerEntry::new(&subject, LedgerEvent::QuotaReleased { units })
                        .with_workflow(&entry.workflow_id)
                        .with_approval(request_id),
                );
                if entry.request.transition(ApprovalState::Expired).is_ok() {
                    entry.request.resolution_reason = Some("workflow cancelled".to_string());
                    self.accountant.release_committed(&subject, units);
                }
                entry.notify.notify_waiters();
                entry.notify.notify_one();
            }
            _ => {}
        }
    }

    /// Expires every overdue pending request.
    ///
    /// # Returns
    /// The number of requests expired by this sweep.
    pub fn expire_overdue(&self) -> usize {
        let now = Utc::now();
        let mut requests =
            self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut expired = 0;
        for entry in requests.values_mut() {
            if entry.request.is_past_expiry(now) {
                self.expire_locked(entry);
                expired += 1;
            }
        }
        expired
    }

    /// Current state of a request, if it exists.
    #[must_use]
    pub fn request_state(&self, request_id: &str) -> Option<ApprovalState> {
        let requests = self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        requests.get(request_id).map(|entry| entry.request.state)
    }

    /// Whether a retry attempt with the projected cumulative units still fits
    /// the originally approved scope.
    #[must_use]
    pub fn scope_allows(&self, request_id: &str, projected_units: u64) -> bool {
        let requests = self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        requests.get(request_id).is_some_and(|entry| {
            entry.request.state == ApprovalState::Approved
                && projected_units <= entry.request.units
        })
    }

    /// Reserved/committed units outstanding for a subject (test hook and
    /// reporting surface).
    #[must_use]
    pub fn outstanding(&self, subject: &str) -> (u64, u64) {
        self.accountant.outstanding(subject)
    }

    fn expire_locked(&self, entry: &mut RequestEntry) {
        self.expire_locked_with_reason(entry, "approval timeout elapsed");
    }

    fn expire_locked_with_reason(&self, entry: &mut RequestEntry, reason: &str) {
        let subject = entry.request.subject.clone();
        let units = entry.request.units;
        let from = entry.request.state;

        self.ledger.append(
            LedgerEntry::new(
                &subject,
                LedgerEvent::ApprovalTransition {
                    from: from.to_string(),
                    to: ApprovalState::Expired.to_string(),
                    reason: Some(reason.to_string()),
                },
            )
            .with_workflow(&entry.workflow_id)
            .with_invocation(&entry.request.invocation_id)
            .with_approval(&entry.request.id),
        );
        self.ledger.append(
            LedgerEntry::new(&subject, LedgerEvent::QuotaReleased { units })
                .with_workflow(&entry.workflow_id)
                .with_approval(&entry.request.id),
        );

        // Created never parks waiters, but normalize it through Pending so
        // the machine sees a legal path.
        if entry.request.state == ApprovalState::Created {
            let _ = entry.request.transition(ApprovalState::PendingApproval);
        }
        if entry.request.transition(ApprovalState::Expired).is_ok() {
            entry.request.resolution_reason = Some(reason.to_string());
            self.accountant.release_reserved(&subject, units);
            warn!(request_id = %entry.request.id, reason = %reason, "Approval expired");
        }

        entry.notify.notify_waiters();
        entry.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApprovalConfig;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn manager_with_policy(policy: ApprovalPolicy) -> PermissionManager {
        let manager =
            PermissionManager::new(Arc::new(UsageLedger::new()), &ApprovalConfig::default());
        manager.add_grant(PermissionGrant::new(
            "user-1",
            GrantTarget::WorkerClass("article".to_string()),
            caps(&["article", "summary"]),
            Quotas::new(2_000, 10_000, 1.0),
            policy,
        ));
        manager
    }

    fn spec(units: u64) -> ApprovalSpec {
        ApprovalSpec {
            workflow_id: "wf-1".to_string(),
            invocation_id: "inv-1".to_string(),
            subject: "user-1".to_string(),
            worker_id: "drafter".to_string(),
            worker_capabilities: caps(&["article", "legal"]),
            capability: "article".to_string(),
            units,
            estimated_cost: 0.05,
            stage: 0,
        }
    }

    #[test]
    fn test_never_policy_auto_approves() {
        let manager = manager_with_policy(ApprovalPolicy::Never);
        let ticket = manager.request_approval(&spec(1_000)).unwrap();
        assert!(ticket.auto_approved);
        assert_eq!(manager.request_state(&ticket.request_id), Some(ApprovalState::Approved));
        assert_eq!(manager.outstanding("user-1"), (0, 1_000));
    }

    #[test]
    fn test_per_unit_threshold() {
        let manager = manager_with_policy(ApprovalPolicy::PerUnitThreshold(500));

        let small = manager.request_approval(&spec(400)).unwrap();
        assert!(small.auto_approved);

        let mut big_spec = spec(1_500);
        big_spec.invocation_id = "inv-2".to_string();
        let big = manager.request_approval(&big_spec).unwrap();
        assert!(!big.auto_approved);
        assert_eq!(manager.request_state(&big.request_id), Some(ApprovalState::PendingApproval));
    }

    #[test]
    fn test_resolve_approve_commits_quota() {
        let manager = manager_with_policy(ApprovalPolicy::Always);
        let ticket = manager.request_approval(&spec(1_000)).unwrap();
        assert_eq!(manager.outstanding("user-1"), (1_000, 0));

        manager.resolve(&ticket.request_id, ApprovalDecision::Approve, "alice", None).unwrap();
        assert_eq!(manager.request_state(&ticket.request_id), Some(ApprovalState::Approved));
        assert_eq!(manager.outstanding("user-1"), (0, 1_000));

        manager.consume(&ticket.request_id, 950, 0.04).unwrap();
        assert_eq!(manager.request_state(&ticket.request_id), Some(ApprovalState::Consumed));
        assert_eq!(manager.outstanding("user-1"), (0, 0));
    }

    #[test]
    fn test_resolve_deny_releases_quota() {
        let manager = manager_with_policy(ApprovalPolicy::Always);
        let ticket = manager.request_approval(&spec(1_000)).unwrap();

        manager
            .resolve(
                &ticket.request_id,
                ApprovalDecision::Deny,
                "alice",
                Some("too broad".to_string()),
            )
            .unwrap();
        assert_eq!(manager.request_state(&ticket.request_id), Some(ApprovalState::Denied));
        assert_eq!(manager.outstanding("user-1"), (0, 0));

        // Terminal: resolving again is a wrong-state error.
        let err = manager
            .resolve(&ticket.request_id, ApprovalDecision::Approve, "bob", None)
            .unwrap_err();
        assert!(matches!(err, PermissionError::WrongState { .. }));
    }

    #[test]
    fn test_no_grant_and_missing_capability() {
        let manager = manager_with_policy(ApprovalPolicy::Always);

        let mut unknown_subject = spec(100);
        unknown_subject.subject = "stranger".to_string();
        assert!(matches!(
            manager.request_approval(&unknown_subject),
            Err(PermissionError::NoGrant { .. })
        ));

        let mut wrong_capability = spec(100);
        wrong_capability.capability = "creative".to_string();
        assert!(matches!(
            manager.request_approval(&wrong_capability),
            Err(PermissionError::CapabilityNotGranted { .. })
        ));
    }

    #[test]
    fn test_approve_approve_race_cannot_overrun_quota() {
        // Daily cap 10_000; two 2_000-unit approvals fit, a third 7_000-unit
        // reservation must fail even while the others are only reserved.
        let manager = Arc::new(manager_with_policy(ApprovalPolicy::Always));

        let t1 = manager.request_approval(&spec(2_000)).unwrap();
        let mut s2 = spec(2_000);
        s2.invocation_id = "inv-2".to_string();
        let t2 = manager.request_approval(&s2).unwrap();

        manager.resolve(&t1.request_id, ApprovalDecision::Approve, "alice", None).unwrap();
        manager.resolve(&t2.request_id, ApprovalDecision::Approve, "alice", None).unwrap();

        // 4_000 committed; 3 more * 2_000 land exactly on the cap...
        for i in 3..=5 {
            let mut s = spec(2_000);
            s.invocation_id = format!("inv-{}", i);
            manager.request_approval(&s).unwrap();
        }
        // ...and the next one must be rejected.
        let mut s6 = spec(2_000);
        s6.invocation_id = "inv-6".to_string();
        assert!(matches!(
            manager.request_approval(&s6),
            Err(PermissionError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_approval() {
        let manager = Arc::new(manager_with_policy(ApprovalPolicy::Always));
        let ticket = manager.request_approval(&spec(1_000)).unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let request_id = ticket.request_id.clone();
            tokio::spawn(async move { manager.wait_for_resolution(&request_id).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        manager.resolve(&ticket.request_id, ApprovalDecision::Approve, "alice", None).unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_expired_after_timeout() {
        let config = ApprovalConfig { timeout_secs: 1 };
        let manager = PermissionManager::new(Arc::new(UsageLedger::new()), &config);
        manager.add_grant(PermissionGrant::new(
            "user-1",
            GrantTarget::WorkerClass("article".to_string()),
            caps(&["article"]),
            Quotas::new(2_000, 10_000, 1.0),
            ApprovalPolicy::Always,
        ));

        let ticket = manager.request_approval(&spec(1_000)).unwrap();
        let err = manager.wait_for_resolution(&ticket.request_id).await.unwrap_err();
        assert!(matches!(err, PermissionError::Expired { .. }));
        assert_eq!(manager.request_state(&ticket.request_id), Some(ApprovalState::Expired));
        // Reservation released.
        assert_eq!(manager.outstanding("user-1"), (0, 0));

        // Expiry is terminal: late resolution is a wrong-state error.
        let err = manager
            .resolve(&ticket.request_id, ApprovalDecision::Approve, "alice", None)
            .unwrap_err();
        assert!(matches!(err, PermissionError::WrongState { .. }));
    }

    #[test]
    fn test_milestone_decision_carries_across_stage() {
        let manager = manager_with_policy(ApprovalPolicy::PerMilestone);

        let first = manager.request_approval(&spec(500)).unwrap();
        assert!(!first.auto_approved);
        manager.resolve(&first.request_id, ApprovalDecision::Approve, "alice", None).unwrap();

        // Same stage: rides the milestone decision.
        let mut second = spec(500);
        second.invocation_id = "inv-2".to_string();
        let ticket = manager.request_approval(&second).unwrap();
        assert!(ticket.auto_approved);

        // New stage: needs a fresh decision.
        let mut third = spec(500);
        third.invocation_id = "inv-3".to_string();
        third.stage = 1;
        let ticket = manager.request_approval(&third).unwrap();
        assert!(!ticket.auto_approved);
    }

    #[test]
    fn test_milestone_denial_blocks_stage() {
        let manager = manager_with_policy(ApprovalPolicy::PerMilestone);

        let first = manager.request_approval(&spec(500)).unwrap();
        manager
            .resolve(&first.request_id, ApprovalDecision::Deny, "alice", None)
            .unwrap();

        let mut second = spec(500);
        second.invocation_id = "inv-2".to_string();
        let err = manager.request_approval(&second).unwrap_err();
        assert!(matches!(err, PermissionError::Denied { .. }));
        // The denied-at-creation request released its reservation.
        assert_eq!(manager.outstanding("user-1"), (0, 0));
    }

    #[test]
    fn test_scope_allows_within_approved_units() {
        let manager = manager_with_policy(ApprovalPolicy::Never);
        let ticket = manager.request_approval(&spec(1_000)).unwrap();

        assert!(manager.scope_allows(&ticket.request_id, 800));
        assert!(manager.scope_allows(&ticket.request_id, 1_000));
        assert!(!manager.scope_allows(&ticket.request_id, 1_001));
    }

    #[test]
    fn test_new_grant_supersedes_old() {
        let manager = manager_with_policy(ApprovalPolicy::Always);
        manager.add_grant(PermissionGrant::new(
            "user-1",
            GrantTarget::WorkerClass("article".to_string()),
            caps(&["article"]),
            Quotas::new(100, 10_000, 1.0),
            ApprovalPolicy::Always,
        ));

        // The tighter v2 grant now governs new requests.
        let err = manager.request_approval(&spec(1_000)).unwrap_err();
        assert!(matches!(err, PermissionError::QuotaExceeded { .. }));
    }
}
