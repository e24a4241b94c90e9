//! Approval request state machine.
//!
//! States: `Created → PendingApproval → {Approved | Denied | Expired}`, and
//! `Approved → Consumed` once the invocation's quota charge is finalized.
//! Terminal states are final; a retried invocation gets a new request.

use super::PermissionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Freshly created, not yet routed.
    Created,
    /// Waiting for an approver (or the expiry clock).
    PendingApproval,
    /// Approved; quota committed, execution may proceed.
    Approved,
    /// Explicitly rejected. Terminal.
    Denied,
    /// No resolution before `expires_at`. Equivalent to denial for execution,
    /// recorded distinctly. Terminal.
    Expired,
    /// Invocation finished and the charge was finalized. Terminal.
    Consumed,
}

impl ApprovalState {
    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Expired | Self::Consumed)
    }

    /// Whether the transition `self → to` is legal.
    #[must_use]
    pub fn can_transition_to(&self, to: ApprovalState) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::PendingApproval | Self::Approved)
                | (Self::PendingApproval, Self::Approved | Self::Denied | Self::Expired)
                | (Self::Approved, Self::Consumed | Self::Expired)
        )
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Consumed => "consumed",
        };
        write!(f, "{}", name)
    }
}

/// An approver's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Allow the invocation.
    Approve,
    /// Reject the invocation.
    Deny,
}

/// A pending authorization decision gating one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier.
    pub id: String,
    /// The invocation this request gates.
    pub invocation_id: String,
    /// Subject whose grant is charged.
    pub subject: String,
    /// Worker awaiting approval.
    pub worker_id: String,
    /// Capability being exercised.
    pub capability: String,
    /// Requested units.
    pub units: u64,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
    /// Current state.
    pub state: ApprovalState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry deadline while pending.
    pub expires_at: DateTime<Utc>,
    /// Who resolved the request, if anyone.
    pub resolved_by: Option<String>,
    /// Resolution reason, if any.
    pub resolution_reason: Option<String>,
}

impl ApprovalRequest {
    /// Creates a request in the `Created` state.
    #[must_use]
    pub fn new(
        invocation_id: impl Into<String>,
        subject: impl Into<String>,
        worker_id: impl Into<String>,
        capability: impl Into<String>,
        units: u64,
        estimated_cost: f64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("apr-{}", uuid::Uuid::new_v4()),
            invocation_id: invocation_id.into(),
            subject: subject.into(),
            worker_id: worker_id.into(),
            capability: capability.into(),
            units,
            estimated_cost,
            state: ApprovalState::Created,
            created_at: Utc::now(),
            expires_at,
            resolved_by: None,
            resolution_reason: None,
        }
    }

    /// Applies a state transition, rejecting illegal ones.
    ///
    /// # Errors
    /// Returns `PermissionError::InvalidTransition` for a transition the
    /// state machine does not allow (including any move out of a terminal
    /// state).
    pub fn transition(&mut self, to: ApprovalState) -> Result<(), PermissionError> {
        if !self.state.can_transition_to(to) {
            return Err(PermissionError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Whether the pending request has passed its expiry deadline.
    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.state == ApprovalState::PendingApproval && now >= self.expires_at
    }
}
