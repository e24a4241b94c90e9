//! Permission grants and quotas.
//!
//! A grant ties a subject to a worker (or a worker class) with a capability
//! set, quota limits, and an approval policy. Grants are versioned; a new
//! grant supersedes older ones for future requests but never retroactively
//! alters invocations already approved under an earlier version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Quota limits attached to a grant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quotas {
    /// Maximum units a single invocation may request.
    pub max_units_per_invocation: u64,
    /// Maximum units chargeable over a rolling 24-hour window.
    pub max_units_per_day: u64,
    /// Maximum estimated cost (USD) a single invocation may carry.
    pub max_cost_per_invocation: f64,
}

impl Quotas {
    /// Creates quota limits.
    #[must_use]
    pub fn new(max_units_per_invocation: u64, max_units_per_day: u64, max_cost_per_invocation: f64) -> Self {
        Self { max_units_per_invocation, max_units_per_day, max_cost_per_invocation }
    }
}

/// When an invocation under a grant needs explicit human approval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Every invocation needs explicit approval.
    Always,
    /// Invocations at or below the unit threshold auto-approve; larger ones
    /// need explicit approval.
    PerUnitThreshold(u64),
    /// The first invocation of each workflow stage needs explicit approval;
    /// later invocations in the stage ride that decision.
    PerMilestone,
    /// No approval needed (quotas still enforced, decisions still logged).
    Never,
}

/// What a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantTarget {
    /// A single worker by id.
    Worker(String),
    /// Any worker carrying the given capability tag.
    WorkerClass(String),
}

/// A permission grant for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Subject the grant belongs to.
    pub subject: String,
    /// Worker or worker class the grant covers.
    pub target: GrantTarget,
    /// Capabilities the subject may exercise through covered workers.
    pub capabilities: BTreeSet<String>,
    /// Quota limits.
    pub quotas: Quotas,
    /// Approval policy.
    pub approval_policy: ApprovalPolicy,
    /// Version; assigned by the permission manager, higher supersedes lower.
    pub version: u32,
    /// When the grant was issued.
    pub issued_at: DateTime<Utc>,
}

impl PermissionGrant {
    /// Creates an unversioned grant; the permission manager assigns the
    /// version when the grant is added.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        target: GrantTarget,
        capabilities: BTreeSet<String>,
        quotas: Quotas,
        approval_policy: ApprovalPolicy,
    ) -> Self {
        Self {
            subject: subject.into(),
            target,
            capabilities,
            quotas,
            approval_policy,
            version: 0,
            issued_at: Utc::now(),
        }
    }

    /// Whether this grant covers the given worker.
    #[must_use]
    pub fn covers(&self, worker_id: &str, worker_capabilities: &BTreeSet<String>) -> bool {
        match &self.target {
            GrantTarget::Worker(id) => id == worker_id,
            GrantTarget::WorkerClass(tag) => worker_capabilities.contains(tag),
        }
    }

    /// Whether this grant allows exercising a capability.
    #[must_use]
    pub fn allows_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}
