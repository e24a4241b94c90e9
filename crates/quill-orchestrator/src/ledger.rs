//! Append-only usage and audit ledger.
//!
//! Every permission decision, provider call, and cost unit consumed is
//! recorded here before the corresponding state becomes visible anywhere
//! else (write-ahead ordering). Append is the only mutation; entries are
//! never edited or deleted. The permission manager sums committed charges
//! from this ledger for quota-window accounting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::debug;

/// One auditable event. State names are recorded as strings so the ledger
/// stays decoupled from the state machines it observes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A task was accepted and a workflow created for it.
    TaskSubmitted {
        /// External task identifier.
        task_id: String,
    },

    /// An approval request changed state.
    ApprovalTransition {
        /// State before the transition.
        from: String,
        /// State after the transition.
        to: String,
        /// Resolution reason, if any.
        reason: Option<String>,
    },

    /// Quota units were optimistically reserved for a pending approval.
    QuotaReserved {
        /// Reserved units.
        units: u64,
    },

    /// Reserved units were committed on approval.
    QuotaCommitted {
        /// Committed units.
        units: u64,
    },

    /// Reserved or committed units were released (denial, expiry, cancellation).
    QuotaReleased {
        /// Released units.
        units: u64,
    },

    /// An invocation attempt changed state.
    InvocationTransition {
        /// Attempt number (1-based; failover creates a new attempt).
        attempt: u32,
        /// State before the transition.
        from: String,
        /// State after the transition.
        to: String,
    },

    /// A provider call completed (successfully or not).
    ProviderCall {
        /// Attempt number the call belonged to.
        attempt: u32,
        /// Provider that was called.
        provider_id: String,
        /// Outcome summary ("ok" or the error rendering).
        outcome: String,
    },

    /// An invocation's quota charge was finalized from actual usage.
    ChargeFinalized {
        /// Units actually consumed.
        units: u64,
        /// Cost in USD.
        cost: f64,
    },

    /// A workflow reached a new status.
    WorkflowTransition {
        /// The new status name.
        status: String,
    },
}

/// Immutable audit record of one decision or execution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Global append sequence number; entries for one invocation are
    /// strictly ordered by it.
    pub seq: u64,
    /// When the entry was appended.
    pub recorded_at: DateTime<Utc>,
    /// Subject whose grant the event is attributed to.
    pub subject: String,
    /// Workflow the event belongs to, if any.
    pub workflow_id: Option<String>,
    /// Invocation the event belongs to, if any.
    pub invocation_id: Option<String>,
    /// Approval request the event belongs to, if any.
    pub approval_request_id: Option<String>,
    /// The event payload.
    pub event: LedgerEvent,
}

impl LedgerEntry {
    /// Creates an entry for a subject; the sequence number is assigned at
    /// append time.
    #[must_use]
    pub fn new(subject: impl Into<String>, event: LedgerEvent) -> Self {
        Self {
            seq: 0,
            recorded_at: Utc::now(),
            subject: subject.into(),
            workflow_id: None,
            invocation_id: None,
            approval_request_id: None,
            event,
        }
    }

    /// Attaches the workflow id.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Attaches the invocation id.
    #[must_use]
    pub fn with_invocation(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }

    /// Attaches the approval request id.
    #[must_use]
    pub fn with_approval(mut self, request_id: impl Into<String>) -> Self {
        self.approval_request_id = Some(request_id.into());
        self
    }
}

/// Append-only ledger store.
///
/// Concurrent appends are serialized by the write lock; queries take cheap
/// read locks and return cloned snapshots.
pub struct UsageLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLedger")
            .field("entry_count", &self.entries.try_read().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl UsageLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    /// Appends an entry, assigning its sequence number.
    ///
    /// # Returns
    /// The assigned sequence number.
    pub fn append(&self, mut entry: LedgerEntry) -> u64 {
        let mut entries = self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = entries.len() as u64 + 1;
        entry.seq = seq;
        entry.recorded_at = Utc::now();
        debug!(seq, subject = %entry.subject, event = ?entry.event, "Ledger append");
        entries.push(entry);
        seq
    }

    /// Returns all entries for a subject, in append order.
    pub fn entries_for_subject(&self, subject: &str) -> Vec<LedgerEntry> {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.iter().filter(|e| e.subject == subject).cloned().collect()
    }

    /// Returns all entries for an invocation, in append order.
    pub fn entries_for_invocation(&self, invocation_id: &str) -> Vec<LedgerEntry> {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.invocation_id.as_deref() == Some(invocation_id))
            .cloned()
            .collect()
    }

    /// Returns all entries recorded within a time range, in append order.
    pub fn entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<LedgerEntry> {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.recorded_at >= from && e.recorded_at <= to)
            .cloned()
            .collect()
    }

    /// Sums the units of finalized charges for a subject since a cutoff.
    ///
    /// This is the quota window accounting source: in-flight reservations
    /// and commitments are tracked by the quota accountant, finalized
    /// consumption lives here.
    pub fn charged_units_since(&self, subject: &str, since: DateTime<Utc>) -> u64 {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.subject == subject && e.recorded_at >= since)
            .filter_map(|e| match e.event {
                LedgerEvent::ChargeFinalized { units, .. } => Some(units),
                _ => None,
            })
            .sum()
    }

    /// Sums the units of finalized charges for a subject over the trailing
    /// 24-hour window.
    pub fn charged_units_last_day(&self, subject: &str) -> u64 {
        self.charged_units_since(subject, Utc::now() - Duration::hours(24))
    }

    /// Serializes every entry as JSON lines, for export to external
    /// compliance and reporting collaborators.
    ///
    /// # Errors
    /// Returns a serialization error if an entry cannot be encoded.
    pub fn export_json_lines(&self) -> Result<String, serde_json::Error> {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_monotone_sequence() {
        let ledger = UsageLedger::new();
        let first = ledger.append(LedgerEntry::new(
            "user-1",
            LedgerEvent::TaskSubmitted { task_id: "t-1".to_string() },
        ));
        let second = ledger.append(LedgerEntry::new(
            "user-1",
            LedgerEvent::QuotaReserved { units: 500 },
        ));
        assert!(second > first);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_entries_for_invocation_ordered() {
        let ledger = UsageLedger::new();
        for (attempt, to) in [(1, "executing"), (1, "failed"), (2, "executing"), (2, "succeeded")] {
            ledger.append(
                LedgerEntry::new(
                    "user-1",
                    LedgerEvent::InvocationTransition {
                        attempt,
                        from: "approved".to_string(),
                        to: to.to_string(),
                    },
                )
                .with_invocation("inv-1"),
            );
        }

        let entries = ledger.entries_for_invocation("inv-1");
        assert_eq!(entries.len(), 4);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn test_charged_units_window() {
        let ledger = UsageLedger::new();
        ledger.append(
            LedgerEntry::new("user-1", LedgerEvent::ChargeFinalized { units: 700, cost: 0.02 })
                .with_invocation("inv-1"),
        );
        ledger.append(
            LedgerEntry::new("user-1", LedgerEvent::ChargeFinalized { units: 300, cost: 0.01 })
                .with_invocation("inv-2"),
        );
        // Different subject is not counted
        ledger.append(
            LedgerEntry::new("user-2", LedgerEvent::ChargeFinalized { units: 999, cost: 0.03 })
                .with_invocation("inv-3"),
        );
        // Reservations are not finalized charges
        ledger.append(LedgerEntry::new("user-1", LedgerEvent::QuotaReserved { units: 400 }));

        assert_eq!(ledger.charged_units_last_day("user-1"), 1_000);
        assert_eq!(ledger.charged_units_last_day("user-2"), 999);
    }

    #[test]
    fn test_json_export() {
        let ledger = UsageLedger::new();
        ledger.append(
            LedgerEntry::new("user-1", LedgerEvent::ChargeFinalized { units: 700, cost: 0.02 })
                .with_invocation("inv-1"),
        );
        ledger.append(LedgerEntry::new(
            "user-1",
            LedgerEvent::TaskSubmitted { task_id: "t-1".to_string() },
        ));

        let exported = ledger.export_json_lines().unwrap();
        let lines: Vec<&str> = exported.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("charge_finalized"));
        assert!(lines[1].contains("task_submitted"));
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        use std::sync::Arc;

        let ledger = Arc::new(UsageLedger::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    ledger.append(LedgerEntry::new(
                        format!("user-{}", worker),
                        LedgerEvent::QuotaReserved { units: i },
                    ));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.len(), 400);
    }
}
