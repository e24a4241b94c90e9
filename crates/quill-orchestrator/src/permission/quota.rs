//! Atomic quota accounting.
//!
//! Reservations and commitments live in memory under one mutex; finalized
//! consumption lives in the ledger. The check-and-reserve path holds the lock
//! across both the check and the reservation, so two concurrent approval
//! requests can never both pass against a nearly exhausted quota.

use super::{grant::Quotas, PermissionError};
use crate::ledger::UsageLedger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
struct SubjectUsage {
    /// Units reserved for pending approval requests.
    reserved: u64,
    /// Units committed for approved, not-yet-finalized invocations.
    committed: u64,
}

/// Quota accountant shared by all approval requests.
pub struct QuotaAccountant {
    usage: Mutex<HashMap<String, SubjectUsage>>,
    ledger: Arc<UsageLedger>,
}

impl std::fmt::Debug for QuotaAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaAccountant").finish_non_exhaustive()
    }
}

impl QuotaAccountant {
    /// Creates an accountant backed by the given ledger for finalized charges.
    #[must_use]
    pub fn new(ledger: Arc<UsageLedger>) -> Self {
        Self { usage: Mutex::new(HashMap::new()), ledger }
    }

    /// Checks every quota limit and reserves the units atomically.
    ///
    /// # Errors
    /// Returns `PermissionError::QuotaExceeded` naming the violated limit;
    /// nothing is reserved in that case.
    pub fn check_and_reserve(
        &self,
        subject: &str,
        quotas: &Quotas,
        units: u64,
        estimated_cost: f64,
    ) -> Result<(), PermissionError> {
        if units > quotas.max_units_per_invocation {
            return Err(PermissionError::QuotaExceeded {
                subject: subject.to_string(),
                reason: format!(
                    "requested {} units exceeds max_units_per_invocation {}",
                    units, quotas.max_units_per_invocation
                ),
            });
        }

        if estimated_cost > quotas.max_cost_per_invocation {
            return Err(PermissionError::QuotaExceeded {
                subject: subject.to_string(),
                reason: format!(
                    "estimated cost ${:.2} exceeds max_cost_per_invocation ${:.2}",
                    estimated_cost, quotas.max_cost_per_invocation
                ),
            });
        }

        let mut usage = self.usage.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = usage.entry(subject.to_string()).or_default();
        let finalized = self.ledger.charged_units_last_day(subject);
        let projected = finalized + entry.reserved + entry.committed + units;
        if projected > quotas.max_units_per_day {
            return Err(PermissionError::QuotaExceeded {
                subject: subject.to_string(),
                reason: format!(
                    "daily window at {} of {} units; {} more would exceed it",
                    finalized + entry.reserved + entry.committed,
                    quotas.max_units_per_day,
                    units
                ),
            });
        }

        entry.reserved += units;
        debug!(subject = %subject, units, reserved = entry.reserved, "Quota reserved");
        Ok(())
    }

    /// Moves units from reserved to committed on approval.
    pub fn commit(&self, subject: &str, units: u64) {
        let mut usage = self.usage.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = usage.entry(subject.to_string()).or_default();
        if entry.reserved < units {
            warn!(subject = %subject, units, reserved = entry.reserved, "Commit exceeds reservation");
        }
        entry.reserved = entry.reserved.saturating_sub(units);
        entry.committed += units;
    }

    /// Releases a reservation on denial, expiry, or cancellation.
    pub fn release_reserved(&self, subject: &str, units: u64) {
        let mut usage = self.usage.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = usage.entry(subject.to_string()).or_default();
        if entry.reserved < units {
            warn!(subject = %subject, units, reserved = entry.reserved, "Release exceeds reservation");
        }
        entry.reserved = entry.reserved.saturating_sub(units);
    }

    /// Drops a commitment once the charge is finalized in the ledger (or the
    /// approved invocation was cancelled before executing).
    pub fn release_committed(&self, subject: &str, units: u64) {
        let mut usage = self.usage.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = usage.entry(subject.to_string()).or_default();
        if entry.committed < units {
            warn!(subject = %subject, units, committed = entry.committed, "Release exceeds commitment");
        }
        entry.committed = entry.committed.saturating_sub(units);
    }

    /// Current (reserved, committed) units for a subject.
    #[must_use]
    pub fn outstanding(&self, subject: &str) -> (u64, u64) {
        let usage = self.usage.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        usage.get(subject).map_or((0, 0), |entry| (entry.reserved, entry.committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas() -> Quotas {
        Quotas::new(2_000, 5_000, 1.0)
    }

    fn accountant() -> QuotaAccountant {
        QuotaAccountant::new(Arc::new(UsageLedger::new()))
    }

    #[test]
    fn test_per_invocation_unit_limit() {
        let acct = accountant();
        let err = acct.check_and_reserve("user-1", &quotas(), 2_500, 0.10).unwrap_err();
        assert!(err.to_string().contains("max_units_per_invocation"));
        assert_eq!(acct.outstanding("user-1"), (0, 0));
    }

    #[test]
    fn test_per_invocation_cost_limit() {
        let acct = accountant();
        let err = acct.check_and_reserve("user-1", &quotas(), 1_000, 1.20).unwrap_err();
        assert!(err.to_string().contains("max_cost_per_invocation"));
    }

    #[test]
    fn test_daily_window_counts_reservations_and_commitments() {
        let acct = accountant();
        acct.check_and_reserve("user-1", &quotas(), 2_000, 0.10).unwrap();
        acct.commit("user-1", 2_000);
        acct.check_and_reserve("user-1", &quotas(), 2_000, 0.10).unwrap();

        // 2000 committed + 2000 reserved; 1500 more would exceed 5000.
        let err = acct.check_and_reserve("user-1", &quotas(), 1_500, 0.10).unwrap_err();
        assert!(err.to_string().contains("daily window"));

        // 1000 still fits.
        acct.check_and_reserve("user-1", &quotas(), 1_000, 0.10).unwrap();
        assert_eq!(acct.outstanding("user-1"), (3_000, 2_000));
    }

    #[test]
    fn test_daily_window_includes_finalized_charges() {
        use crate::ledger::{LedgerEntry, LedgerEvent};

        let ledger = Arc::new(UsageLedger::new());
        ledger.append(LedgerEntry::new(
            "user-1",
            LedgerEvent::ChargeFinalized { units: 4_500, cost: 0.2 },
        ));

        let acct = QuotaAccountant::new(ledger);
        let err = acct.check_and_reserve("user-1", &quotas(), 1_000, 0.10).unwrap_err();
        assert!(err.to_string().contains("daily window"));
        acct.check_and_reserve("user-1", &quotas(), 500, 0.10).unwrap();
    }

    #[test]
    fn test_release_paths() {
        let acct = accountant();
        acct.check_and_reserve("user-1", &quotas(), 1_000, 0.10).unwrap();
        acct.release_reserved("user-1", 1_000);
        assert_eq!(acct.outstanding("user-1"), (0, 0));

        acct.check_and_reserve("user-1", &quotas(), 1_000, 0.10).unwrap();
        acct.commit("user-1", 1_000);
        acct.release_committed("user-1", 1_000);
        assert_eq!(acct.outstanding("user-1"), (0, 0));
    }

    #[test]
    fn test_concurrent_reservations_never_overrun() {
        let acct = Arc::new(accountant());
        let quotas = quotas();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let acct = Arc::clone(&acct);
            handles.push(std::thread::spawn(move || {
                acct.check_and_reserve("user-1", &quotas, 1_000, 0.10).is_ok()
            }));
        }

        let granted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        // Daily cap is 5000 units: exactly 5 of the 10 racing 1000-unit
        // reservations may win, never more.
        assert_eq!(granted, 5);
        assert_eq!(acct.outstanding("user-1"), (5_000, 0));
    }
}
