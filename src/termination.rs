//! The termination registry: a static truth table over receipt types,
//! analogous to the teacher's `tasks::reducer` state table but keyed on
//! receipt type rather than task status.
//!
//! `TERMINATES : receipt_type -> set<receipt_type>` has exactly one
//! obligation-creating row (`task.assigned`); every other receipt type maps
//! to the empty set. This table, not the task's own status column, is what
//! `ObligationQuery` and `ReceiptLedger::create` consult — it is the single
//! place that answers "can a receipt of type X close an obligation of type Y".

use std::fmt;

use serde::{Deserialize, Serialize};

/// `system.anomaly.*` is an open namespace in the wire vocabulary; the only
/// subtype the ledger itself emits is `locatability_missing`, so that's the
/// only one represented as a variant rather than carried as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    TaskAssigned,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskCanceled,
    TaskResultReady,
    LeaseExpired,
    ReceiptAcknowledged,
    SystemAnomalyLocatabilityMissing,
}

impl fmt::Display for ReceiptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiptType::TaskAssigned => "task.assigned",
            ReceiptType::TaskProgress => "task.progress",
            ReceiptType::TaskCompleted => "task.completed",
            ReceiptType::TaskFailed => "task.failed",
            ReceiptType::TaskCanceled => "task.canceled",
            ReceiptType::TaskResultReady => "task.result_ready",
            ReceiptType::LeaseExpired => "lease.expired",
            ReceiptType::ReceiptAcknowledged => "receipt.acknowledged",
            ReceiptType::SystemAnomalyLocatabilityMissing => "system.anomaly.locatability_missing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ReceiptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task.assigned" => Ok(ReceiptType::TaskAssigned),
            "task.progress" => Ok(ReceiptType::TaskProgress),
            "task.completed" => Ok(ReceiptType::TaskCompleted),
            "task.failed" => Ok(ReceiptType::TaskFailed),
            "task.canceled" => Ok(ReceiptType::TaskCanceled),
            "task.result_ready" => Ok(ReceiptType::TaskResultReady),
            "lease.expired" => Ok(ReceiptType::LeaseExpired),
            "receipt.acknowledged" => Ok(ReceiptType::ReceiptAcknowledged),
            "system.anomaly.locatability_missing" => {
                Ok(ReceiptType::SystemAnomalyLocatabilityMissing)
            }
            other => Err(format!("unknown receipt type: {other}")),
        }
    }
}

/// `TERMINATES` — the only row with a non-empty codomain is `task.assigned`.
fn terminates(t: ReceiptType) -> &'static [ReceiptType] {
    match t {
        ReceiptType::TaskAssigned => &[
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
        ],
        _ => &[],
    }
}

/// `ObligationTypes = { t : TERMINATES(t) != empty }`.
pub fn is_obligation_type(t: ReceiptType) -> bool {
    !terminates(t).is_empty()
}

/// `TerminalTypes = union(range(TERMINATES))` — the single source of truth
/// both `is_terminal_type` and the ledger's termination probes consult, so
/// a probe can never drift from the type semantics defined here.
pub fn terminal_types() -> &'static [ReceiptType] {
    &[
        ReceiptType::TaskCompleted,
        ReceiptType::TaskFailed,
        ReceiptType::TaskCanceled,
    ]
}

/// `TerminalTypes = union(range(TERMINATES))`.
pub fn is_terminal_type(t: ReceiptType) -> bool {
    terminal_types().contains(&t)
}

/// Whether a receipt of type `candidate`, parented on a receipt of type
/// `obligation`, discharges that obligation.
pub fn can_terminate(obligation: ReceiptType, candidate: ReceiptType) -> bool {
    terminates(obligation).contains(&candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_assigned_is_the_only_obligation_type() {
        assert!(is_obligation_type(ReceiptType::TaskAssigned));
        for t in [
            ReceiptType::TaskProgress,
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
            ReceiptType::TaskResultReady,
            ReceiptType::LeaseExpired,
            ReceiptType::ReceiptAcknowledged,
            ReceiptType::SystemAnomalyLocatabilityMissing,
        ] {
            assert!(!is_obligation_type(t), "{t} should not be an obligation type");
        }
    }

    #[test]
    fn terminal_outcomes_close_an_assignment() {
        for t in [
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
        ] {
            assert!(can_terminate(ReceiptType::TaskAssigned, t));
            assert!(is_terminal_type(t));
        }
        assert!(!can_terminate(
            ReceiptType::TaskAssigned,
            ReceiptType::TaskProgress
        ));
    }

    #[test]
    fn progress_and_lease_expired_are_non_terminal() {
        assert!(!is_terminal_type(ReceiptType::TaskProgress));
        assert!(!is_terminal_type(ReceiptType::LeaseExpired));
        assert!(terminates(ReceiptType::TaskProgress).is_empty());
        assert!(terminates(ReceiptType::LeaseExpired).is_empty());
    }

    #[test]
    fn anomaly_receipts_terminate_nothing() {
        assert!(terminates(ReceiptType::SystemAnomalyLocatabilityMissing).is_empty());
        assert!(!is_terminal_type(ReceiptType::SystemAnomalyLocatabilityMissing));
    }

    #[test]
    fn display_and_from_str_round_trip_every_variant() {
        for t in [
            ReceiptType::TaskAssigned,
            ReceiptType::TaskProgress,
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
            ReceiptType::TaskResultReady,
            ReceiptType::LeaseExpired,
            ReceiptType::ReceiptAcknowledged,
            ReceiptType::SystemAnomalyLocatabilityMissing,
        ] {
            let parsed: ReceiptType = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
    }
}
