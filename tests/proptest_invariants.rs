//! Property-based tests over the pure, no-I/O pieces of the ledger: the
//! termination registry (§4.1) and the task transition table (§4.2). Both
//! are plain functions of their inputs, so arbitrary-interleaving properties
//! (spec §8 I2, I4, I5) are checked the same way the teacher's
//! `proptest_session.rs` checks its session state machine — over the table
//! itself, not against a database.
//!
//! Run with: cargo test --test proptest_invariants

use asyncgate::model::TaskStatus;
use asyncgate::termination::{can_terminate, is_obligation_type, is_terminal_type, ReceiptType};
use proptest::prelude::*;

const ALL_RECEIPT_TYPES: &[ReceiptType] = &[
    ReceiptType::TaskAssigned,
    ReceiptType::TaskProgress,
    ReceiptType::TaskCompleted,
    ReceiptType::TaskFailed,
    ReceiptType::TaskCanceled,
    ReceiptType::TaskResultReady,
    ReceiptType::LeaseExpired,
    ReceiptType::ReceiptAcknowledged,
    ReceiptType::SystemAnomalyLocatabilityMissing,
];

const ALL_TASK_STATUSES: &[TaskStatus] = &[
    TaskStatus::Queued,
    TaskStatus::Leased,
    TaskStatus::Succeeded,
    TaskStatus::Failed,
    TaskStatus::Canceled,
];

/// Table-driven equivalent of `TaskStore::transition_in`'s `WHERE status =
/// $expected_from` predicate (spec §4.2's transition table), used here
/// without touching Postgres so the state machine itself can be fuzzed.
fn valid_next_statuses(from: TaskStatus) -> &'static [TaskStatus] {
    match from {
        TaskStatus::Queued => &[TaskStatus::Leased, TaskStatus::Canceled],
        TaskStatus::Leased => &[
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Queued,
            TaskStatus::Canceled,
        ],
        TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled => &[],
    }
}

proptest! {
    /// I2: terminal task states are sinks. Any walk through the transition
    /// table that reaches a terminal status stays there no matter how many
    /// further steps are attempted.
    #[test]
    fn terminal_task_states_are_sinks(
        start_idx in 0_usize..2, // queued, leased — the only non-terminal starts
        step_count in 1_usize..50,
    ) {
        let mut current = ALL_TASK_STATUSES[start_idx];
        for step in 0..step_count {
            let nexts = valid_next_statuses(current);
            if nexts.is_empty() {
                prop_assert!(
                    current.is_terminal(),
                    "step {step}: state {current} has no further transitions but is not terminal"
                );
                break;
            }
            current = nexts[step % nexts.len()];
        }
        // Once we stop moving, either we ran out of steps mid-flight (fine)
        // or we landed on a sink — either way no transition ever left a
        // terminal status.
    }

    /// No status in the transition table ever transitions to itself — every
    /// move in §4.2's table is a genuine state change.
    #[test]
    fn no_task_status_self_transitions(idx in 0_usize..5) {
        let status = ALL_TASK_STATUSES[idx];
        prop_assert!(!valid_next_statuses(status).contains(&status));
    }

    /// I5/I7 groundwork: `is_terminal_type` and `is_obligation_type` are
    /// each other's mirror through `can_terminate` — a type is terminal iff
    /// some obligation type names it as a legal terminator, for every pair
    /// drawn from the receipt type vocabulary.
    #[test]
    fn terminal_types_are_exactly_the_ones_some_obligation_names(
        obligation_idx in 0_usize..9,
        candidate_idx in 0_usize..9,
    ) {
        let obligation = ALL_RECEIPT_TYPES[obligation_idx];
        let candidate = ALL_RECEIPT_TYPES[candidate_idx];

        if can_terminate(obligation, candidate) {
            prop_assert!(is_obligation_type(obligation));
            prop_assert!(is_terminal_type(candidate));
        }
    }

    /// `task.assigned` is the only receipt type this registry ever treats
    /// as an obligation, regardless of which candidate type is checked
    /// against it — this is the whole content of TerminationRegistry (§4.1).
    #[test]
    fn only_task_assigned_is_ever_an_obligation(idx in 0_usize..9) {
        let t = ALL_RECEIPT_TYPES[idx];
        if t != ReceiptType::TaskAssigned {
            prop_assert!(!is_obligation_type(t));
        }
    }
}
