//! Custom assertion helpers for integration tests.

use trialrun_flow::run::{Run, RunStatus};
use trialrun_flow::step::RunStep;
use trialrun_flow::timeline::{RunEvent, kinds};

use crate::storage::StorageOp;

/// Extracts the sequence of statuses recorded by a run's transition events.
#[must_use]
pub fn status_path(events: &[RunEvent]) -> Vec<RunStatus> {
    events
        .iter()
        .filter_map(|e| RunStatus::ALL.into_iter().find(|s| s.event_kind() == e.kind))
        .collect()
}

/// Asserts that a run's timeline records a valid lifecycle path.
///
/// # Panics
///
/// Panics if the path does not start at `CREATED`, takes a transition the
/// state machine forbids, or does not end at `expected_last`.
pub fn assert_valid_status_path(events: &[RunEvent], expected_last: RunStatus) {
    let path = status_path(events);
    assert_eq!(
        path.first(),
        Some(&RunStatus::Created),
        "path must start at CREATED: {path:?}"
    );
    for pair in path.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "invalid transition {} -> {} in {path:?}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(path.last(), Some(&expected_last), "unexpected final status in {path:?}");
}

/// Asserts that event sequences strictly increase from 1.
///
/// # Panics
///
/// Panics if sequences are not exactly `1..=n`.
pub fn assert_sequences_contiguous(events: &[RunEvent]) {
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected, "event sequences must be 1..=n");
}

/// Asserts that the timeline contains exactly `count` events of `kind`.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_event_count(events: &[RunEvent], kind: &str, count: usize) {
    let actual = events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(actual, count, "expected {count} {kind} events, found {actual}");
}

/// Asserts that no two steps share an order.
///
/// # Panics
///
/// Panics if an order is used twice.
pub fn assert_step_orders_unique(steps: &[RunStep]) {
    let mut orders: Vec<u32> = steps.iter().map(|s| s.order).collect();
    orders.sort_unstable();
    let before = orders.len();
    orders.dedup();
    assert_eq!(before, orders.len(), "step orders must be unique: {steps:?}");
}

/// Asserts that a run failed without ever being queued or dispatched.
///
/// # Panics
///
/// Panics if the run is not `FAILED` or its timeline shows admission.
pub fn assert_failed_before_admission(run: &Run, events: &[RunEvent]) {
    assert_eq!(run.status, RunStatus::Failed, "run should have failed");
    assert!(run.ir_storage_key.is_none(), "denied run must not have IR");
    assert_event_count(events, kinds::QUEUED, 0);
    assert_event_count(events, kinds::DISPATCHED, 0);
}

/// Asserts that no storage operation touched keys with `prefix`.
///
/// # Panics
///
/// Panics if an operation touched the prefix.
pub fn assert_no_storage_access(ops: &[StorageOp], prefix: &str) {
    for op in ops {
        let (StorageOp::Get { key, .. } | StorageOp::Head { key, .. } | StorageOp::Upload { key, .. }) =
            op;
        assert!(!key.starts_with(prefix), "unexpected storage access: {op:?}");
    }
}
