//! Failure injection tests: storage outages, bus outages and cancellation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use trialrun_flow::config::OrchestratorConfig;
use trialrun_flow::coordinator::{DispatchOutcome, Disposition};
use trialrun_flow::error::{Error, ErrorKind};
use trialrun_flow::run::{Run, RunStatus};
use trialrun_flow::store::{InsertOutcome, RunStore};
use trialrun_flow::timeline::{NewRunEvent, kinds};
use trialrun_test_utils::{
    RequestFactory, TestHarness, TracingMemoryBackend, assert_event_count,
    assert_failed_before_admission, assert_no_storage_access, assert_valid_status_path,
    init_test_logging,
};

fn deferred_dispatch() -> OrchestratorConfig {
    OrchestratorConfig {
        dispatch_on_create: false,
        ..OrchestratorConfig::default()
    }
}

fn run_id_of(err: &Error) -> trialrun_core::RunId {
    match err {
        Error::Cancelled { run_id } | Error::AdmissionDenied { run_id, .. } => *run_id,
        other => panic!("error does not name a run: {other}"),
    }
}

#[tokio::test]
async fn ir_storage_outage_fails_run() {
    init_test_logging();
    let harness = TestHarness::new();
    harness.storage.inject_failure("runs/");
    let coordinator = &harness.coordinator;

    let err = coordinator
        .create_run(RequestFactory::keyed("P1", "K1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    assert!(err.is_retryable());

    let runs = harness.store.all_runs().unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    let timeline = coordinator.get_timeline(&run.id).await.unwrap();
    assert_failed_before_admission(run, &timeline);
    assert!(
        run.last_error
            .as_deref()
            .is_some_and(|e| e.contains("IR persistence failed"))
    );
    assert!(harness.published_run_ids("P1").is_empty());
    assert_eq!(harness.storage.object_count(), 0);

    // The failed run keeps its key bound until retention lapses.
    harness.storage.clear_failures();
    let again = coordinator
        .create_run(RequestFactory::keyed("P1", "K1"))
        .await
        .unwrap();
    assert_eq!(again.disposition, Disposition::Duplicate);
    assert_eq!(again.run.id, run.id);
    assert_eq!(again.dispatch, DispatchOutcome::NotQueued);

    let fresh = coordinator
        .create_run(RequestFactory::keyed("P1", "K2"))
        .await
        .unwrap();
    assert_eq!(fresh.run.status, RunStatus::Dispatched);
}

#[tokio::test]
async fn oversized_ir_is_rejected_without_upload() {
    let config = OrchestratorConfig {
        ir_max_bytes: 16,
        ..OrchestratorConfig::default()
    };
    let harness = TestHarness::with_config(config);

    let err = harness
        .coordinator
        .create_run(RequestFactory::checkout("P1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageRejected);
    assert!(!err.is_retryable());
    assert!(harness.storage.uploads().is_empty());

    let run = harness.store.all_runs().unwrap().remove(0);
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn cancelled_before_persist_writes_nothing() {
    let harness = TestHarness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .coordinator
        .create_run_with_cancellation(RequestFactory::checkout("P1"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let run = harness.coordinator.get_run(&run_id_of(&err)).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.ir_storage_key.is_none());
    assert_no_storage_access(&harness.storage.operations(), "runs/");

    let timeline = harness.coordinator.get_timeline(&run.id).await.unwrap();
    assert_valid_status_path(&timeline, RunStatus::Cancelled);
}

#[tokio::test]
async fn cancellation_during_slow_persist_cancels_run() {
    let storage = TracingMemoryBackend::with_latency(Duration::from_millis(500));
    let harness = TestHarness::with_storage(OrchestratorConfig::default(), storage);
    let cancel = CancellationToken::new();

    let coordinator = harness.coordinator.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        coordinator
            .create_run_with_cancellation(RequestFactory::checkout("P1"), &token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    let run = harness.coordinator.get_run(&run_id_of(&err)).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(harness.published_run_ids("P1").is_empty());
}

#[tokio::test]
async fn bus_outage_leaves_run_queued_until_sweep() {
    let harness = TestHarness::new();
    let coordinator = &harness.coordinator;
    harness.bus.set_available(false);

    let outcome = coordinator
        .create_run(RequestFactory::checkout("P1"))
        .await
        .unwrap();
    assert_eq!(outcome.disposition, Disposition::Created);
    assert!(matches!(outcome.dispatch, DispatchOutcome::Unavailable { .. }));
    assert_eq!(outcome.run.status, RunStatus::Queued);
    assert_eq!(outcome.run.dispatch_attempts, 1);

    let timeline = coordinator.get_timeline(&outcome.run.id).await.unwrap();
    assert_event_count(&timeline, kinds::DISPATCH_FAILED, 1);

    let sweeper = harness.sweeper();
    let report = sweeper.sweep_once().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.failed_keys, vec!["P1".to_string()]);

    harness.bus.set_available(true);
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.dispatched, vec![outcome.run.id]);

    let run = coordinator.get_run(&outcome.run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Dispatched);
    assert_eq!(run.dispatch_attempts, 3);
    assert_eq!(harness.published_run_ids("P1"), vec![run.id]);
}

#[tokio::test]
async fn publish_failure_blocks_later_runs_of_the_same_key() {
    let harness = TestHarness::with_config(deferred_dispatch());
    let coordinator = &harness.coordinator;

    let mut p1 = Vec::new();
    for _ in 0..3 {
        let outcome = coordinator
            .create_run(RequestFactory::checkout("P1"))
            .await
            .unwrap();
        p1.push(outcome.run.id);
    }
    let p2 = coordinator
        .create_run(RequestFactory::checkout("P2"))
        .await
        .unwrap()
        .run
        .id;

    harness.bus.fail_next(1);
    let err = coordinator.dispatch_pending("P1").await.unwrap_err();
    assert!(matches!(
        err,
        Error::DispatchUnavailable { run_id: Some(id), .. } if id == p1[0]
    ));
    assert!(harness.published_run_ids("P1").is_empty());
    for id in &p1 {
        assert_eq!(
            coordinator.get_run(id).await.unwrap().status,
            RunStatus::Queued
        );
    }

    let other = coordinator.dispatch_pending("P2").await.unwrap();
    assert_eq!(other.dispatched, vec![p2]);

    let resumed = coordinator.dispatch_pending("P1").await.unwrap();
    assert_eq!(resumed.dispatched, p1);
    assert_eq!(harness.published_run_ids("P1"), p1);
}

#[tokio::test]
async fn sweeper_abandons_creation_left_by_crashed_creator() {
    let harness = TestHarness::new();
    let created_at = Utc::now() - TimeDelta::hours(1);

    let mut stuck = Run::new("checkout", "1.4.0", "alice", "P1", created_at).with_project("P1");
    stuck.idempotency_key = Some("K1".to_string());
    let event = NewRunEvent::transition(
        stuck.id,
        None,
        RunStatus::Created,
        json!({ "actor": "alice" }),
        created_at,
    );
    let inserted = harness
        .store
        .insert_run(stuck, vec![event], TimeDelta::hours(24), created_at)
        .await
        .unwrap();
    let InsertOutcome::Inserted(stuck) = inserted else {
        panic!("expected insert");
    };

    let report = harness.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.abandoned, vec![stuck.id]);

    let abandoned = harness.coordinator.get_run(&stuck.id).await.unwrap();
    assert_eq!(abandoned.status, RunStatus::Failed);
    assert_eq!(abandoned.last_error.as_deref(), Some("creation abandoned"));

    let again = harness.sweeper().sweep_once().await.unwrap();
    assert!(again.is_empty());
}
