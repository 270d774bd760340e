//! Periodic dispatch sweeper.
//!
//! Runs left `QUEUED` (inline dispatch disabled or failed) are dispatched by
//! the sweeper, one ordering key at a time. Runs stuck in `CREATED` past
//! `stale_created_secs` (a creator that crashed between claim and queue) are
//! failed so their idempotency binding can expire and later runs of their
//! ordering key can be dispatched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use trialrun_core::RunId;

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::metrics::time_sweep;
use crate::run::RunStatus;

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Runs moved to `DISPATCHED`.
    pub dispatched: Vec<RunId>,
    /// Ordering keys whose dispatch stopped on a failure.
    pub failed_keys: Vec<String>,
    /// `CREATED` runs that were failed as abandoned.
    pub abandoned: Vec<RunId>,
}

impl SweepReport {
    /// Returns true if the pass did nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.failed_keys.is_empty() && self.abandoned.is_empty()
    }
}

/// Drives dispatch of queued runs and cleanup of abandoned creations.
#[derive(Debug, Clone)]
pub struct DispatchSweeper {
    coordinator: Arc<Coordinator>,
}

impl DispatchSweeper {
    /// Creates a sweeper over `coordinator`.
    #[must_use]
    pub const fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Runs one sweep pass now.
    ///
    /// # Errors
    ///
    /// Returns a store error if queued keys or stale runs cannot be listed.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_once_at(Utc::now()).await
    }

    /// Runs one sweep pass, judging staleness against `now`.
    ///
    /// A failure to dispatch one key is recorded in the report and does not
    /// stop the pass.
    ///
    /// # Errors
    ///
    /// Returns a store error if queued keys or stale runs cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let _timer = time_sweep();
        let config = self.coordinator.config();
        let store = self.coordinator.store();
        let mut report = SweepReport::default();

        // Abandon first: queued runs of a key wait behind its stale creations.
        let cutoff = now
            .checked_sub_signed(config.stale_created_after())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = store
            .list_by_status(RunStatus::Created, cutoff, config.sweep_batch_size)
            .await?;
        for run in stale {
            if self.coordinator.abandon_created(run.id).await? {
                report.abandoned.push(run.id);
            }
        }

        for key in store.queued_ordering_keys().await? {
            match self.coordinator.dispatch_key(&key).await {
                Ok(pass) => {
                    report.dispatched.extend(pass.dispatched);
                    if pass.blocked.is_some() {
                        report.failed_keys.push(key);
                    } else if let Some(run_id) = pass.waiting_on {
                        tracing::debug!(ordering_key = %key, run_id = %run_id, "key waits for a run still being created");
                    }
                }
                Err(err) => {
                    tracing::warn!(ordering_key = %key, error = %err, "sweep dispatch failed");
                    report.failed_keys.push(key);
                }
            }
        }

        Ok(report)
    }

    /// Sweeps every `sweep_interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.coordinator.config().sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.coordinator.config().sweep_interval_secs,
            "dispatch sweeper started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => match self.sweep_once().await {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        dispatched = report.dispatched.len(),
                        failed_keys = report.failed_keys.len(),
                        abandoned = report.abandoned.len(),
                        "sweep pass completed"
                    ),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "sweep pass failed"),
                },
            }
        }
        tracing::info!("dispatch sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::coordinator::{CreateRunRequest, DispatchOutcome};
    use crate::dispatch::memory::InMemoryMessageBus;
    use crate::ir_store::BlobIrStore;
    use crate::store::RunStore;
    use crate::store::memory::InMemoryRunStore;
    use crate::timeline::NewRunEvent;
    use trialrun_core::MemoryBackend;

    struct Fixture {
        sweeper: DispatchSweeper,
        coordinator: Arc<Coordinator>,
        store: Arc<InMemoryRunStore>,
        bus: Arc<InMemoryMessageBus>,
    }

    fn fixture() -> Fixture {
        let config = OrchestratorConfig {
            dispatch_on_create: false,
            ..OrchestratorConfig::default()
        };
        let store = Arc::new(InMemoryRunStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let ir_store = BlobIrStore::new(Arc::new(MemoryBackend::new()), "trialrun-ir", 1024);
        let coordinator = Arc::new(
            Coordinator::new(config, store.clone(), Arc::new(ir_store), bus.clone()).unwrap(),
        );
        Fixture {
            sweeper: DispatchSweeper::new(coordinator.clone()),
            coordinator,
            store,
            bus,
        }
    }

    fn request(project: &str) -> CreateRunRequest {
        CreateRunRequest::new("checkout", "1", "alice", "{}").with_project(project)
    }

    #[tokio::test]
    async fn sweep_dispatches_queued_runs_per_key() {
        let f = fixture();
        let a = f.coordinator.create_run(request("P1")).await.unwrap();
        let b = f.coordinator.create_run(request("P2")).await.unwrap();
        assert_eq!(a.dispatch, DispatchOutcome::Deferred);

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.dispatched.len(), 2);
        assert!(report.dispatched.contains(&a.run.id));
        assert!(report.dispatched.contains(&b.run.id));
        assert_eq!(f.bus.published().unwrap().len(), 2);

        assert!(f.sweeper.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_key_is_reported_and_retried() {
        let f = fixture();
        let run = f.coordinator.create_run(request("P1")).await.unwrap().run;
        f.bus.fail_next(1);

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.failed_keys, vec!["P1".to_string()]);
        assert!(report.dispatched.is_empty());

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.dispatched, vec![run.id]);
    }

    #[tokio::test]
    async fn stale_created_runs_are_abandoned() {
        let f = fixture();
        let now = Utc::now();
        let stuck = crate::run::Run::new("checkout", "1", "alice", "P1", now)
            .with_project("P1");
        let stuck_id = stuck.id;
        let event = NewRunEvent::transition(stuck_id, None, RunStatus::Created, serde_json::json!({}), now);
        f.store
            .insert_run(stuck, vec![event], chrono::Duration::hours(1), now)
            .await
            .unwrap();
        let behind = f.coordinator.create_run(request("P1")).await.unwrap().run;

        let fresh = f.sweeper.sweep_once_at(now).await.unwrap();
        assert!(fresh.abandoned.is_empty());
        assert!(fresh.dispatched.is_empty(), "queued run waits behind the earlier creation");
        assert!(fresh.failed_keys.is_empty());

        let later = now + chrono::Duration::hours(1);
        let report = f.sweeper.sweep_once_at(later).await.unwrap();
        assert_eq!(report.abandoned, vec![stuck_id]);
        assert_eq!(report.dispatched, vec![behind.id]);

        let run = f.coordinator.get_run(&stuck_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.as_deref(), Some("creation abandoned"));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let f = fixture();
        f.coordinator.create_run(request("P1")).await.unwrap();

        let shutdown = CancellationToken::new();
        let sweeper = f.sweeper.clone();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { sweeper.run(shutdown).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.bus.published().unwrap().len(), 1, "first tick fires immediately");
    }
}
