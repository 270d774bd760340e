//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a wired-up orchestration harness and request factories with
//! sensible defaults.

use std::sync::Arc;

use bytes::Bytes;
use trialrun_core::RunId;
use trialrun_flow::config::OrchestratorConfig;
use trialrun_flow::coordinator::{Coordinator, CreateRunRequest};
use trialrun_flow::dispatch::memory::InMemoryMessageBus;
use trialrun_flow::ir_store::BlobIrStore;
use trialrun_flow::run::RunStatus;
use trialrun_flow::store::memory::InMemoryRunStore;
use trialrun_flow::sweeper::DispatchSweeper;

use crate::storage::TracingMemoryBackend;

/// A coordinator wired to in-memory collaborators that tests can inspect.
pub struct TestHarness {
    /// The coordinator under test.
    pub coordinator: Arc<Coordinator>,
    /// Run store behind the coordinator.
    pub store: Arc<InMemoryRunStore>,
    /// Message bus behind the dispatcher.
    pub bus: Arc<InMemoryMessageBus>,
    /// Blob storage behind the IR store.
    pub storage: Arc<TracingMemoryBackend>,
}

impl TestHarness {
    /// Creates a harness with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    /// Creates a harness with `config`.
    #[must_use]
    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::with_storage(config, TracingMemoryBackend::new())
    }

    /// Creates a harness with `config` over `storage`.
    #[must_use]
    pub fn with_storage(config: OrchestratorConfig, storage: TracingMemoryBackend) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let storage = Arc::new(storage);
        let ir_store = BlobIrStore::new(
            storage.clone(),
            config.ir_container.clone(),
            config.ir_max_bytes,
        );
        let coordinator = Coordinator::new(config, store.clone(), Arc::new(ir_store), bus.clone())
            .expect("valid test config");
        Self {
            coordinator: Arc::new(coordinator),
            store,
            bus,
            storage,
        }
    }

    /// Returns a sweeper over the harness coordinator.
    #[must_use]
    pub fn sweeper(&self) -> DispatchSweeper {
        DispatchSweeper::new(self.coordinator.clone())
    }

    /// Creates a run and drives it to `RUNNING`.
    ///
    /// # Panics
    ///
    /// Panics if creation, dispatch or acknowledgement fails.
    pub async fn start_run(&self, request: CreateRunRequest) -> RunId {
        let outcome = self.coordinator.create_run(request).await.expect("create run");
        let run_id = outcome.run.id;
        if outcome.run.status == RunStatus::Queued {
            self.coordinator
                .dispatch_pending(&outcome.run.ordering_key)
                .await
                .expect("dispatch");
        }
        self.coordinator
            .acknowledge_dispatch(&run_id)
            .await
            .expect("acknowledge");
        run_id
    }

    /// Returns the run IDs the bus has accepted for `ordering_key`, in publish order.
    #[must_use]
    pub fn published_run_ids(&self, ordering_key: &str) -> Vec<RunId> {
        self.bus
            .published()
            .expect("bus lock")
            .iter()
            .filter(|d| d.ordering_key == ordering_key)
            .map(|d| d.message().expect("dispatch message").run_id)
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for run requests.
pub struct RequestFactory;

impl RequestFactory {
    /// Minimal IR document for a suite with `steps` steps.
    #[must_use]
    pub fn suite_ir(steps: usize) -> Bytes {
        let steps: Vec<String> = (0..steps)
            .map(|i| format!(r#"{{"id":"s{}","type":"http","order":{i}}}"#, i + 1))
            .collect();
        Bytes::from(format!(r#"{{"suite":"checkout","steps":[{}]}}"#, steps.join(",")))
    }

    /// A request for the checkout suite in `project_id`.
    #[must_use]
    pub fn checkout(project_id: &str) -> CreateRunRequest {
        CreateRunRequest::new("checkout", "1.4.0", "alice", Self::suite_ir(2)).with_project(project_id)
    }

    /// A request for the checkout suite in `project_id` keyed by `idempotency_key`.
    #[must_use]
    pub fn keyed(project_id: &str, idempotency_key: &str) -> CreateRunRequest {
        Self::checkout(project_id).with_idempotency_key(idempotency_key)
    }
}
