//! # trialrun-flow
//!
//! Run lifecycle orchestration for test suites.
//!
//! This crate turns a run request into a durable, admitted, ordered and
//! observable run:
//!
//! - **Idempotent creation**: a `(project, idempotency key)` pair maps to one run
//! - **Admission**: a pure policy gate decides before the IR is committed
//! - **Durable IR**: suite IR is written once per run to blob storage
//! - **Ordered dispatch**: runs of one project are published in creation order
//! - **Timeline**: every transition and notable fact is an append-only event
//! - **Flake classification**: failed runs are labelled flaky or genuine
//!
//! ## Core Concepts
//!
//! - **Run**: one execution attempt of a suite, driven through a strict state machine
//! - **Step**: one unit of work within a run, reported by a worker
//! - **Event**: a timeline entry with a store-assigned sequence
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trialrun_core::MemoryBackend;
//! use trialrun_flow::prelude::*;
//! use trialrun_flow::dispatch::memory::InMemoryMessageBus;
//! use trialrun_flow::ir_store::BlobIrStore;
//! use trialrun_flow::store::memory::InMemoryRunStore;
//!
//! # async fn example() -> Result<()> {
//! let config = OrchestratorConfig::default();
//! let ir_store = BlobIrStore::new(
//!     Arc::new(MemoryBackend::new()),
//!     config.ir_container.clone(),
//!     config.ir_max_bytes,
//! );
//! let coordinator = Coordinator::new(
//!     config,
//!     Arc::new(InMemoryRunStore::new()),
//!     Arc::new(ir_store),
//!     Arc::new(InMemoryMessageBus::new()),
//! )?;
//!
//! let request = CreateRunRequest::new("checkout", "1.4.0", "alice", r#"{"steps":[]}"#)
//!     .with_project("P1")
//!     .with_idempotency_key("K1");
//! let outcome = coordinator.create_run(request).await?;
//! coordinator.acknowledge_dispatch(&outcome.run.id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod ir_store;
pub mod metrics;
pub mod paths;
pub mod policy;
pub mod run;
pub mod step;
pub mod store;
pub mod sweeper;
pub mod timeline;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::classifier::{Classification, FlakeClassifier, RetryAdvice};
    pub use crate::config::{AdmissionPolicy, OrchestratorConfig};
    pub use crate::coordinator::{
        CompletionOutcome, Coordinator, CreateRunOutcome, CreateRunRequest, DispatchOutcome,
        DispatchReport, Disposition,
    };
    pub use crate::dispatch::{DispatchMessage, Dispatcher, MessageBus};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::ir_store::{BlobIrStore, IrStore};
    pub use crate::metrics::FlowMetrics;
    pub use crate::policy::{AdmissionDecision, PolicyGate, ProjectContext, RulesPolicyGate};
    pub use crate::run::{Run, RunStatus, TriggerKind};
    pub use crate::step::{RunStep, StepReport, StepStatus};
    pub use crate::store::{CasResult, RunStore};
    pub use crate::sweeper::{DispatchSweeper, SweepReport};
    pub use crate::timeline::{NewRunEvent, RunEvent};
}
