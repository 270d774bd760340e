//! Pluggable persistence for runs, steps and timeline events.
//!
//! ## Design Principles
//!
//! - **Atomic claim**: idempotency dedup and the initial `CREATED` write are one operation
//! - **CAS commits**: status changes, step writes and their timeline events commit
//!   together under an optimistic version check, or not at all
//! - **Store-assigned order**: event sequences and dispatch positions come from the
//!   store, never from wall-clock time
//! - **Testability**: in-memory implementation for tests and single-process use

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use trialrun_core::RunId;

use crate::error::Result;
use crate::run::{Run, RunStatus};
use crate::step::RunStep;
use crate::timeline::{NewRunEvent, RunEvent};

/// Outcome of claiming an idempotency binding and inserting a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The run was inserted.
    Inserted(Run),
    /// A live run already holds the `(project, idempotency key)` binding.
    Existing(Run),
}

/// A step write carried by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepWrite {
    /// Append a new step. Rejected if its id or order is already used.
    Insert(RunStep),
    /// Replace an existing step with the same id and order.
    Update(RunStep),
}

/// An atomic update of one run.
#[derive(Debug, Clone)]
pub struct RunCommit {
    /// The new run state.
    pub run: Run,
    /// The version the caller read; the commit fails if the stored version differs.
    pub expected_version: u64,
    /// Optional step write.
    pub step: Option<StepWrite>,
    /// Timeline events appended with the commit.
    pub events: Vec<NewRunEvent>,
}

/// Result of a compare-and-swap commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Commit applied; carries the stored run.
    Success(Box<Run>),
    /// Run not found.
    NotFound,
    /// Version conflict (concurrent modification).
    VersionConflict {
        /// The actual version that was found.
        actual: u64,
    },
    /// The step write violates step uniqueness.
    StepConflict {
        /// What was violated.
        reason: String,
    },
}

impl CasResult {
    /// Returns true if the commit succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true if the run was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Active-run counts used for admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    /// Active runs in the candidate's project.
    pub in_project: u64,
    /// Active runs overall.
    pub total: u64,
}

/// Storage abstraction for run orchestration state.
///
/// ## Ordering
///
/// - Event sequences are 1-indexed and strictly increase per run
/// - `dispatch_seq` is assigned from a store-wide counter when a run is
///   inserted, so it reflects creation order, and never changes afterwards
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent coordinators.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Gets a run by ID.
    ///
    /// Returns `None` if the run does not exist.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Inserts a run, atomically claiming its idempotency binding.
    ///
    /// If the run carries an idempotency key and another run in the same
    /// project holds a live binding for it (non-terminal, or terminal for
    /// less than `retention` at `now`), nothing is written and
    /// `InsertOutcome::Existing` is returned.
    async fn insert_run(
        &self,
        run: Run,
        events: Vec<NewRunEvent>,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome>;

    /// Looks up the run currently bound to `(project_id, key)`.
    async fn find_by_idempotency_key(
        &self,
        project_id: Option<&str>,
        key: &str,
    ) -> Result<Option<Run>>;

    /// Applies a [`RunCommit`] if the stored version matches.
    async fn commit(&self, commit: RunCommit) -> Result<CasResult>;

    /// Appends a single event outside of a status change.
    ///
    /// Returns `None` if the run does not exist.
    async fn append_event(&self, event: NewRunEvent) -> Result<Option<RunEvent>>;

    /// Lists a run's events in replay order.
    async fn list_events(&self, run_id: &RunId) -> Result<Vec<RunEvent>>;

    /// Lists a run's steps by execution order.
    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<RunStep>>;

    /// Lists `CREATED` and `QUEUED` runs for an ordering key by `dispatch_seq`.
    async fn list_pending(&self, ordering_key: &str, limit: usize) -> Result<Vec<Run>>;

    /// Lists ordering keys that have `QUEUED` runs.
    async fn queued_ordering_keys(&self) -> Result<Vec<String>>;

    /// Lists runs in `status` created at or before `created_before`, oldest first.
    async fn list_by_status(
        &self,
        status: RunStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>>;

    /// Counts active runs overall and within `project_id`.
    async fn active_counts(&self, project_id: Option<&str>) -> Result<ActiveCounts>;
}
