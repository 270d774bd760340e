//! Test-run lifecycle tracking.
//!
//! A run is one execution attempt of a test suite. Its status follows a
//! strict state machine:
//!
//! ```text
//! CREATED ──► QUEUED ──► DISPATCHED ──► RUNNING ──► SUCCEEDED
//!    │           │            │            ├──────► FAILED
//!    │           │            │            │
//!    │           └────────────┴────────────┴──────► CANCELLED
//!    └──────► FAILED | CANCELLED
//! ```
//!
//! `started_at` is set only on entering `RUNNING` and `finished_at` only on
//! entering a terminal status. The IR storage key is immutable once set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trialrun_core::RunId;

use crate::error::{Error, Result};

/// Run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Claimed, awaiting admission and IR persistence.
    Created,
    /// Admitted with a durable IR, awaiting dispatch.
    Queued,
    /// Dispatch message accepted by the bus.
    Dispatched,
    /// A worker acknowledged the dispatch and is executing steps.
    Running,
    /// All work completed successfully.
    Succeeded,
    /// Execution failed, admission was denied, or creation aborted.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl RunStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Created,
        Self::Queued,
        Self::Dispatched,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run counts against concurrency ceilings.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Dispatched | Self::Running)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::Queued | Self::Failed | Self::Cancelled),
            Self::Queued => matches!(target, Self::Dispatched | Self::Cancelled),
            Self::Dispatched => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::Cancelled),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns the lowercase name used for timeline event kinds.
    #[must_use]
    pub const fn event_kind(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Dispatched => write!(f, "DISPATCHED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// How the run was triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    /// User-initiated.
    #[default]
    Manual,
    /// Schedule-based.
    Scheduled,
    /// Triggered by an inbound webhook.
    Webhook,
    /// Resubmission of an earlier failed run.
    Retry,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "MANUAL"),
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Webhook => write!(f, "WEBHOOK"),
            Self::Retry => write!(f, "RETRY"),
        }
    }
}

/// One execution attempt of a test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// Owning project, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Suite being executed.
    pub suite_name: String,
    /// Version of the suite.
    pub suite_version: String,
    /// Current status.
    pub status: RunStatus,
    /// Who requested the run.
    pub actor: String,
    /// How the run was triggered.
    pub trigger: TriggerKind,
    /// Dispatch ordering key (project, or the configured default).
    pub ordering_key: String,
    /// Where the suite IR is stored, once durable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ir_storage_key: Option<String>,
    /// Caller-supplied deduplication key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Requested execution region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Free-form labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// The run this one retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<RunId>,
    /// Length of the retry chain (0 for original submissions).
    #[serde(default)]
    pub retry_depth: u32,
    /// Set when a failed run is classified as flaky.
    #[serde(default)]
    pub flaky_suspect: bool,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When a worker started executing the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Most recent error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Optimistic concurrency version, bumped by the store on every commit.
    #[serde(default)]
    pub version: u64,
    /// Position in the dispatch stream, assigned by the store when the run is claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_seq: Option<u64>,
    /// Number of publish attempts.
    #[serde(default)]
    pub dispatch_attempts: u32,
}

impl Run {
    /// Creates a new run in `CREATED`.
    #[must_use]
    pub fn new(
        suite_name: impl Into<String>,
        suite_version: impl Into<String>,
        actor: impl Into<String>,
        ordering_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::generate(),
            project_id: None,
            suite_name: suite_name.into(),
            suite_version: suite_version.into(),
            status: RunStatus::Created,
            actor: actor.into(),
            trigger: TriggerKind::Manual,
            ordering_key: ordering_key.into(),
            ir_storage_key: None,
            idempotency_key: None,
            region: None,
            labels: HashMap::new(),
            retry_of: None,
            retry_depth: 0,
            flaky_suspect: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            version: 0,
            dispatch_seq: None,
            dispatch_attempts: 0,
        }
    }

    /// Sets the owning project.
    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the trigger kind.
    #[must_use]
    pub const fn with_trigger(mut self, trigger: TriggerKind) -> Self {
        self.trigger = trigger;
        self
    }

    /// Returns true if the run is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a new status, maintaining the timestamp invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the transition is not allowed.
    pub fn transition_to(&mut self, target: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::invalid_transition(
                self.status,
                target.event_kind(),
                format!("{} cannot move to {target}", self.status),
            ));
        }

        match target {
            RunStatus::Running => self.started_at = Some(now),
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled => {
                self.finished_at = Some(now);
            }
            RunStatus::Created | RunStatus::Queued | RunStatus::Dispatched => {}
        }

        self.status = target;
        Ok(())
    }

    /// Records the IR storage key.
    ///
    /// Setting the same key again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a different key is already set.
    pub fn set_ir_storage_key(&mut self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        match &self.ir_storage_key {
            Some(existing) if *existing != key => Err(Error::validation(format!(
                "run {} already has IR key {existing}",
                self.id
            ))),
            _ => {
                self.ir_storage_key = Some(key);
                Ok(())
            }
        }
    }

    /// Returns true if the idempotency binding held by this run is still live at `now`.
    ///
    /// Non-terminal runs always hold their binding; terminal runs hold it for
    /// `retention` after finishing.
    #[must_use]
    pub fn holds_idempotency_binding(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> bool {
        if !self.is_terminal() {
            return true;
        }
        let finished = self.finished_at.unwrap_or(self.created_at);
        finished
            .checked_add_signed(retention)
            .is_none_or(|expires| expires > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run() -> Run {
        Run::new("checkout", "1.0.0", "alice", "P1", Utc::now()).with_project("P1")
    }

    #[test]
    fn trigger_display_matches_wire_form() {
        for trigger in [
            TriggerKind::Manual,
            TriggerKind::Scheduled,
            TriggerKind::Webhook,
            TriggerKind::Retry,
        ] {
            let wire = serde_json::to_value(trigger).unwrap();
            assert_eq!(wire, serde_json::Value::String(trigger.to_string()));
        }
        assert_eq!(TriggerKind::Retry.to_string(), "RETRY");
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert!(RunStatus::Created.can_transition_to(RunStatus::Queued));
        assert!(RunStatus::Created.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Dispatched));
        assert!(RunStatus::Dispatched.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));

        assert!(!RunStatus::Created.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Dispatched.can_transition_to(RunStatus::Succeeded));
    }

    #[test]
    fn terminal_statuses_allow_nothing() {
        for terminal in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for target in RunStatus::ALL {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn transition_sets_timestamps() {
        let mut run = new_run();
        let now = Utc::now();

        run.transition_to(RunStatus::Queued, now).unwrap();
        run.transition_to(RunStatus::Dispatched, now).unwrap();
        assert!(run.started_at.is_none());

        run.transition_to(RunStatus::Running, now).unwrap();
        assert_eq!(run.started_at, Some(now));
        assert!(run.finished_at.is_none());

        run.transition_to(RunStatus::Failed, now).unwrap();
        assert_eq!(run.finished_at, Some(now));
    }

    #[test]
    fn invalid_transition_leaves_run_unchanged() {
        let mut run = new_run();
        let before = run.clone();
        let err = run
            .transition_to(RunStatus::Succeeded, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(run, before);
    }

    #[test]
    fn ir_key_is_immutable() {
        let mut run = new_run();
        run.set_ir_storage_key("runs/a/suite").unwrap();
        run.set_ir_storage_key("runs/a/suite").unwrap();
        assert!(run.set_ir_storage_key("runs/b/suite").is_err());
        assert_eq!(run.ir_storage_key.as_deref(), Some("runs/a/suite"));
    }

    #[test]
    fn idempotency_binding_expires_after_retention() {
        let mut run = new_run();
        let now = Utc::now();
        let retention = chrono::Duration::hours(1);
        assert!(run.holds_idempotency_binding(now + chrono::Duration::days(30), retention));

        run.transition_to(RunStatus::Cancelled, now).unwrap();
        assert!(run.holds_idempotency_binding(now + chrono::Duration::minutes(59), retention));
        assert!(!run.holds_idempotency_binding(now + chrono::Duration::hours(2), retention));
    }

    #[test]
    fn run_serializes_camel_case() {
        let run = new_run();
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["suiteName"], "checkout");
        assert_eq!(json["status"], "CREATED");
        assert_eq!(json["trigger"], "MANUAL");
        assert!(json.get("irStorageKey").is_none());
    }
}
