//! Steps executed within a run.
//!
//! A step is created when a worker first reports it and may later move from
//! `RUNNING` to a terminal step status. Its execution order is fixed at
//! creation and unique within the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trialrun_core::RunId;

use crate::error::{Error, Result};

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// The worker started the step.
    Running,
    /// The step passed.
    Succeeded,
    /// The step failed.
    Failed,
    /// The step was not executed.
    Skipped,
}

impl StepStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// A worker's report about one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    /// Caller-assigned step identifier, unique within the run.
    pub step_id: String,
    /// Kind of step (e.g. `http`, `assert`).
    pub step_type: String,
    /// Execution order within the run.
    pub order: u32,
    /// Reported status.
    pub status: StepStatus,
    /// Result code, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i32>,
    /// Execution duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error message for failed steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepReport {
    /// Creates a report for a step that has started.
    #[must_use]
    pub fn started(step_id: impl Into<String>, step_type: impl Into<String>, order: u32) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: step_type.into(),
            order,
            status: StepStatus::Running,
            result_code: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Creates a report for a step that passed.
    #[must_use]
    pub fn succeeded(step_id: impl Into<String>, step_type: impl Into<String>, order: u32) -> Self {
        Self {
            status: StepStatus::Succeeded,
            ..Self::started(step_id, step_type, order)
        }
    }

    /// Creates a report for a step that failed with `error`.
    #[must_use]
    pub fn failed(
        step_id: impl Into<String>,
        step_type: impl Into<String>,
        order: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.into()),
            ..Self::started(step_id, step_type, order)
        }
    }

    /// Sets the result code.
    #[must_use]
    pub const fn with_result_code(mut self, code: i32) -> Self {
        self.result_code = Some(code);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// One unit of work within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    /// Parent run.
    pub run_id: RunId,
    /// Caller-assigned identifier, unique within the run.
    pub step_id: String,
    /// Kind of step.
    pub step_type: String,
    /// Execution order, unique within the run.
    pub order: u32,
    /// Current status.
    pub status: StepStatus,
    /// Result code, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i32>,
    /// Execution duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error message, if the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the step was first reported.
    pub created_at: DateTime<Utc>,
    /// When the step started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// What applying a [`StepReport`] to existing steps produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepChange {
    /// The report repeats what is already recorded.
    Unchanged(RunStep),
    /// A new step.
    Insert(RunStep),
    /// An existing step moved to a terminal status.
    Update(RunStep),
}

impl RunStep {
    /// Builds a new step from a report.
    #[must_use]
    pub fn from_report(run_id: RunId, report: &StepReport, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            step_id: report.step_id.clone(),
            step_type: report.step_type.clone(),
            order: report.order,
            status: report.status,
            result_code: report.result_code,
            duration_ms: report.duration_ms,
            error: report.error.clone(),
            created_at: now,
            started_at: Some(now),
            finished_at: report.status.is_terminal().then_some(now),
        }
    }

    /// Decides how `report` changes the step set of `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the report reuses another
    /// step's order, changes a step's order, or moves a terminal step.
    pub fn apply_report(
        run_id: RunId,
        existing: &[Self],
        report: &StepReport,
        now: DateTime<Utc>,
    ) -> Result<StepChange> {
        let event = format!("step {}", report.step_id);

        let Some(current) = existing.iter().find(|s| s.step_id == report.step_id) else {
            if let Some(other) = existing.iter().find(|s| s.order == report.order) {
                return Err(Error::invalid_transition(
                    "RUNNING",
                    event,
                    format!("order {} already used by step {}", report.order, other.step_id),
                ));
            }
            return Ok(StepChange::Insert(Self::from_report(run_id, report, now)));
        };

        if current.order != report.order {
            return Err(Error::invalid_transition(
                current.status,
                event,
                format!(
                    "step order is fixed at {} (reported {})",
                    current.order, report.order
                ),
            ));
        }

        if current.status == report.status {
            return Ok(StepChange::Unchanged(current.clone()));
        }

        if current.status.is_terminal() || !report.status.is_terminal() {
            return Err(Error::invalid_transition(
                current.status,
                event,
                format!("step cannot move from {} to {}", current.status, report.status),
            ));
        }

        let mut updated = current.clone();
        updated.status = report.status;
        updated.result_code = report.result_code.or(current.result_code);
        updated.duration_ms = report.duration_ms.or(current.duration_ms);
        updated.error.clone_from(&report.error);
        updated.finished_at = Some(now);
        Ok(StepChange::Update(updated))
    }
}
