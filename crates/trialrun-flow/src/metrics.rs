//! Observability metrics for run orchestration.
//!
//! Metrics are recorded through the `metrics` crate facade; installing a
//! recorder (for example a Prometheus exporter) is left to the host binary.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `trialrun_flow_run_transitions_total` | Counter | `from_state`, `to_state` | Run status transitions |
//! | `trialrun_flow_active_runs` | Gauge | - | Runs in QUEUED, DISPATCHED or RUNNING |
//! | `trialrun_flow_dispatches_total` | Counter | `result` | Dispatch publish outcomes |
//! | `trialrun_flow_admissions_total` | Counter | `result` | Admission decisions |
//! | `trialrun_flow_classifications_total` | Counter | `result` | Flake classification verdicts |
//! | `trialrun_flow_create_duration_seconds` | Histogram | `result` | `create_run` latency |
//! | `trialrun_flow_sweep_duration_seconds` | Histogram | - | Sweeper pass latency |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trialrun_flow::metrics::FlowMetrics;
//! use trialrun_flow::run::RunStatus;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_transition(Some(RunStatus::Queued), RunStatus::Dispatched);
//! metrics.record_dispatch("success");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::policy::AdmissionDecision;
use crate::run::RunStatus;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Run status transitions.
    pub const RUN_TRANSITIONS_TOTAL: &str = "trialrun_flow_run_transitions_total";
    /// Gauge: Runs currently counted against concurrency ceilings.
    pub const ACTIVE_RUNS: &str = "trialrun_flow_active_runs";
    /// Counter: Dispatch publish outcomes.
    pub const DISPATCHES_TOTAL: &str = "trialrun_flow_dispatches_total";
    /// Counter: Admission decisions.
    pub const ADMISSIONS_TOTAL: &str = "trialrun_flow_admissions_total";
    /// Counter: Flake classification verdicts.
    pub const CLASSIFICATIONS_TOTAL: &str = "trialrun_flow_classifications_total";
    /// Histogram: `create_run` latency in seconds.
    pub const CREATE_DURATION_SECONDS: &str = "trialrun_flow_create_duration_seconds";
    /// Histogram: Sweeper pass latency in seconds.
    pub const SWEEP_DURATION_SECONDS: &str = "trialrun_flow_sweep_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous run status (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target run status (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Outcome label.
    pub const RESULT: &str = "result";
}

/// High-level interface for recording orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a run status transition and adjusts the active-runs gauge.
    ///
    /// `from` is `None` for a freshly created run.
    pub fn record_transition(&self, from: Option<RunStatus>, to: RunStatus) {
        let from_label = from.map_or("none", |s| s.event_kind());
        counter!(
            names::RUN_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_label,
            labels::TO_STATE => to.event_kind(),
        )
        .increment(1);

        let was_active = from.is_some_and(|s| s.is_active());
        match (was_active, to.is_active()) {
            (false, true) => gauge!(names::ACTIVE_RUNS).increment(1.0),
            (true, false) => gauge!(names::ACTIVE_RUNS).decrement(1.0),
            _ => {}
        }
    }

    /// Records a dispatch publish outcome (`success`, `failure`, `skipped`).
    pub fn record_dispatch(&self, result: &'static str) {
        counter!(names::DISPATCHES_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records an admission decision.
    pub fn record_admission(&self, decision: &AdmissionDecision) {
        let result = if decision.is_allowed() { "allow" } else { "deny" };
        counter!(names::ADMISSIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records a flake classification verdict.
    pub fn record_classification(&self, flaky: bool) {
        let result = if flaky { "flaky" } else { "genuine" };
        counter!(names::CLASSIFICATIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records `create_run` latency.
    pub fn observe_create_duration(&self, result: &'static str, duration: Duration) {
        histogram!(names::CREATE_DURATION_SECONDS, labels::RESULT => result)
            .record(duration.as_secs_f64());
    }

    /// Records sweeper pass latency.
    pub fn observe_sweep_duration(&self, duration: Duration) {
        histogram!(names::SWEEP_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use trialrun_flow::metrics::{FlowMetrics, TimingGuard};
///
/// let metrics = FlowMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_sweep_duration(duration);
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for sweeper passes.
#[must_use]
pub fn time_sweep() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| FlowMetrics.observe_sweep_duration(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DenialReason;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        let metrics = FlowMetrics::new();

        metrics.record_transition(None, RunStatus::Created);
        metrics.record_transition(Some(RunStatus::Created), RunStatus::Queued);
        metrics.record_transition(Some(RunStatus::Running), RunStatus::Failed);
        metrics.record_dispatch("success");
        metrics.record_admission(&AdmissionDecision::Allow);
        metrics.record_admission(&AdmissionDecision::Deny {
            reason: DenialReason::ProjectCeiling {
                current: 3,
                limit: 3,
            },
        });
        metrics.record_classification(true);
        metrics.observe_create_duration("created", Duration::from_millis(3));
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded_duration = None;

        {
            let _guard = TimingGuard::new(|d| {
                recorded_duration = Some(d);
            });
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(recorded_duration.is_some_and(|d| d >= Duration::from_millis(10)));
    }

    #[test]
    fn sweep_guard_records_on_drop() {
        let guard = time_sweep();
        std::thread::sleep(Duration::from_millis(2));
        assert!(guard.elapsed() >= Duration::from_millis(2));
    }
}
