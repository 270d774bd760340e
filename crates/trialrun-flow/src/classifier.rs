//! Flake classification of failed runs.
//!
//! A failed run is a flaky suspect iff some step failed with an error matching
//! a transient-failure signature AND at least one other step of the run
//! succeeded. Matching is a case-insensitive substring test against step
//! errors and against the `error` string of step-scoped timeline events.
//!
//! Classification is advisory: it is recorded on the timeline and may feed a
//! retry decision, but never changes the run's terminal status.

use serde::{Deserialize, Serialize};

use crate::run::{Run, RunStatus};
use crate::step::{RunStep, StepStatus};
use crate::timeline::RunEvent;

/// Verdict for a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// True if the failure looks transient.
    pub flaky: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// The signature that matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_signature: Option<String>,
    /// The step whose error matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_step: Option<String>,
}

/// Whether a failed run should be resubmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAdvice {
    /// Resubmit the run as a new retry run.
    Resubmit,
    /// Do not resubmit.
    DoNotRetry {
        /// Why resubmission is not advised.
        reason: String,
    },
}

/// Labels failed runs as flaky or genuine.
#[derive(Debug, Clone)]
pub struct FlakeClassifier {
    signatures: Vec<String>,
}

struct Candidate<'a> {
    step_id: &'a str,
    error: &'a str,
}

impl FlakeClassifier {
    /// Creates a classifier matching the given signatures.
    #[must_use]
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Returns the first signature contained in `error`, if any.
    #[must_use]
    pub fn match_signature(&self, error: &str) -> Option<&str> {
        let haystack = error.to_lowercase();
        self.signatures
            .iter()
            .find(|sig| haystack.contains(sig.as_str()))
            .map(String::as_str)
    }

    /// Classifies a failed run from its ordered steps and timeline.
    #[must_use]
    pub fn classify(&self, steps: &[RunStep], events: &[RunEvent]) -> Classification {
        let candidates = steps
            .iter()
            .filter_map(|s| {
                s.error.as_deref().map(|error| Candidate {
                    step_id: &s.step_id,
                    error,
                })
            })
            .chain(events.iter().filter_map(|e| {
                let step_id = e.step_id.as_deref()?;
                let error = e.payload.get("error")?.as_str()?;
                Some(Candidate { step_id, error })
            }));

        let mut first_match: Option<(&str, &str)> = None;
        for candidate in candidates {
            let Some(signature) = self.match_signature(candidate.error) else {
                continue;
            };
            let others_succeeded = steps
                .iter()
                .filter(|s| s.step_id != candidate.step_id && s.status == StepStatus::Succeeded)
                .count();
            if others_succeeded > 0 {
                return Classification {
                    flaky: true,
                    reason: format!(
                        "step {} failed with transient signature '{signature}' while {others_succeeded} other step(s) succeeded",
                        candidate.step_id
                    ),
                    matched_signature: Some(signature.to_string()),
                    failing_step: Some(candidate.step_id.to_string()),
                };
            }
            first_match.get_or_insert((candidate.step_id, signature));
        }

        match first_match {
            Some((step_id, signature)) => Classification {
                flaky: false,
                reason: format!(
                    "step {step_id} matched transient signature '{signature}' but no other step succeeded"
                ),
                matched_signature: Some(signature.to_string()),
                failing_step: Some(step_id.to_string()),
            },
            None => Classification {
                flaky: false,
                reason: "no transient failure signature matched".to_string(),
                matched_signature: None,
                failing_step: None,
            },
        }
    }

    /// Advises whether a classified run should be resubmitted.
    #[must_use]
    pub fn retry_advice(
        run: &Run,
        classification: &Classification,
        max_retry_depth: u32,
    ) -> RetryAdvice {
        if run.status != RunStatus::Failed {
            return RetryAdvice::DoNotRetry {
                reason: format!("run is {}, not FAILED", run.status),
            };
        }
        if !classification.flaky {
            return RetryAdvice::DoNotRetry {
                reason: format!("failure is not flaky: {}", classification.reason),
            };
        }
        if run.retry_depth >= max_retry_depth {
            return RetryAdvice::DoNotRetry {
                reason: format!(
                    "retry depth {} has reached the limit of {max_retry_depth}",
                    run.retry_depth
                ),
            };
        }
        RetryAdvice::Resubmit
    }
}

impl Default for FlakeClassifier {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_FLAKE_SIGNATURES)
    }
}
