//! Admission policy for new runs.
//!
//! The policy gate is a pure decision: given a candidate run, the active-run
//! counts of its project and the configured [`AdmissionPolicy`], it returns
//! [`AdmissionDecision::Allow`] or [`AdmissionDecision::Deny`]. A deny is
//! terminal for the candidate and is never retried.

use crate::config::AdmissionPolicy;
use crate::run::Run;

/// Load context for the candidate's project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectContext {
    /// The candidate's project, if any.
    pub project_id: Option<String>,
    /// Active runs currently in the project.
    pub active_runs_in_project: u64,
    /// Active runs overall.
    pub active_runs_total: u64,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The run may proceed.
    Allow,
    /// The run is refused.
    Deny {
        /// Why the run was refused.
        reason: DenialReason,
    },
}

impl AdmissionDecision {
    /// Returns true if admission is allowed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Reason for an admission denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The project is at its concurrency ceiling.
    ProjectCeiling {
        /// Current active runs in the project.
        current: u64,
        /// Maximum allowed.
        limit: u64,
    },
    /// The deployment is at its global concurrency ceiling.
    GlobalCeiling {
        /// Current active runs overall.
        current: u64,
        /// Maximum allowed.
        limit: u64,
    },
    /// The requested region is not allowed.
    RegionNotAllowed {
        /// The requested region.
        region: String,
    },
    /// The actor may not submit runs.
    ActorDenied {
        /// The refused actor.
        actor: String,
    },
    /// The retry chain is too long.
    RetryDepthExceeded {
        /// The candidate's retry depth.
        depth: u32,
        /// Maximum allowed.
        limit: u32,
    },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProjectCeiling { current, limit } => {
                write!(f, "project active run ceiling reached: {current}/{limit}")
            }
            Self::GlobalCeiling { current, limit } => {
                write!(f, "global active run ceiling reached: {current}/{limit}")
            }
            Self::RegionNotAllowed { region } => write!(f, "region {region} is not allowed"),
            Self::ActorDenied { actor } => write!(f, "actor {actor} may not submit runs"),
            Self::RetryDepthExceeded { depth, limit } => {
                write!(f, "retry depth {depth} exceeds limit {limit}")
            }
        }
    }
}

/// Decides whether a candidate run is admitted.
///
/// Implementations must be pure: no I/O, no side effects.
pub trait PolicyGate: Send + Sync {
    /// Evaluates admission for `candidate`.
    fn evaluate_admission(
        &self,
        candidate: &Run,
        context: &ProjectContext,
        policy: &AdmissionPolicy,
    ) -> AdmissionDecision;
}

/// The built-in rules gate.
///
/// Rules are checked in order: denied actors, region allow-list, retry depth,
/// project ceiling, global ceiling. The first failing rule wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RulesPolicyGate;

impl PolicyGate for RulesPolicyGate {
    fn evaluate_admission(
        &self,
        candidate: &Run,
        context: &ProjectContext,
        policy: &AdmissionPolicy,
    ) -> AdmissionDecision {
        let deny = |reason| AdmissionDecision::Deny { reason };

        if policy.denied_actors.iter().any(|a| *a == candidate.actor) {
            return deny(DenialReason::ActorDenied {
                actor: candidate.actor.clone(),
            });
        }

        if !policy.allowed_regions.is_empty() {
            if let Some(region) = &candidate.region {
                if !policy.allowed_regions.iter().any(|r| r == region) {
                    return deny(DenialReason::RegionNotAllowed {
                        region: region.clone(),
                    });
                }
            }
        }

        if candidate.retry_depth > policy.max_retry_depth {
            return deny(DenialReason::RetryDepthExceeded {
                depth: candidate.retry_depth,
                limit: policy.max_retry_depth,
            });
        }

        if let Some(limit) = policy.max_active_runs_per_project {
            if context.active_runs_in_project >= limit {
                return deny(DenialReason::ProjectCeiling {
                    current: context.active_runs_in_project,
                    limit,
                });
            }
        }

        if let Some(limit) = policy.max_active_runs {
            if context.active_runs_total >= limit {
                return deny(DenialReason::GlobalCeiling {
                    current: context.active_runs_total,
                    limit,
                });
            }
        }

        AdmissionDecision::Allow
    }
}
