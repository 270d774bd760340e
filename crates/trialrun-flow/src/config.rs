//! Orchestrator configuration.
//!
//! [`OrchestratorConfig`] is an explicit value threaded into the coordinator,
//! the policy gate and the dispatch sweeper. It is loaded from `TRIALRUN_*`
//! environment variables on top of defaults:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TRIALRUN_IR_CONTAINER` | `trialrun-ir` |
//! | `TRIALRUN_IR_MAX_BYTES` | 8 MiB |
//! | `TRIALRUN_IDEMPOTENCY_RETENTION_SECS` | `86400` |
//! | `TRIALRUN_DISPATCH_TOPIC` | `trialrun.dispatch` |
//! | `TRIALRUN_DEFAULT_ORDERING_KEY` | `global` |
//! | `TRIALRUN_DISPATCH_ON_CREATE` | `true` |
//! | `TRIALRUN_MAX_CONFLICT_RETRIES` | `8` |
//! | `TRIALRUN_SWEEP_INTERVAL_SECS` | `30` |
//! | `TRIALRUN_SWEEP_BATCH_SIZE` | `100` |
//! | `TRIALRUN_STALE_CREATED_SECS` | `900` |
//! | `TRIALRUN_FLAKE_SIGNATURES` | built-in list |
//! | `TRIALRUN_MAX_ACTIVE_RUNS` | unlimited |
//! | `TRIALRUN_MAX_ACTIVE_RUNS_PER_PROJECT` | unlimited |
//! | `TRIALRUN_ALLOWED_REGIONS` | any |
//! | `TRIALRUN_DENIED_ACTORS` | none |
//! | `TRIALRUN_MAX_RETRY_DEPTH` | `2` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transient-failure signatures used by the flake classifier when none are configured.
pub const DEFAULT_FLAKE_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "rate limit",
    "rate-limited",
    "too many requests",
];

/// Admission rules evaluated by the policy gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    /// Maximum active runs across all projects.
    pub max_active_runs: Option<u64>,
    /// Maximum active runs within one project.
    pub max_active_runs_per_project: Option<u64>,
    /// Regions a run may target. Empty admits any region.
    pub allowed_regions: Vec<String>,
    /// Actors that may not submit runs.
    pub denied_actors: Vec<String>,
    /// Maximum retry chain length.
    pub max_retry_depth: u32,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_active_runs: None,
            max_active_runs_per_project: None,
            allowed_regions: Vec::new(),
            denied_actors: Vec::new(),
            max_retry_depth: 2,
        }
    }
}

/// Configuration for the run orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Blob container that receives suite IR.
    pub ir_container: String,
    /// Largest IR payload accepted, in bytes.
    pub ir_max_bytes: usize,
    /// How long an idempotency key stays bound after its run turns terminal.
    pub idempotency_retention_secs: u64,
    /// Message bus topic for dispatch messages.
    pub dispatch_topic: String,
    /// Ordering key used for runs without a project.
    pub default_ordering_key: String,
    /// Publish immediately after a run is queued.
    pub dispatch_on_create: bool,
    /// Optimistic-concurrency attempts before returning `Conflict`.
    pub max_conflict_retries: u32,
    /// Period between dispatch sweeps.
    pub sweep_interval_secs: u64,
    /// Upper bound on runs examined per sweep pass.
    pub sweep_batch_size: usize,
    /// Age after which a run stuck in `CREATED` is abandoned.
    pub stale_created_secs: u64,
    /// Case-insensitive substrings that mark a step error as transient.
    pub flake_signatures: Vec<String>,
    /// Admission rules.
    pub admission: AdmissionPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ir_container: "trialrun-ir".to_string(),
            ir_max_bytes: 8 * 1024 * 1024,
            idempotency_retention_secs: 86_400,
            dispatch_topic: "trialrun.dispatch".to_string(),
            default_ordering_key: "global".to_string(),
            dispatch_on_create: true,
            max_conflict_retries: 8,
            sweep_interval_secs: 30,
            sweep_batch_size: 100,
            stale_created_secs: 900,
            flake_signatures: DEFAULT_FLAKE_SIGNATURES
                .iter()
                .map(ToString::to_string)
                .collect(),
            admission: AdmissionPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is present but cannot be
    /// parsed, or if the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration using `lookup` to resolve variable names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a value cannot be parsed, or if the
    /// resulting configuration is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(container) = env.string("TRIALRUN_IR_CONTAINER") {
            config.ir_container = container;
        }
        if let Some(max) = env.usize("TRIALRUN_IR_MAX_BYTES")? {
            config.ir_max_bytes = max;
        }
        if let Some(secs) = env.u64("TRIALRUN_IDEMPOTENCY_RETENTION_SECS")? {
            config.idempotency_retention_secs = secs;
        }
        if let Some(topic) = env.string("TRIALRUN_DISPATCH_TOPIC") {
            config.dispatch_topic = topic;
        }
        if let Some(key) = env.string("TRIALRUN_DEFAULT_ORDERING_KEY") {
            config.default_ordering_key = key;
        }
        if let Some(enabled) = env.bool("TRIALRUN_DISPATCH_ON_CREATE")? {
            config.dispatch_on_create = enabled;
        }
        if let Some(retries) = env.u32("TRIALRUN_MAX_CONFLICT_RETRIES")? {
            config.max_conflict_retries = retries;
        }
        if let Some(secs) = env.u64("TRIALRUN_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval_secs = secs;
        }
        if let Some(size) = env.usize("TRIALRUN_SWEEP_BATCH_SIZE")? {
            config.sweep_batch_size = size;
        }
        if let Some(secs) = env.u64("TRIALRUN_STALE_CREATED_SECS")? {
            config.stale_created_secs = secs;
        }
        if let Some(signatures) = env.list("TRIALRUN_FLAKE_SIGNATURES") {
            config.flake_signatures = signatures;
        }

        if let Some(max) = env.u64("TRIALRUN_MAX_ACTIVE_RUNS")? {
            config.admission.max_active_runs = Some(max);
        }
        if let Some(max) = env.u64("TRIALRUN_MAX_ACTIVE_RUNS_PER_PROJECT")? {
            config.admission.max_active_runs_per_project = Some(max);
        }
        if let Some(regions) = env.list("TRIALRUN_ALLOWED_REGIONS") {
            config.admission.allowed_regions = regions;
        }
        if let Some(actors) = env.list("TRIALRUN_DENIED_ACTORS") {
            config.admission.denied_actors = actors;
        }
        if let Some(depth) = env.u32("TRIALRUN_MAX_RETRY_DEPTH")? {
            config.admission.max_retry_depth = depth;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.ir_container.trim().is_empty() {
            return Err(Error::configuration("TRIALRUN_IR_CONTAINER must not be empty"));
        }
        if self.ir_max_bytes == 0 {
            return Err(Error::configuration("TRIALRUN_IR_MAX_BYTES must be positive"));
        }
        if self.dispatch_topic.trim().is_empty() {
            return Err(Error::configuration("TRIALRUN_DISPATCH_TOPIC must not be empty"));
        }
        if self.default_ordering_key.trim().is_empty() {
            return Err(Error::configuration(
                "TRIALRUN_DEFAULT_ORDERING_KEY must not be empty",
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(Error::configuration(
                "TRIALRUN_MAX_CONFLICT_RETRIES must be at least 1",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::configuration(
                "TRIALRUN_SWEEP_INTERVAL_SECS must be positive",
            ));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::configuration("TRIALRUN_SWEEP_BATCH_SIZE must be positive"));
        }
        if self.flake_signatures.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::configuration(
                "TRIALRUN_FLAKE_SIGNATURES must not contain empty entries",
            ));
        }
        if self.admission.max_active_runs == Some(0)
            || self.admission.max_active_runs_per_project == Some(0)
        {
            return Err(Error::configuration(
                "active run ceilings must be positive when set",
            ));
        }
        Ok(())
    }

    /// Returns the idempotency retention window.
    #[must_use]
    pub fn idempotency_retention(&self) -> chrono::Duration {
        seconds(self.idempotency_retention_secs)
    }

    /// Returns the dispatch sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Returns the age after which `CREATED` runs are abandoned.
    #[must_use]
    pub fn stale_created_after(&self) -> chrono::Duration {
        seconds(self.stale_created_secs)
    }

    /// Returns the ordering key for a run in `project_id`.
    #[must_use]
    pub fn ordering_key_for(&self, project_id: Option<&str>) -> String {
        project_id.map_or_else(|| self.default_ordering_key.clone(), ToString::to_string)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::TimeDelta::MAX)
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.string(name).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
