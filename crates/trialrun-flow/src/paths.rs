//! Blob key layout for persisted suite IR.

use trialrun_core::RunId;

const RUNS_PREFIX: &str = "runs";
const SUITE_OBJECT: &str = "suite";

/// Returns the deterministic IR key for a run: `runs/{runId}/suite`.
#[must_use]
pub fn ir_key(run_id: &RunId) -> String {
    format!("{RUNS_PREFIX}/{run_id}/{SUITE_OBJECT}")
}
