//! Append-only run timeline.
//!
//! Every state transition and every notable fact about a run is recorded as a
//! [`RunEvent`]. Events are never mutated or deleted. Replay order is
//! `(created_at, sequence)` where `sequence` is assigned by the store on
//! insert and strictly increases within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trialrun_core::RunId;

use crate::run::RunStatus;

/// Well-known event kinds.
pub mod kinds {
    /// A run was claimed.
    pub const CREATED: &str = "created";
    /// A run was admitted and its IR persisted.
    pub const QUEUED: &str = "queued";
    /// The dispatch message was accepted.
    pub const DISPATCHED: &str = "dispatched";
    /// A worker acknowledged the dispatch.
    pub const RUNNING: &str = "running";
    /// The run succeeded.
    pub const SUCCEEDED: &str = "succeeded";
    /// The run failed.
    pub const FAILED: &str = "failed";
    /// The run was cancelled.
    pub const CANCELLED: &str = "cancelled";
    /// A step was reported.
    pub const STEP: &str = "step";
    /// A publish attempt failed.
    pub const DISPATCH_FAILED: &str = "dispatch-failed";
    /// The flake classifier labelled the run.
    pub const CLASSIFICATION: &str = "classification";
    /// Free-form log line.
    pub const LOG: &str = "log";
}

/// An event to be appended to a run's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRunEvent {
    /// Parent run.
    pub run_id: RunId,
    /// Step the event refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Event kind.
    pub kind: String,
    /// Opaque structured payload.
    pub payload: Value,
    /// When the event was produced.
    pub created_at: DateTime<Utc>,
}

impl NewRunEvent {
    /// Creates a run-scoped event.
    #[must_use]
    pub fn new(run_id: RunId, kind: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            step_id: None,
            kind: kind.into(),
            payload,
            created_at: now,
        }
    }

    /// Creates the event recording a status transition.
    ///
    /// The payload carries `from`, `to` and any fields of `detail` when it is
    /// a JSON object.
    #[must_use]
    pub fn transition(
        run_id: RunId,
        from: Option<RunStatus>,
        to: RunStatus,
        detail: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let mut payload = serde_json::Map::new();
        if let Some(from) = from {
            payload.insert("from".into(), Value::String(from.to_string()));
        }
        payload.insert("to".into(), Value::String(to.to_string()));
        if let Value::Object(extra) = detail {
            payload.extend(extra);
        }
        Self::new(run_id, to.event_kind(), Value::Object(payload), now)
    }

    /// Scopes the event to a step.
    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Seals the event with its store-assigned sequence.
    #[must_use]
    pub fn into_event(self, sequence: u64) -> RunEvent {
        RunEvent {
            run_id: self.run_id,
            sequence,
            step_id: self.step_id,
            kind: self.kind,
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

/// A persisted timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Parent run.
    pub run_id: RunId,
    /// Insertion sequence within the run, 1-indexed.
    pub sequence: u64,
    /// Step the event refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Event kind.
    pub kind: String,
    /// Opaque structured payload.
    pub payload: Value,
    /// When the event was produced.
    pub created_at: DateTime<Utc>,
}

/// Sorts events into replay order: creation time, then insertion sequence.
pub fn sort_for_replay(events: &mut [RunEvent]) {
    events.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.sequence.cmp(&b.sequence))
    });
}
