//! In-memory run store.
//!
//! This module provides [`InMemoryRunStore`], an implementation of the
//! [`RunStore`] trait backed by a single `RwLock`, which makes every trait
//! operation atomic.
//!
//! ## Limitations
//!
//! - **No durability**: all state is lost when the process exits
//! - **Single-process only**: state is not shared across process boundaries

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use trialrun_core::RunId;

use super::{ActiveCounts, CasResult, InsertOutcome, RunCommit, RunStore, StepWrite};
use crate::error::{Error, Result};
use crate::run::{Run, RunStatus};
use crate::step::RunStep;
use crate::timeline::{NewRunEvent, RunEvent, sort_for_replay};

type BindingKey = (Option<String>, String);

#[derive(Debug, Default)]
struct StoreState {
    runs: HashMap<RunId, Run>,
    steps: HashMap<RunId, Vec<RunStep>>,
    events: HashMap<RunId, Vec<RunEvent>>,
    bindings: HashMap<BindingKey, RunId>,
    next_dispatch_seq: u64,
}

impl StoreState {
    fn append_events(&mut self, run_id: RunId, events: Vec<NewRunEvent>) -> Vec<RunEvent> {
        let timeline = self.events.entry(run_id).or_default();
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            let sequence = timeline.last().map_or(1, |e| e.sequence + 1);
            let sealed = event.into_event(sequence);
            timeline.push(sealed.clone());
            appended.push(sealed);
        }
        appended
    }

    fn bound_run(&self, key: &BindingKey) -> Option<&Run> {
        self.bindings.get(key).and_then(|id| self.runs.get(id))
    }
}

/// In-memory store for tests and single-process deployments.
///
/// ## Example
///
/// ```rust
/// use trialrun_flow::store::memory::InMemoryRunStore;
///
/// let store = InMemoryRunStore::new();
/// assert_eq!(store.run_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    state: RwLock<StoreState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("run store lock poisoned")
}

fn binding_key(run: &Run) -> Option<BindingKey> {
    run.idempotency_key
        .as_ref()
        .map(|key| (run.project_id.clone(), key.clone()))
}

impl InMemoryRunStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.runs.len()
        };
        Ok(count)
    }

    /// Returns every stored run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn all_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = {
            let state = self.state.read().map_err(poison_err)?;
            state.runs.values().cloned().collect()
        };
        runs.sort_by_key(|r| (r.created_at, r.id));
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.runs.get(run_id).cloned()
        };
        Ok(result)
    }

    async fn insert_run(
        &self,
        mut run: Run,
        events: Vec<NewRunEvent>,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;

        if state.runs.contains_key(&run.id) {
            drop(state);
            return Err(Error::validation(format!("run {} already exists", run.id)));
        }

        let key = binding_key(&run);
        if let Some(key) = &key {
            if let Some(bound) = state.bound_run(key) {
                if bound.holds_idempotency_binding(now, retention) {
                    let existing = bound.clone();
                    drop(state);
                    return Ok(InsertOutcome::Existing(existing));
                }
            }
        }

        run.version = 1;
        state.next_dispatch_seq += 1;
        run.dispatch_seq = Some(state.next_dispatch_seq);
        if let Some(key) = key {
            state.bindings.insert(key, run.id);
        }
        state.runs.insert(run.id, run.clone());
        state.append_events(run.id, events);
        drop(state);

        Ok(InsertOutcome::Inserted(run))
    }

    async fn find_by_idempotency_key(
        &self,
        project_id: Option<&str>,
        key: &str,
    ) -> Result<Option<Run>> {
        let binding = (project_id.map(ToString::to_string), key.to_string());
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.bound_run(&binding).cloned()
        };
        Ok(result)
    }

    async fn commit(&self, commit: RunCommit) -> Result<CasResult> {
        let RunCommit {
            mut run,
            expected_version,
            step,
            events,
        } = commit;

        let mut state = self.state.write().map_err(poison_err)?;

        let Some(stored) = state.runs.get(&run.id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if stored.version != expected_version {
            let actual = stored.version;
            drop(state);
            return Ok(CasResult::VersionConflict { actual });
        }
        let stored_seq = stored.dispatch_seq;

        let steps = state.steps.entry(run.id).or_default();
        match &step {
            Some(StepWrite::Insert(new)) => {
                if let Some(clash) = steps
                    .iter()
                    .find(|s| s.step_id == new.step_id || s.order == new.order)
                {
                    let reason = if clash.step_id == new.step_id {
                        format!("step {} already exists", new.step_id)
                    } else {
                        format!("order {} already used by step {}", new.order, clash.step_id)
                    };
                    drop(state);
                    return Ok(CasResult::StepConflict { reason });
                }
            }
            Some(StepWrite::Update(updated)) => {
                if !steps
                    .iter()
                    .any(|s| s.step_id == updated.step_id && s.order == updated.order)
                {
                    let reason = format!("step {} not found at order {}", updated.step_id, updated.order);
                    drop(state);
                    return Ok(CasResult::StepConflict { reason });
                }
            }
            None => {}
        }

        match step {
            Some(StepWrite::Insert(new)) => {
                steps.push(new);
                steps.sort_by_key(|s| s.order);
            }
            Some(StepWrite::Update(updated)) => {
                if let Some(slot) = steps.iter_mut().find(|s| s.step_id == updated.step_id) {
                    *slot = updated;
                }
            }
            None => {}
        }

        run.version = expected_version + 1;
        run.dispatch_seq = stored_seq;

        state.runs.insert(run.id, run.clone());
        state.append_events(run.id, events);
        drop(state);

        Ok(CasResult::Success(Box::new(run)))
    }

    async fn append_event(&self, event: NewRunEvent) -> Result<Option<RunEvent>> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.runs.contains_key(&event.run_id) {
            drop(state);
            return Ok(None);
        }
        let run_id = event.run_id;
        let appended = state.append_events(run_id, vec![event]).pop();
        drop(state);
        Ok(appended)
    }

    async fn list_events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        let mut events = {
            let state = self.state.read().map_err(poison_err)?;
            state.events.get(run_id).cloned().unwrap_or_default()
        };
        sort_for_replay(&mut events);
        Ok(events)
    }

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<RunStep>> {
        let mut steps = {
            let state = self.state.read().map_err(poison_err)?;
            state.steps.get(run_id).cloned().unwrap_or_default()
        };
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    async fn list_pending(&self, ordering_key: &str, limit: usize) -> Result<Vec<Run>> {
        let mut pending: Vec<Run> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .runs
                .values()
                .filter(|r| {
                    matches!(r.status, RunStatus::Created | RunStatus::Queued)
                        && r.ordering_key == ordering_key
                })
                .cloned()
                .collect()
        };
        pending.sort_by_key(|r| (r.dispatch_seq.unwrap_or(u64::MAX), r.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn queued_ordering_keys(&self) -> Result<Vec<String>> {
        let keys: BTreeSet<String> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .runs
                .values()
                .filter(|r| r.status == RunStatus::Queued)
                .map(|r| r.ordering_key.clone())
                .collect()
        };
        Ok(keys.into_iter().collect())
    }

    async fn list_by_status(
        &self,
        status: RunStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .runs
                .values()
                .filter(|r| r.status == status && r.created_at <= created_before)
                .cloned()
                .collect()
        };
        runs.sort_by_key(|r| (r.created_at, r.id));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn active_counts(&self, project_id: Option<&str>) -> Result<ActiveCounts> {
        let counts = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .runs
                .values()
                .filter(|r| r.status.is_active())
                .fold(ActiveCounts::default(), |mut acc, r| {
                    acc.total += 1;
                    if r.project_id.as_deref() == project_id {
                        acc.in_project += 1;
                    }
                    acc
                })
        };
        Ok(counts)
    }
}
