//! Run lifecycle coordinator.
//!
//! The [`Coordinator`] is the single entry point for run lifecycle operations:
//! creation (idempotency claim, admission, IR persistence), dispatch, worker
//! acknowledgement, step and completion reports, cancellation, timeline
//! queries, flake classification and retry resubmission.
//!
//! ## Consistency
//!
//! Every mutation of a run reads its current version, computes the next state
//! and commits it together with its timeline events through
//! [`RunStore::commit`]. Version conflicts are retried up to
//! `max_conflict_retries` times before [`Error::Conflict`] is returned. A
//! transition the state machine does not allow returns
//! [`Error::InvalidTransition`] and leaves the run unchanged.
//!
//! ## Redelivery
//!
//! Workers see dispatch messages at least once, so the worker-facing
//! operations are idempotent:
//!
//! - acknowledging a run that already started returns it unchanged
//! - reporting the same completion twice returns the run unchanged
//! - cancelling a cancelled run returns it unchanged
//! - repeating a step report that is already recorded appends nothing

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use trialrun_core::RunId;

use crate::classifier::{Classification, FlakeClassifier, RetryAdvice};
use crate::config::OrchestratorConfig;
use crate::dispatch::{Dispatcher, MessageBus};
use crate::error::{Error, Result};
use crate::ir_store::IrStore;
use crate::metrics::FlowMetrics;
use crate::policy::{AdmissionDecision, PolicyGate, ProjectContext, RulesPolicyGate};
use crate::run::{Run, RunStatus, TriggerKind};
use crate::step::{RunStep, StepChange, StepReport};
use crate::store::{CasResult, InsertOutcome, RunCommit, RunStore, StepWrite};
use crate::timeline::{NewRunEvent, RunEvent, kinds, sort_for_replay};

/// Request to create a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRunRequest {
    /// Owning project, if any. Also the dispatch ordering key.
    pub project_id: Option<String>,
    /// Suite to execute.
    pub suite_name: String,
    /// Version of the suite.
    pub suite_version: String,
    /// Who requested the run.
    pub actor: String,
    /// How the run was triggered.
    pub trigger: TriggerKind,
    /// Caller-supplied deduplication key, scoped to the project.
    pub idempotency_key: Option<String>,
    /// Requested execution region.
    pub region: Option<String>,
    /// Free-form labels.
    pub labels: HashMap<String, String>,
    /// Compiled suite IR (JSON).
    pub ir: Bytes,
    retry_of: Option<RunId>,
    retry_depth: u32,
}

impl CreateRunRequest {
    /// Creates a manual request without project or idempotency key.
    #[must_use]
    pub fn new(
        suite_name: impl Into<String>,
        suite_version: impl Into<String>,
        actor: impl Into<String>,
        ir: impl Into<Bytes>,
    ) -> Self {
        Self {
            project_id: None,
            suite_name: suite_name.into(),
            suite_version: suite_version.into(),
            actor: actor.into(),
            trigger: TriggerKind::Manual,
            idempotency_key: None,
            region: None,
            labels: HashMap::new(),
            ir: ir.into(),
            retry_of: None,
            retry_depth: 0,
        }
    }

    /// Sets the owning project.
    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the trigger kind.
    #[must_use]
    pub const fn with_trigger(mut self, trigger: TriggerKind) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the requested region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("suite name", self.suite_name.as_str()),
            ("suite version", self.suite_version.as_str()),
            ("actor", self.actor.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{field} must not be empty")));
            }
        }
        if self.project_id.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(Error::validation("project id must not be empty when set"));
        }
        if self
            .idempotency_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            return Err(Error::validation("idempotency key must not be empty when set"));
        }
        if self.ir.is_empty() {
            return Err(Error::validation("IR payload is empty"));
        }
        serde_json::from_slice::<serde::de::IgnoredAny>(&self.ir)
            .map_err(|e| Error::validation(format!("IR payload is not valid JSON: {e}")))?;
        Ok(())
    }
}

/// Whether `create_run` made a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A new run was created.
    Created,
    /// The idempotency key was bound to a live run, which is returned instead.
    Duplicate,
}

/// What happened to dispatch during `create_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The run's dispatch message was accepted by the bus.
    Dispatched,
    /// The run is queued and left for a later dispatch pass, either because
    /// inline dispatch is off or an earlier run of its key is still being created.
    Deferred,
    /// Publishing failed; the run stays `QUEUED` for a later attempt.
    Unavailable {
        /// Why dispatch did not happen.
        reason: String,
    },
    /// The run is not awaiting dispatch.
    NotQueued,
}

impl DispatchOutcome {
    fn observed(run: &Run, blocked: Option<String>) -> Self {
        match run.status {
            RunStatus::Queued => blocked.map_or(Self::Deferred, |reason| Self::Unavailable { reason }),
            RunStatus::Dispatched | RunStatus::Running => Self::Dispatched,
            _ if run.started_at.is_some() => Self::Dispatched,
            _ => Self::NotQueued,
        }
    }
}

/// Result of `create_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRunOutcome {
    /// The created (or existing) run.
    pub run: Run,
    /// Whether the run is new.
    pub disposition: Disposition,
    /// Dispatch result.
    pub dispatch: DispatchOutcome,
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Every step passed.
    Success,
    /// The run failed.
    Failure {
        /// Failure description.
        error: String,
    },
}

impl CompletionOutcome {
    /// Creates a failure outcome.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    const fn status(&self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Succeeded,
            Self::Failure { .. } => RunStatus::Failed,
        }
    }
}

/// A publish failure that stopped dispatch of an ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedDispatch {
    /// The run whose publish failed.
    pub run_id: RunId,
    /// Why the publish failed.
    pub reason: String,
}

/// Result of one dispatch pass over an ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// The ordering key.
    pub ordering_key: String,
    /// Runs moved to `DISPATCHED`, in publish order.
    pub dispatched: Vec<RunId>,
    /// The failure that stopped the pass, if any.
    pub blocked: Option<BlockedDispatch>,
    /// An earlier run of the key still in `CREATED` that the pass stopped at.
    pub waiting_on: Option<RunId>,
}

/// A run state to commit, with its step write and events.
struct Change {
    run: Run,
    step: Option<StepWrite>,
    events: Vec<NewRunEvent>,
}

impl Change {
    fn new(run: Run, events: Vec<NewRunEvent>) -> Self {
        Self {
            run,
            step: None,
            events,
        }
    }
}

/// Result of a CAS apply loop.
struct Applied {
    run: Run,
    changed: bool,
}

/// Coordinates the run lifecycle.
pub struct Coordinator {
    config: OrchestratorConfig,
    store: Arc<dyn RunStore>,
    ir_store: Arc<dyn IrStore>,
    dispatcher: Dispatcher,
    policy: Arc<dyn PolicyGate>,
    classifier: FlakeClassifier,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator using the built-in rules policy gate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn RunStore>,
        ir_store: Arc<dyn IrStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(bus, config.dispatch_topic.clone());
        let classifier = FlakeClassifier::new(&config.flake_signatures);
        Ok(Self {
            config,
            store,
            ir_store,
            dispatcher,
            policy: Arc::new(RulesPolicyGate),
            classifier,
            metrics: FlowMetrics::new(),
        })
    }

    /// Replaces the policy gate.
    #[must_use]
    pub fn with_policy_gate(mut self, policy: Arc<dyn PolicyGate>) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the run store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Creates a run. See [`Coordinator::create_run_with_cancellation`].
    ///
    /// # Errors
    ///
    /// See [`Coordinator::create_run_with_cancellation`].
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<CreateRunOutcome> {
        self.create_run_with_cancellation(request, &CancellationToken::new())
            .await
    }

    /// Creates a run, or resolves a duplicate submission to the existing run.
    ///
    /// The run is claimed in `CREATED` atomically with its idempotency
    /// binding, evaluated by the policy gate, has its IR persisted and moves
    /// to `QUEUED`. With `dispatch_on_create` it is then dispatched inline; a
    /// publish failure leaves it `QUEUED` and is reported in
    /// [`CreateRunOutcome::dispatch`], not as an error.
    ///
    /// Firing `cancel` before the IR is durable moves the run to `CANCELLED`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a malformed request
    /// - [`Error::AdmissionDenied`] if the policy gate denies the run (now `FAILED`)
    /// - [`Error::StorageUnavailable`] / [`Error::StorageRejected`] if the IR
    ///   write fails (run now `FAILED`), or if the run store fails
    /// - [`Error::Cancelled`] if `cancel` fired before the IR was durable
    #[tracing::instrument(
        skip(self, request, cancel),
        fields(
            project_id = request.project_id.as_deref().unwrap_or("-"),
            suite = %request.suite_name,
            run_id = tracing::field::Empty,
        )
    )]
    pub async fn create_run_with_cancellation(
        &self,
        request: CreateRunRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateRunOutcome> {
        let started = Instant::now();
        let result = self.create_run_inner(request, cancel).await;
        let label = match &result {
            Ok(outcome) if outcome.disposition == Disposition::Duplicate => "duplicate",
            Ok(_) => "created",
            Err(_) => "error",
        };
        self.metrics
            .observe_create_duration(label, started.elapsed());
        result
    }

    async fn create_run_inner(
        &self,
        request: CreateRunRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateRunOutcome> {
        request.validate()?;
        let now = Utc::now();

        let ordering_key = self.config.ordering_key_for(request.project_id.as_deref());
        let mut candidate = Run::new(
            request.suite_name,
            request.suite_version,
            request.actor,
            ordering_key,
            now,
        )
        .with_trigger(request.trigger);
        candidate.project_id = request.project_id;
        candidate.idempotency_key = request.idempotency_key;
        candidate.region = request.region;
        candidate.labels = request.labels;
        candidate.retry_of = request.retry_of;
        candidate.retry_depth = request.retry_depth;

        let created = NewRunEvent::transition(
            candidate.id,
            None,
            RunStatus::Created,
            json!({ "actor": candidate.actor, "trigger": candidate.trigger }),
            now,
        );
        let run = match self
            .store
            .insert_run(candidate, vec![created], self.config.idempotency_retention(), now)
            .await?
        {
            InsertOutcome::Inserted(run) => run,
            InsertOutcome::Existing(existing) => return self.resolve_duplicate(existing).await,
        };
        tracing::Span::current().record("run_id", tracing::field::display(&run.id));
        self.metrics.record_transition(None, RunStatus::Created);
        tracing::info!(ordering_key = %run.ordering_key, "run created");

        self.admit(&run).await?;

        let persisted = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.ir_store.put(&run.id, request.ir) => Some(result),
        };
        let ir_key = match persisted {
            Some(Ok(key)) => key,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "IR persistence failed");
                self.abort_created(
                    run.id,
                    RunStatus::Failed,
                    &format!("IR persistence failed: {err}"),
                )
                .await?;
                self.release_key(&run.ordering_key).await;
                return Err(err);
            }
            None => {
                tracing::info!("run creation cancelled before IR was durable");
                self.abort_created(
                    run.id,
                    RunStatus::Cancelled,
                    "creation cancelled before IR was durable",
                )
                .await?;
                self.release_key(&run.ordering_key).await;
                return Err(Error::Cancelled { run_id: run.id });
            }
        };

        let queued = self
            .apply(run.id, false, |current, _, now| {
                let mut next = current.clone();
                next.set_ir_storage_key(ir_key.as_str())?;
                next.transition_to(RunStatus::Queued, now)?;
                let event = NewRunEvent::transition(
                    current.id,
                    Some(current.status),
                    RunStatus::Queued,
                    json!({ "irStorageKey": ir_key }),
                    now,
                );
                Ok(Some(Change::new(next, vec![event])))
            })
            .await?
            .run;
        tracing::info!(dispatch_seq = ?queued.dispatch_seq, "run queued");

        let dispatch = if self.config.dispatch_on_create {
            self.dispatch_for_run(&queued).await?
        } else {
            DispatchOutcome::Deferred
        };

        Ok(CreateRunOutcome {
            run: self.get_run(&queued.id).await?,
            disposition: Disposition::Created,
            dispatch,
        })
    }

    async fn resolve_duplicate(&self, existing: Run) -> Result<CreateRunOutcome> {
        tracing::Span::current().record("run_id", tracing::field::display(&existing.id));
        tracing::info!(status = %existing.status, "duplicate submission resolved to existing run");

        if existing.status == RunStatus::Queued && self.config.dispatch_on_create {
            let dispatch = self.dispatch_for_run(&existing).await?;
            return Ok(CreateRunOutcome {
                run: self.get_run(&existing.id).await?,
                disposition: Disposition::Duplicate,
                dispatch,
            });
        }

        let dispatch = DispatchOutcome::observed(&existing, None);
        Ok(CreateRunOutcome {
            run: existing,
            disposition: Disposition::Duplicate,
            dispatch,
        })
    }

    async fn admit(&self, run: &Run) -> Result<()> {
        let counts = self.store.active_counts(run.project_id.as_deref()).await?;
        let context = ProjectContext {
            project_id: run.project_id.clone(),
            active_runs_in_project: counts.in_project,
            active_runs_total: counts.total,
        };
        let decision = self
            .policy
            .evaluate_admission(run, &context, &self.config.admission);
        self.metrics.record_admission(&decision);

        let AdmissionDecision::Deny { reason } = decision else {
            return Ok(());
        };
        tracing::warn!(reason = %reason, "admission denied");
        self.abort_created(run.id, RunStatus::Failed, &format!("admission denied: {reason}"))
            .await?;
        self.release_key(&run.ordering_key).await;
        Err(Error::AdmissionDenied {
            run_id: run.id,
            reason: reason.to_string(),
        })
    }

    /// Moves a `CREATED` run to `target`. Returns false if it left `CREATED` already.
    async fn abort_created(&self, run_id: RunId, target: RunStatus, message: &str) -> Result<bool> {
        let applied = self
            .apply(run_id, false, |current, _, now| {
                if current.status != RunStatus::Created {
                    return Ok(None);
                }
                let mut next = current.clone();
                next.transition_to(target, now)?;
                next.last_error = Some(message.to_string());
                let event = NewRunEvent::transition(
                    current.id,
                    Some(RunStatus::Created),
                    target,
                    json!({ "error": message }),
                    now,
                );
                Ok(Some(Change::new(next, vec![event])))
            })
            .await?;
        Ok(applied.changed)
    }

    /// Dispatches runs of `ordering_key` that waited behind a creation that
    /// just ended without queueing. Failures are left to the sweeper.
    async fn release_key(&self, ordering_key: &str) {
        if !self.config.dispatch_on_create {
            return;
        }
        match self.dispatch_key(ordering_key).await {
            Ok(report) if !report.dispatched.is_empty() => tracing::info!(
                ordering_key,
                released = report.dispatched.len(),
                "dispatched runs queued behind an aborted creation"
            ),
            Ok(_) => {}
            Err(err) => tracing::warn!(ordering_key, error = %err, "dispatch after aborted creation failed"),
        }
    }

    /// Fails a run stuck in `CREATED`. Returns false if it is no longer `CREATED`.
    pub(crate) async fn abandon_created(&self, run_id: RunId) -> Result<bool> {
        let abandoned = self
            .abort_created(run_id, RunStatus::Failed, "creation abandoned")
            .await?;
        if abandoned {
            tracing::warn!(run_id = %run_id, "abandoned run stuck in CREATED");
        }
        Ok(abandoned)
    }

    async fn dispatch_for_run(&self, run: &Run) -> Result<DispatchOutcome> {
        let blocked = match self.dispatch_key(&run.ordering_key).await {
            Ok(report) if report.dispatched.contains(&run.id) => {
                return Ok(DispatchOutcome::Dispatched);
            }
            Ok(report) => report.blocked.map(|b| b.reason),
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "inline dispatch failed");
                Some(err.to_string())
            }
        };
        let current = self.get_run(&run.id).await?;
        Ok(DispatchOutcome::observed(&current, blocked))
    }

    /// Publishes every `QUEUED` run of `ordering_key` in dispatch order.
    ///
    /// Dispatch order is creation order. The pass stops at the first publish
    /// failure, and at the first run still in `CREATED`, so no later run
    /// overtakes either. A pass that stops at a `CREATED` run is not an error;
    /// it is reported in [`DispatchReport::waiting_on`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatchUnavailable`] if a publish failed (runs
    /// before it remain dispatched), or a store error.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_pending(&self, ordering_key: &str) -> Result<DispatchReport> {
        let report = self.dispatch_key(ordering_key).await?;
        match report.blocked {
            Some(blocked) => Err(Error::DispatchUnavailable {
                run_id: Some(blocked.run_id),
                message: blocked.reason,
                source: None,
            }),
            None => Ok(report),
        }
    }

    pub(crate) async fn dispatch_key(&self, ordering_key: &str) -> Result<DispatchReport> {
        let _guard = self.dispatcher.lock_key(ordering_key).await?;
        let mut report = DispatchReport {
            ordering_key: ordering_key.to_string(),
            dispatched: Vec::new(),
            blocked: None,
            waiting_on: None,
        };

        let pending = self
            .store
            .list_pending(ordering_key, self.config.sweep_batch_size)
            .await?;
        for run in pending {
            if run.status == RunStatus::Created {
                tracing::debug!(run_id = %run.id, "dispatch waits for an earlier run still being created");
                report.waiting_on = Some(run.id);
                break;
            }
            match self.dispatcher.publish(&run).await {
                Ok(receipt) => {
                    let topic = self.dispatcher.topic();
                    let applied = self
                        .apply(run.id, false, |current, _, now| {
                            if current.status != RunStatus::Queued {
                                return Ok(None);
                            }
                            let mut next = current.clone();
                            next.dispatch_attempts += 1;
                            next.transition_to(RunStatus::Dispatched, now)?;
                            let event = NewRunEvent::transition(
                                current.id,
                                Some(RunStatus::Queued),
                                RunStatus::Dispatched,
                                json!({ "topic": topic, "messageId": receipt.message_id }),
                                now,
                            );
                            Ok(Some(Change::new(next, vec![event])))
                        })
                        .await?;
                    if applied.changed {
                        self.metrics.record_dispatch("success");
                        tracing::info!(run_id = %run.id, message_id = %receipt.message_id, "run dispatched");
                        report.dispatched.push(run.id);
                    } else {
                        self.metrics.record_dispatch("skipped");
                        tracing::debug!(run_id = %run.id, status = %applied.run.status, "run left QUEUED before dispatch committed");
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    self.metrics.record_dispatch("failure");
                    tracing::warn!(run_id = %run.id, error = %reason, "dispatch publish failed");
                    self.apply(run.id, false, |current, _, now| {
                        if current.status != RunStatus::Queued {
                            return Ok(None);
                        }
                        let mut next = current.clone();
                        next.dispatch_attempts += 1;
                        let event = NewRunEvent::new(
                            current.id,
                            kinds::DISPATCH_FAILED,
                            json!({ "error": reason, "attempt": next.dispatch_attempts }),
                            now,
                        );
                        Ok(Some(Change::new(next, vec![event])))
                    })
                    .await?;
                    report.blocked = Some(BlockedDispatch {
                        run_id: run.id,
                        reason,
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Records a worker's acknowledgement of a dispatch message.
    ///
    /// Moves `DISPATCHED` to `RUNNING`. A redelivered ack for a run that has
    /// already started returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::RunNotFound`] for an unknown run
    /// - [`Error::InvalidTransition`] if the run was never dispatched or ended before starting
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn acknowledge_dispatch(&self, run_id: &RunId) -> Result<Run> {
        let applied = self
            .apply(*run_id, false, |current, _, now| {
                if current.started_at.is_some() {
                    return Ok(None);
                }
                if current.status != RunStatus::Dispatched {
                    return Err(Error::invalid_transition(
                        current.status,
                        "ack",
                        format!("run is {}, expected DISPATCHED", current.status),
                    ));
                }
                let mut next = current.clone();
                next.transition_to(RunStatus::Running, now)?;
                let event = NewRunEvent::transition(
                    current.id,
                    Some(RunStatus::Dispatched),
                    RunStatus::Running,
                    json!({}),
                    now,
                );
                Ok(Some(Change::new(next, vec![event])))
            })
            .await?;
        if applied.changed {
            tracing::info!("run started");
        } else {
            tracing::debug!("redelivered ack ignored");
        }
        Ok(applied.run)
    }

    /// Records a step report for a `RUNNING` run.
    ///
    /// Returns the stored step. Repeating a recorded report is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a malformed report
    /// - [`Error::RunNotFound`] for an unknown run
    /// - [`Error::InvalidTransition`] if the run is not `RUNNING`, the order is
    ///   used by another step, or the step is already terminal
    #[tracing::instrument(
        skip(self, report),
        fields(run_id = %run_id, step_id = %report.step_id, order = report.order)
    )]
    pub async fn report_step(&self, run_id: &RunId, report: StepReport) -> Result<RunStep> {
        if report.step_id.trim().is_empty() {
            return Err(Error::validation("step id must not be empty"));
        }
        if report.step_type.trim().is_empty() {
            return Err(Error::validation("step type must not be empty"));
        }

        let mut recorded: Option<RunStep> = None;
        self.apply(*run_id, true, |current, steps, now| {
            if current.status != RunStatus::Running {
                return Err(Error::invalid_transition(
                    current.status,
                    format!("step {}", report.step_id),
                    format!("run is {}, expected RUNNING", current.status),
                ));
            }
            let (step, write) = match RunStep::apply_report(current.id, steps, &report, now)? {
                StepChange::Unchanged(step) => {
                    recorded = Some(step);
                    return Ok(None);
                }
                StepChange::Insert(step) => (step.clone(), StepWrite::Insert(step)),
                StepChange::Update(step) => (step.clone(), StepWrite::Update(step)),
            };
            let event = NewRunEvent::new(
                current.id,
                kinds::STEP,
                json!({
                    "stepId": step.step_id,
                    "stepType": step.step_type,
                    "order": step.order,
                    "status": step.status,
                    "resultCode": step.result_code,
                    "durationMs": step.duration_ms,
                    "error": step.error,
                }),
                now,
            )
            .with_step(step.step_id.clone());
            recorded = Some(step);
            Ok(Some(Change {
                run: current.clone(),
                step: Some(write),
                events: vec![event],
            }))
        })
        .await?;

        recorded.ok_or_else(|| Error::validation("step report was not recorded"))
    }

    /// Records a run's terminal outcome.
    ///
    /// A failed run is classified for flakiness; classification errors are
    /// logged and do not fail the report. Repeating the recorded outcome is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a failure without an error message
    /// - [`Error::RunNotFound`] for an unknown run
    /// - [`Error::InvalidTransition`] if the run is not `RUNNING`
    #[tracing::instrument(skip(self, outcome), fields(run_id = %run_id))]
    pub async fn report_completion(
        &self,
        run_id: &RunId,
        outcome: CompletionOutcome,
    ) -> Result<Run> {
        let error = match &outcome {
            CompletionOutcome::Success => None,
            CompletionOutcome::Failure { error } if error.trim().is_empty() => {
                return Err(Error::validation("failure outcome must carry an error"));
            }
            CompletionOutcome::Failure { error } => Some(error.as_str()),
        };
        let target = outcome.status();

        let applied = self
            .apply(*run_id, false, |current, _, now| {
                if current.status == target && current.started_at.is_some() {
                    return Ok(None);
                }
                let mut next = current.clone();
                next.transition_to(target, now)?;
                if let Some(error) = error {
                    next.last_error = Some(error.to_string());
                }
                let detail = error.map_or_else(|| json!({}), |e| json!({ "error": e }));
                let event =
                    NewRunEvent::transition(current.id, Some(current.status), target, detail, now);
                Ok(Some(Change::new(next, vec![event])))
            })
            .await?;

        if !applied.changed {
            tracing::debug!(status = %applied.run.status, "repeated completion ignored");
            return Ok(applied.run);
        }
        tracing::info!(status = %target, "run completed");

        if target == RunStatus::Failed {
            match self.classify_and_record(run_id).await {
                Ok((run, _)) => return Ok(run),
                Err(err) => tracing::warn!(error = %err, "flake classification failed"),
            }
        }
        Ok(applied.run)
    }

    /// Cancels a queued, dispatched or running run.
    ///
    /// Cancelling a cancelled run returns it unchanged. An accepted dispatch
    /// message is not retracted; its worker sees the run as cancelled.
    ///
    /// # Errors
    ///
    /// - [`Error::RunNotFound`] for an unknown run
    /// - [`Error::InvalidTransition`] if the run is still being created or has ended
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<Run> {
        let applied = self
            .apply(*run_id, false, |current, _, now| {
                match current.status {
                    RunStatus::Cancelled => return Ok(None),
                    RunStatus::Created => {
                        return Err(Error::invalid_transition(
                            current.status,
                            "cancel",
                            "run is still being created",
                        ));
                    }
                    _ => {}
                }
                let mut next = current.clone();
                next.transition_to(RunStatus::Cancelled, now)?;
                let event = NewRunEvent::transition(
                    current.id,
                    Some(current.status),
                    RunStatus::Cancelled,
                    json!({}),
                    now,
                );
                Ok(Some(Change::new(next, vec![event])))
            })
            .await?;
        if applied.changed {
            tracing::info!("run cancelled");
        }
        Ok(applied.run)
    }

    /// Gets a run by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id: *run_id })
    }

    /// Returns a run's timeline in replay order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run.
    pub async fn get_timeline(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        self.get_run(run_id).await?;
        let mut events = self.store.list_events(run_id).await?;
        sort_for_replay(&mut events);
        Ok(events)
    }

    /// Returns a run's steps in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run.
    pub async fn list_steps(&self, run_id: &RunId) -> Result<Vec<RunStep>> {
        self.get_run(run_id).await?;
        self.store.list_steps(run_id).await
    }

    /// Appends a notable fact (a log line, an artifact reference) to a run's timeline.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty kind or a kind reserved for status transitions
    /// - [`Error::RunNotFound`] for an unknown run
    #[tracing::instrument(skip(self, payload), fields(run_id = %run_id))]
    pub async fn record_event(
        &self,
        run_id: &RunId,
        step_id: Option<&str>,
        kind: &str,
        payload: Value,
    ) -> Result<RunEvent> {
        if kind.trim().is_empty() {
            return Err(Error::validation("event kind must not be empty"));
        }
        if RunStatus::ALL.iter().any(|s| s.event_kind() == kind) {
            return Err(Error::validation(format!(
                "event kind {kind} is reserved for status transitions"
            )));
        }

        let mut event = NewRunEvent::new(*run_id, kind, payload, Utc::now());
        if let Some(step_id) = step_id {
            event = event.with_step(step_id);
        }
        self.store
            .append_event(event)
            .await?
            .ok_or(Error::RunNotFound { run_id: *run_id })
    }

    /// Returns the flake classification of a failed run.
    ///
    /// Uses the most recent recorded classification, classifying and recording
    /// one if none exists.
    ///
    /// # Errors
    ///
    /// - [`Error::RunNotFound`] for an unknown run
    /// - [`Error::Validation`] if the run is not `FAILED`
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_classification(&self, run_id: &RunId) -> Result<Classification> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Failed {
            return Err(Error::validation(format!(
                "run {run_id} is {}, only FAILED runs are classified",
                run.status
            )));
        }

        let events = self.store.list_events(run_id).await?;
        let latest = events
            .iter()
            .filter(|e| e.kind == kinds::CLASSIFICATION)
            .max_by_key(|e| e.sequence);
        if let Some(event) = latest {
            return Ok(serde_json::from_value(event.payload.clone())?);
        }
        Ok(self.classify_and_record(run_id).await?.1)
    }

    async fn classify_and_record(&self, run_id: &RunId) -> Result<(Run, Classification)> {
        let steps = self.store.list_steps(run_id).await?;
        let events = self.store.list_events(run_id).await?;
        let classification = self.classifier.classify(&steps, &events);
        self.metrics.record_classification(classification.flaky);

        let payload = serde_json::to_value(&classification)?;
        let flaky = classification.flaky;
        let applied = self
            .apply(*run_id, false, |current, _, now| {
                let mut next = current.clone();
                next.flaky_suspect = flaky;
                let event =
                    NewRunEvent::new(current.id, kinds::CLASSIFICATION, payload.clone(), now);
                Ok(Some(Change::new(next, vec![event])))
            })
            .await?;
        tracing::info!(run_id = %run_id, flaky, reason = %classification.reason, "run classified");
        Ok((applied.run, classification))
    }

    /// Advises whether a run should be resubmitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run.
    pub async fn retry_advice(&self, run_id: &RunId) -> Result<RetryAdvice> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Failed {
            return Ok(RetryAdvice::DoNotRetry {
                reason: format!("run is {}, not FAILED", run.status),
            });
        }
        let classification = self.get_classification(run_id).await?;
        Ok(FlakeClassifier::retry_advice(
            &run,
            &classification,
            self.config.admission.max_retry_depth,
        ))
    }

    /// Resubmits a flaky failed run as a new run with the same IR.
    ///
    /// The retry is keyed `retry-of:{runId}`, so retrying the same run again
    /// returns the existing retry.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the run should not be retried
    /// - any error of [`Coordinator::create_run`]
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn retry_run(&self, run_id: &RunId) -> Result<CreateRunOutcome> {
        if let RetryAdvice::DoNotRetry { reason } = self.retry_advice(run_id).await? {
            return Err(Error::validation(format!(
                "run {run_id} cannot be retried: {reason}"
            )));
        }
        let original = self.get_run(run_id).await?;
        let ir_key = original.ir_storage_key.as_deref().ok_or_else(|| {
            Error::validation(format!("run {run_id} has no IR storage key"))
        })?;
        let ir = self.ir_store.get(ir_key).await?;

        let mut request = CreateRunRequest::new(
            original.suite_name.clone(),
            original.suite_version.clone(),
            original.actor.clone(),
            ir,
        )
        .with_trigger(TriggerKind::Retry)
        .with_idempotency_key(format!("retry-of:{run_id}"));
        request.project_id.clone_from(&original.project_id);
        request.region.clone_from(&original.region);
        request.labels.clone_from(&original.labels);
        request.retry_of = Some(original.id);
        request.retry_depth = original.retry_depth + 1;

        self.create_run(request).await
    }

    /// Runs an optimistic read-modify-commit loop on one run.
    ///
    /// `mutate` returns `None` to leave the run unchanged.
    async fn apply<F>(&self, run_id: RunId, load_steps: bool, mut mutate: F) -> Result<Applied>
    where
        F: FnMut(&Run, &[RunStep], DateTime<Utc>) -> Result<Option<Change>> + Send,
    {
        let attempts = self.config.max_conflict_retries;
        for attempt in 1..=attempts {
            let current = self.get_run(&run_id).await?;
            let steps = if load_steps {
                self.store.list_steps(&run_id).await?
            } else {
                Vec::new()
            };

            let Some(change) = mutate(&current, &steps, Utc::now())? else {
                return Ok(Applied {
                    run: current,
                    changed: false,
                });
            };

            let from = current.status;
            let commit = RunCommit {
                run: change.run,
                expected_version: current.version,
                step: change.step,
                events: change.events,
            };
            match self.store.commit(commit).await? {
                CasResult::Success(stored) => {
                    if stored.status != from {
                        self.metrics.record_transition(Some(from), stored.status);
                    }
                    return Ok(Applied {
                        run: *stored,
                        changed: true,
                    });
                }
                CasResult::NotFound => return Err(Error::RunNotFound { run_id }),
                CasResult::StepConflict { reason } => {
                    return Err(Error::invalid_transition(from, "step", reason));
                }
                CasResult::VersionConflict { actual } => {
                    tracing::debug!(
                        run_id = %run_id,
                        expected = current.version,
                        actual,
                        attempt,
                        "version conflict, retrying"
                    );
                }
            }
        }
        Err(Error::Conflict { run_id, attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::InMemoryMessageBus;
    use crate::error::ErrorKind;
    use crate::ir_store::BlobIrStore;
    use crate::step::StepStatus;
    use crate::store::memory::InMemoryRunStore;
    use trialrun_core::MemoryBackend;

    fn coordinator(config: OrchestratorConfig) -> (Coordinator, Arc<InMemoryMessageBus>) {
        let bus = Arc::new(InMemoryMessageBus::new());
        let ir_store = BlobIrStore::new(
            Arc::new(MemoryBackend::new()),
            config.ir_container.clone(),
            config.ir_max_bytes,
        );
        let coordinator = Coordinator::new(
            config,
            Arc::new(InMemoryRunStore::new()),
            Arc::new(ir_store),
            bus.clone(),
        )
        .unwrap();
        (coordinator, bus)
    }

    fn request() -> CreateRunRequest {
        CreateRunRequest::new("checkout", "1.0.0", "alice", r#"{"steps":[]}"#).with_project("P1")
    }

    async fn running_run(coordinator: &Coordinator) -> RunId {
        let outcome = coordinator.create_run(request()).await.unwrap();
        assert_eq!(outcome.dispatch, DispatchOutcome::Dispatched);
        coordinator
            .acknowledge_dispatch(&outcome.run.id)
            .await
            .unwrap();
        outcome.run.id
    }

    #[test]
    fn request_validation() {
        assert!(request().validate().is_ok());
        assert!(
            CreateRunRequest::new("", "1", "alice", "{}")
                .validate()
                .is_err()
        );
        assert!(
            CreateRunRequest::new("s", "1", "alice", "not json")
                .validate()
                .is_err()
        );
        assert!(request().with_idempotency_key(" ").validate().is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let ir_store = BlobIrStore::new(Arc::new(MemoryBackend::new()), "ir", 1024);
        let config = OrchestratorConfig {
            max_conflict_retries: 0,
            ..OrchestratorConfig::default()
        };
        let err = Coordinator::new(
            config,
            Arc::new(InMemoryRunStore::new()),
            Arc::new(ir_store),
            bus,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn create_dispatches_inline() {
        let (coordinator, bus) = coordinator(OrchestratorConfig::default());
        let outcome = coordinator.create_run(request()).await.unwrap();

        assert_eq!(outcome.disposition, Disposition::Created);
        assert_eq!(outcome.dispatch, DispatchOutcome::Dispatched);
        assert_eq!(outcome.run.status, RunStatus::Dispatched);
        assert_eq!(
            outcome.run.ir_storage_key,
            Some(format!("runs/{}/suite", outcome.run.id))
        );

        let published = bus.published().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].ordering_key, "P1");
        assert_eq!(published[0].message().unwrap().run_id, outcome.run.id);
    }

    #[tokio::test]
    async fn runs_without_project_use_default_ordering_key() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let outcome = coordinator
            .create_run(CreateRunRequest::new("s", "1", "ci", "{}"))
            .await
            .unwrap();
        assert_eq!(outcome.run.ordering_key, "global");
        assert_eq!(outcome.run.project_id, None);
    }

    #[tokio::test]
    async fn publish_failure_leaves_run_queued() {
        let (coordinator, bus) = coordinator(OrchestratorConfig::default());
        bus.set_available(false);

        let outcome = coordinator.create_run(request()).await.unwrap();
        assert!(matches!(outcome.dispatch, DispatchOutcome::Unavailable { .. }));
        assert_eq!(outcome.run.status, RunStatus::Queued);
        assert_eq!(outcome.run.dispatch_attempts, 1);

        let timeline = coordinator.get_timeline(&outcome.run.id).await.unwrap();
        assert!(timeline.iter().any(|e| e.kind == kinds::DISPATCH_FAILED));

        bus.set_available(true);
        let report = coordinator.dispatch_pending("P1").await.unwrap();
        assert_eq!(report.dispatched, vec![outcome.run.id]);
    }

    #[tokio::test]
    async fn ack_on_queued_run_is_rejected() {
        let config = OrchestratorConfig {
            dispatch_on_create: false,
            ..OrchestratorConfig::default()
        };
        let (coordinator, _) = coordinator(config);
        let outcome = coordinator.create_run(request()).await.unwrap();
        assert_eq!(outcome.dispatch, DispatchOutcome::Deferred);

        let err = coordinator
            .acknowledge_dispatch(&outcome.run.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn repeated_step_report_is_a_no_op() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let run_id = running_run(&coordinator).await;

        let report = StepReport::succeeded("s1", "http", 0);
        coordinator.report_step(&run_id, report.clone()).await.unwrap();
        let events_before = coordinator.get_timeline(&run_id).await.unwrap().len();

        let step = coordinator.report_step(&run_id, report).await.unwrap();
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(
            coordinator.get_timeline(&run_id).await.unwrap().len(),
            events_before
        );
    }

    #[tokio::test]
    async fn step_order_must_be_unique() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let run_id = running_run(&coordinator).await;

        coordinator
            .report_step(&run_id, StepReport::succeeded("s1", "http", 0))
            .await
            .unwrap();
        let err = coordinator
            .report_step(&run_id, StepReport::succeeded("s2", "http", 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(coordinator.list_steps(&run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_is_idempotent_and_final() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let run_id = running_run(&coordinator).await;

        let done = coordinator
            .report_completion(&run_id, CompletionOutcome::Success)
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert!(done.finished_at.is_some());

        let again = coordinator
            .report_completion(&run_id, CompletionOutcome::Success)
            .await
            .unwrap();
        assert_eq!(again.version, done.version);

        let err = coordinator
            .report_completion(&run_id, CompletionOutcome::failure("late"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let run_id = running_run(&coordinator).await;

        let cancelled = coordinator.cancel_run(&run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        let again = coordinator.cancel_run(&run_id).await.unwrap();
        assert_eq!(again.version, cancelled.version);
    }

    #[tokio::test]
    async fn record_event_rejects_reserved_kinds() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let run_id = running_run(&coordinator).await;

        let err = coordinator
            .record_event(&run_id, None, "succeeded", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let event = coordinator
            .record_event(&run_id, Some("s1"), kinds::LOG, json!({ "line": "GET /cart 200" }))
            .await
            .unwrap();
        assert_eq!(event.step_id.as_deref(), Some("s1"));

        let missing = coordinator
            .record_event(&RunId::generate(), None, kinds::LOG, json!({}))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn classification_requires_failed_run() {
        let (coordinator, _) = coordinator(OrchestratorConfig::default());
        let run_id = running_run(&coordinator).await;
        let err = coordinator.get_classification(&run_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
