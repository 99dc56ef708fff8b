//! The orchestrator.
//!
//! One [`Orchestrator`] value owns everything the scheduler shares: the
//! current configuration snapshot, the task registry, the dispatcher, the
//! recovery manager, the executor and alert-sink registries and the clock.
//!
//! [`Orchestrator::run`] drives it:
//! 1. Recover runs interrupted by the previous process
//! 2. Start one decision loop per agent type
//! 3. Apply priority hints and archive old runs in the background
//! 4. Stop the loops on shutdown and wait for in-flight executions
//!
//! Every decision loop tick promotes aged queue entries, re-evaluates
//! parked candidates, emits due cadence windows and admits them.
//! Executions run as spawned tasks and report back through
//! [`Orchestrator::complete`], which applies the outcome, runs recovery on
//! failures and drains the agent's queue.

use crate::alert::{AlertEvent, AlertKind, AlertRouter, AlertSink, Severity};
use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::budget::ResourcePools;
use crate::cadence::{BacklogSignal, DueWindow};
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{Admission, Candidate, Dispatcher, Effects, Rejection};
use crate::drift::{DriftMonitor, EvaluationSignal, PriorityHint};
use crate::error::{JournalError, OperatorError};
use crate::execution::{Completion, Dispatch, ExecutionResult, execute};
use crate::health::AgentHealth;
use crate::journal::{MemoryJournal, RunJournal};
use crate::recovery::{OutputIndexRecord, RecoveryManager};
use crate::registry::{BacklogDepth, TaskRegistry, lock};
use crate::run::{PriorityClass, RunTrigger, TaskRun};
use crate::snapshot::ConfigSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use trendline_core::{AgentName, RunState, TaskRunId, TimeWindow};
use trendline_pipeline::{
    AgentOutcome, ErrorKind, ExecutorRegistry, FeatureStore, InMemoryFeatureStore,
};

/// Reason sent to an execution stopped by [`Orchestrator::abort`].
pub const ABORT_REASON: &str = "aborted by operator";

const HINT_CHANNEL_CAPACITY: usize = 64;
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Answer to an operator submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Accepted(Admission),
    Rejected(Rejection),
}

impl From<Result<Admission, Rejection>> for Submission {
    fn from(result: Result<Admission, Rejection>) -> Self {
        match result {
            Ok(admission) => Self::Accepted(admission),
            Err(rejection) => Self::Rejected(rejection),
        }
    }
}

/// What one decision loop tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Queued Normal candidates promoted to Expedited.
    pub promoted: usize,
    pub emitted: Vec<DueWindow>,
    /// Admission result of each emitted window, in emission order.
    pub admissions: Vec<Result<Admission, Rejection>>,
}

/// Operator view of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub agent: AgentName,
    pub paused: Option<String>,
    pub downstream_block: Option<String>,
    pub running: usize,
    pub max_concurrency: u32,
    pub backlog: BacklogDepth,
    pub boost_remaining: u32,
    pub emergency_cadence_until: Option<DateTime<Utc>>,
    pub last_emitted: Option<TimeWindow>,
    pub health: AgentHealth,
}

/// Assembles an [`Orchestrator`].
pub struct OrchestratorBuilder {
    snapshot: ConfigSnapshot,
    executors: ExecutorRegistry,
    feature_store: Option<Arc<dyn FeatureStore>>,
    journal: Option<Arc<dyn RunJournal>>,
    sinks: Vec<(String, Arc<dyn AlertSink>)>,
    clock: Option<Arc<dyn Clock>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    #[must_use]
    pub fn with_feature_store(mut self, feature_store: Arc<dyn FeatureStore>) -> Self {
        self.feature_store = Some(feature_store);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn RunJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    #[must_use]
    pub fn with_alert_sink(mut self, channel: impl Into<String>, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push((channel.into(), sink));
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replays the journal and returns the ready orchestrator.
    ///
    /// Runs that were executing when the previous process stopped are left
    /// Running until [`Orchestrator::recover_interrupted`] or
    /// [`Orchestrator::run`] sends them through their policy.
    ///
    /// # Errors
    ///
    /// Returns a [`JournalError`] if the journal cannot be replayed.
    pub fn build(self) -> trendline_core::Result<Arc<Orchestrator>, JournalError> {
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(MemoryJournal::new()));
        let entries = journal.replay()?;

        let registry = Arc::new(TaskRegistry::new(Arc::clone(&journal)));
        let audit = AuditLog::new(journal);
        registry.restore(entries, &audit);

        let feature_store = self
            .feature_store
            .unwrap_or_else(|| Arc::new(InMemoryFeatureStore::new()));
        let mut router = AlertRouter::new(audit.clone());
        for (channel, sink) in self.sinks {
            router.register(channel, sink);
        }

        let (hints, hint_rx) = mpsc::channel(HINT_CHANNEL_CAPACITY);
        let (signals, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let pools = ResourcePools::new(self.snapshot.settings());

        Ok(Arc::new(Orchestrator {
            dispatcher: Dispatcher::new(Arc::clone(&registry), pools),
            recovery: RecoveryManager::new(
                Arc::clone(&registry),
                Arc::clone(&feature_store),
                audit.clone(),
            ),
            snapshot: RwLock::new(Arc::new(self.snapshot)),
            registry,
            executors: self.executors,
            feature_store,
            router,
            audit,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            waker: Notify::new(),
            reloaded: Notify::new(),
            in_flight: Mutex::new(Vec::new()),
            hints,
            hint_rx: Mutex::new(Some(hint_rx)),
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
        }))
    }
}

pub struct Orchestrator {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    registry: Arc<TaskRegistry>,
    dispatcher: Dispatcher,
    recovery: RecoveryManager,
    executors: ExecutorRegistry,
    feature_store: Arc<dyn FeatureStore>,
    router: AlertRouter,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    /// Wakes every decision loop after a completion or operator action.
    waker: Notify,
    reloaded: Notify,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    hints: mpsc::Sender<PriorityHint>,
    hint_rx: Mutex<Option<mpsc::Receiver<PriorityHint>>>,
    signals: mpsc::Sender<EvaluationSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<EvaluationSignal>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.snapshot().agent_names())
            .field("executors", &self.executors)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn builder(snapshot: ConfigSnapshot) -> OrchestratorBuilder {
        OrchestratorBuilder {
            snapshot,
            executors: ExecutorRegistry::new(),
            feature_store: None,
            journal: None,
            sinks: Vec::new(),
            clock: None,
        }
    }

    /// The configuration currently in force.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Swaps in a new configuration. Agent ceilings apply at the next
    /// admission; resource-class and global ceilings keep their startup
    /// values.
    #[instrument(skip_all, fields(agents = snapshot.agent_names().len()))]
    pub fn reload(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        info!("configuration reloaded");
        self.reloaded.notify_waiters();
        self.waker.notify_waiters();
    }

    /// Sender for priority hints from outside the drift monitor.
    #[must_use]
    pub fn hint_sender(&self) -> mpsc::Sender<PriorityHint> {
        self.hints.clone()
    }

    /// Sender for evaluation signals consumed by the drift monitor.
    #[must_use]
    pub fn signal_sender(&self) -> mpsc::Sender<EvaluationSignal> {
        self.signals.clone()
    }

    #[must_use]
    pub fn audit_records(&self) -> Vec<crate::audit::AuditRecord> {
        self.audit.records()
    }

    /// Admits a candidate at any priority.
    pub async fn admit(self: &Arc<Self>, candidate: Candidate) -> Result<Admission, Rejection> {
        let snapshot = self.snapshot();
        let (result, effects) = self.dispatcher.admit(&snapshot, candidate, self.clock.now());
        self.process(effects).await;
        result
    }

    /// Operator submission of an on-demand or backfill window.
    #[instrument(skip(self), fields(agent = %agent, window = %window))]
    pub async fn submit(
        self: &Arc<Self>,
        agent: AgentName,
        window: TimeWindow,
        priority: PriorityClass,
    ) -> Submission {
        if priority == PriorityClass::Emergency {
            return Submission::Rejected(Rejection::InvalidPriority { priority });
        }
        if window.end() > self.clock.now() {
            return Submission::Rejected(Rejection::InvalidWindow {
                reason: format!("window {window} has not ended yet"),
            });
        }
        let candidate = Candidate {
            agent,
            window,
            priority,
            trigger: RunTrigger::Manual,
        };
        self.admit(candidate).await.into()
    }

    /// Runs one decision loop iteration for `agent`.
    pub async fn tick(self: &Arc<Self>, agent: &AgentName) -> TickReport {
        let snapshot = self.snapshot();
        let now = self.clock.now();
        let mut report = TickReport::default();
        let Some(entry) = snapshot.agent(agent) else {
            return report;
        };
        let settings = snapshot.settings();
        let backlog_threshold = snapshot.drift().backlog_threshold;

        let (effects, backlog) = {
            let ledger = self.registry.ledger(agent);
            let mut ledger = lock(&ledger);
            let mut effects = Effects::default();

            report.promoted = ledger.queue.promote_aged(now, settings.queue_max_wait());
            if report.promoted > 0 {
                debug!(agent = %agent, promoted = report.promoted, "promoted aged queue entries");
            }
            self.dispatcher
                .reevaluate_locked(&snapshot, entry, &mut ledger, now, &mut effects);

            let depth = ledger.backlog().total();
            let signal = BacklogSignal {
                depth,
                threshold: backlog_threshold,
                emergency_until: ledger.emergency_cadence_until,
            };
            let due = entry.cadence.due(
                now,
                ledger.last_emitted.as_ref(),
                &signal,
                settings.max_catch_up_windows,
            );
            for due_window in due {
                ledger.mark_emitted(due_window.window);
                let priority = if ledger.take_boost() {
                    PriorityClass::Emergency
                } else {
                    PriorityClass::Normal
                };
                let candidate = Candidate {
                    agent: agent.clone(),
                    window: due_window.window,
                    priority,
                    trigger: RunTrigger::Cadence,
                };
                let result = self
                    .dispatcher
                    .admit_locked(&snapshot, entry, &mut ledger, candidate, now, &mut effects);
                debug!(
                    agent = %agent,
                    window = %due_window.window,
                    mode = ?due_window.mode,
                    result = ?result,
                    "cadence window emitted"
                );
                report.admissions.push(result);
                report.emitted.push(due_window);
            }

            let escalated = ledger.emergency_cadence_until.is_some_and(|until| now < until);
            let backlogged = backlog_threshold > 0 && depth >= backlog_threshold && !escalated;
            (effects, backlogged.then_some(depth))
        };

        if let Some(depth) = backlog {
            let signal = EvaluationSignal::Backlog {
                agent: agent.clone(),
                depth,
                observed_at: now,
            };
            if self.signals.try_send(signal).is_err() {
                debug!(agent = %agent, "evaluation signal channel full, backlog signal dropped");
            }
        }
        self.process(effects).await;
        report
    }

    /// Starts dispatches and sends admission failures through recovery
    /// until nothing is left to do.
    async fn process(self: &Arc<Self>, mut effects: Effects) {
        loop {
            for dispatch in effects.dispatches.drain(..) {
                self.spawn_dispatch(dispatch);
            }
            if effects.failed.is_empty() {
                break;
            }
            let snapshot = self.snapshot();
            let mut touched = BTreeSet::new();
            for run in std::mem::take(&mut effects.failed) {
                let report = self.recovery.handle(&snapshot, &run, self.clock.now()).await;
                debug!(agent = %run.agent, run_id = %run.id, outcome = ?report.outcome, "recovery applied");
                self.alert(&snapshot, report.alerts).await;
                touched.insert(run.agent);
            }
            for agent in touched {
                effects.extend(self.dispatcher.drain(&snapshot, &agent, self.clock.now()));
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        let executor = self.executors.get(&dispatch.executor);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let completion = execute(executor, dispatch).await;
            this.complete(completion).await;
        });
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(handle);
    }

    /// Applies the result of one attempt.
    async fn complete(self: &Arc<Self>, completion: Completion) {
        let snapshot = self.snapshot();
        let now = self.clock.now();
        let agent = completion.agent.clone();
        let ledger = self.registry.ledger(&agent);

        let (finished, unhealthy, mut effects) = {
            let mut ledger = lock(&ledger);
            ledger.forget_cancellation(completion.run_id);
            let current = ledger
                .find_run(completion.run_id)
                .filter(|run| {
                    run.state == RunState::Running && run.attempt_count == completion.attempt
                })
                .cloned();
            let Some(mut run) = current else {
                self.audit.record(
                    AuditRecord::new(
                        now,
                        agent.clone(),
                        AuditKind::LateResultDiscarded,
                        format!(
                            "result of attempt {} discarded: {:?}",
                            completion.attempt, completion.result
                        ),
                    )
                    .for_run(completion.run_id, completion.window),
                );
                return;
            };

            ledger.budget.release();
            let elapsed = chrono::Duration::from_std(completion.elapsed)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if let Err(e) = apply(&mut run, completion.result, now) {
                warn!(run_id = %run.id, error = %e, "cannot apply execution result");
            }
            match (&run.state, &run.error_kind) {
                (RunState::Succeeded | RunState::PartialSuccess, _) => {
                    ledger.health.record_success(elapsed, now);
                }
                (_, error) => ledger.health.record_failure(
                    elapsed,
                    now,
                    error.as_ref().map(ToString::to_string).unwrap_or_default(),
                ),
            }
            info!(
                agent = %run.agent,
                window = %run.window,
                run_id = %run.id,
                attempt = run.attempt_count,
                state = %run.state,
                elapsed_ms = completion.elapsed.as_millis() as u64,
                "attempt finished"
            );
            ledger.upsert(run.clone());

            let mut effects = Effects::default();
            if let Some(entry) = snapshot.agent(&agent) {
                self.dispatcher
                    .drain_locked(&snapshot, entry, &mut ledger, now, &mut effects);
            }
            let settings = snapshot.settings();
            let unhealthy = ledger
                .health
                .is_unhealthy(settings.unhealthy_min_executions, settings.unhealthy_success_rate)
                .then(|| ledger.health.clone());
            (run, unhealthy, effects)
        };

        let mut alerts = Vec::new();
        if let Some(output) = &finished.output
            && matches!(finished.state, RunState::Succeeded | RunState::PartialSuccess)
        {
            if finished.state == RunState::PartialSuccess {
                self.audit.record(
                    AuditRecord::new(
                        now,
                        agent.clone(),
                        AuditKind::PartialSuccess,
                        finished.warnings.join("; "),
                    )
                    .for_run(finished.id, finished.window),
                );
            }
            self.index_output(&finished, output.clone()).await;
            if let Some(sla) = snapshot
                .agent(&agent)
                .and_then(|entry| entry.definition.sla_minutes)
                && let Some(ended) = finished.ended_at
            {
                let latency = ended - finished.window.end();
                if latency > crate::config::minutes(sla) {
                    alerts.push(
                        AlertEvent::new(
                            Severity::Warning,
                            AlertKind::SlaViolation,
                            agent.clone(),
                            format!(
                                "window {} completed {} minutes after it closed (SLA {sla} minutes)",
                                finished.window,
                                latency.num_minutes()
                            ),
                            now,
                        )
                        .for_run(finished.id, finished.window),
                    );
                }
            }
            for downstream in snapshot.graph().downstream(&agent) {
                effects.extend(self.dispatcher.reevaluate(&snapshot, downstream, now));
            }
        }
        if finished.state.awaits_recovery() {
            effects.failed.push(finished);
        }
        if let Some(health) = unhealthy {
            alerts.push(AlertEvent::new(
                Severity::Warning,
                AlertKind::AgentUnhealthy,
                agent.clone(),
                format!(
                    "success rate {:.0}% over {} executions",
                    health.success_rate() * 100.0,
                    health.execution_count
                ),
                now,
            ));
        }

        self.alert(&snapshot, alerts).await;
        self.process(effects).await;
        self.waker.notify_waiters();
    }

    async fn index_output(&self, run: &TaskRun, output: trendline_pipeline::OutputRef) {
        let record = OutputIndexRecord {
            run_id: run.id,
            window: run.window,
            output,
            as_of: run.output_as_of.unwrap_or_else(|| run.window.end()),
        };
        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "cannot encode output index record");
                return;
            }
        };
        if let Err(e) = self
            .feature_store
            .append(run.agent.as_str(), run.window.end(), payload)
            .await
        {
            warn!(agent = %run.agent, run_id = %run.id, error = %e, "failed to index output");
        }
    }

    async fn alert(&self, snapshot: &ConfigSnapshot, events: Vec<AlertEvent>) {
        for event in events {
            self.router.route(event, snapshot.alerts()).await;
        }
    }

    /// Applies a priority hint to the agent's boost counter and cadence
    /// override. Returns false for agents that are not configured.
    #[instrument(skip_all, fields(agent = %hint.agent))]
    pub async fn apply_hint(&self, hint: PriorityHint) -> bool {
        let snapshot = self.snapshot();
        if snapshot.agent(&hint.agent).is_none() {
            warn!("priority hint for unknown agent ignored");
            return false;
        }
        let now = self.clock.now();
        self.registry.with_ledger(&hint.agent, |ledger| {
            ledger.boost_remaining = ledger.boost_remaining.max(hint.emergency_windows);
            if let Some(until) = hint.emergency_cadence_until {
                ledger.emergency_cadence_until = Some(
                    ledger
                        .emergency_cadence_until
                        .map_or(until, |current| current.max(until)),
                );
            }
        });
        info!(
            windows = hint.emergency_windows,
            reason = %hint.reason,
            "priority hint applied"
        );
        let event = AlertEvent::new(
            Severity::Warning,
            AlertKind::DriftEscalation,
            hint.agent.clone(),
            hint.reason,
            now,
        );
        self.router.route(event, snapshot.alerts()).await;
        self.waker.notify_waiters();
        true
    }

    /// Runs of `agent`, optionally limited to one window.
    #[must_use]
    pub fn get_status(&self, agent: &AgentName, window: Option<&TimeWindow>) -> Vec<TaskRun> {
        self.registry
            .existing(agent)
            .map(|ledger| lock(&ledger).runs(window))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn backlog(&self, agent: &AgentName) -> BacklogDepth {
        self.registry
            .existing(agent)
            .map(|ledger| lock(&ledger).backlog())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn agent_status(&self, agent: &AgentName) -> Option<AgentStatus> {
        let snapshot = self.snapshot();
        let entry = snapshot.agent(agent)?;
        let ledger = self.registry.ledger(agent);
        let ledger = lock(&ledger);
        Some(AgentStatus {
            agent: agent.clone(),
            paused: ledger.paused.clone(),
            downstream_block: ledger.downstream_block.clone(),
            running: ledger.running_count(),
            max_concurrency: entry.definition.max_concurrency,
            backlog: ledger.backlog(),
            boost_remaining: ledger.boost_remaining,
            emergency_cadence_until: ledger.emergency_cadence_until,
            last_emitted: ledger.last_emitted,
            health: ledger.health.clone(),
        })
    }

    /// Resumes an agent paused by an escalation.
    ///
    /// # Errors
    ///
    /// Fails for unknown agents and agents that are not paused.
    #[instrument(skip(self), fields(agent = %agent))]
    pub async fn acknowledge_escalation(
        self: &Arc<Self>,
        agent: &AgentName,
    ) -> Result<(), OperatorError> {
        let snapshot = self.snapshot();
        let entry = snapshot.agent(agent).ok_or_else(|| OperatorError::UnknownAgent {
            agent: agent.clone(),
        })?;
        let now = self.clock.now();
        let effects = {
            let ledger = self.registry.ledger(agent);
            let mut ledger = lock(&ledger);
            if !ledger.resume(now) {
                return Err(OperatorError::NotPaused {
                    agent: agent.clone(),
                });
            }
            let mut effects = Effects::default();
            self.dispatcher
                .reevaluate_locked(&snapshot, entry, &mut ledger, now, &mut effects);
            effects
        };
        info!("escalation acknowledged, agent resumed");
        self.process(effects).await;
        self.waker.notify_waiters();
        Ok(())
    }

    /// Lets the dependents of `agent` resume after a skip-downstream.
    ///
    /// # Errors
    ///
    /// Fails for unknown agents and agents that are not blocking.
    #[instrument(skip(self), fields(agent = %agent))]
    pub async fn clear_downstream_block(
        self: &Arc<Self>,
        agent: &AgentName,
    ) -> Result<(), OperatorError> {
        let snapshot = self.snapshot();
        if snapshot.agent(agent).is_none() {
            return Err(OperatorError::UnknownAgent {
                agent: agent.clone(),
            });
        }
        let now = self.clock.now();
        let cleared = self
            .registry
            .with_ledger(agent, |ledger| ledger.clear_downstream_block(now));
        if !cleared {
            return Err(OperatorError::NotBlocked {
                agent: agent.clone(),
            });
        }
        info!("downstream block cleared");
        let mut effects = Effects::default();
        for downstream in snapshot.graph().downstream(agent) {
            effects.extend(self.dispatcher.reevaluate(&snapshot, downstream, now));
        }
        self.process(effects).await;
        self.waker.notify_waiters();
        Ok(())
    }

    /// Cancels a running execution. The run fails with `Cancelled` and its
    /// policy applies.
    ///
    /// # Errors
    ///
    /// Fails if the run does not exist or is not running.
    #[instrument(skip(self), fields(agent = %agent, run_id = %run_id))]
    pub fn abort(&self, agent: &AgentName, run_id: TaskRunId) -> Result<(), OperatorError> {
        let ledger = self
            .registry
            .existing(agent)
            .ok_or_else(|| OperatorError::UnknownAgent {
                agent: agent.clone(),
            })?;
        let mut ledger = lock(&ledger);
        let state = ledger
            .find_run(run_id)
            .map(|run| run.state)
            .ok_or(OperatorError::RunNotFound { run_id })?;
        if state != RunState::Running {
            return Err(OperatorError::RunNotRunning { run_id, state });
        }
        if !ledger.cancel(run_id, ABORT_REASON) {
            debug!("execution was already finishing");
        }
        info!("abort requested");
        Ok(())
    }

    /// Sends runs interrupted by a restart through their policy. Returns
    /// how many were found.
    pub async fn recover_interrupted(self: &Arc<Self>) -> usize {
        let awaiting = self.registry.take_interrupted(self.clock.now());
        let count = awaiting.len();
        if count > 0 {
            info!(count, "recovering runs interrupted by restart");
        }
        self.process(Effects {
            dispatches: Vec::new(),
            failed: awaiting,
        })
        .await;
        count
    }

    /// Archives terminal runs older than the retention period.
    pub fn archive_history(&self) -> usize {
        let now = self.clock.now();
        let retention = self.snapshot().settings().history_retention();
        let archived = self.registry.archive(now - retention, now);
        if archived > 0 {
            info!(archived, "archived run history");
        }
        archived
    }

    /// Waits until no execution is in flight.
    pub async fn settle(&self) {
        loop {
            let handles =
                std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
            if handles.is_empty() {
                break;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "execution task ended abnormally");
                }
            }
        }
    }

    /// Runs the scheduler until `shutdown` resolves, then stops the loops
    /// and waits for in-flight executions.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.recover_interrupted().await;

        let mut background = Vec::new();
        let hint_rx = self.hint_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(hints) = hint_rx {
            background.push(tokio::spawn(Arc::clone(&self).hint_loop(hints, stop_rx.clone())));
        }
        let signal_rx = self.signal_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(signals) = signal_rx {
            let monitor = DriftMonitor::new(self.snapshot().drift().clone(), self.hints.clone());
            background.push(tokio::spawn(monitor.run(signals, stop_rx.clone())));
        }
        background.push(tokio::spawn(Arc::clone(&self).archive_loop(stop_rx.clone())));

        let mut loops: HashMap<AgentName, JoinHandle<()>> = HashMap::new();
        let mut shutdown = std::pin::pin!(shutdown);
        info!("orchestrator started");
        loop {
            for agent in self.snapshot().agent_names() {
                if loops.get(&agent).is_none_or(JoinHandle::is_finished) {
                    let handle = tokio::spawn(
                        Arc::clone(&self).agent_loop(agent.clone(), stop_rx.clone()),
                    );
                    loops.insert(agent, handle);
                }
            }
            let reloaded = self.reloaded.notified();
            tokio::select! {
                () = &mut shutdown => break,
                () = reloaded => {}
            }
        }

        info!("shutdown requested, stopping decision loops");
        // Ignored: every receiver may already be gone.
        let _ = stop_tx.send(true);
        futures::future::join_all(loops.into_values().chain(background)).await;
        self.settle().await;
        info!("orchestrator stopped");
    }

    async fn agent_loop(self: Arc<Self>, agent: AgentName, mut stop: watch::Receiver<bool>) {
        debug!(agent = %agent, "decision loop started");
        loop {
            if *stop.borrow() {
                break;
            }
            let snapshot = self.snapshot();
            let Some(entry) = snapshot.agent(&agent) else {
                debug!(agent = %agent, "agent removed by reload");
                break;
            };
            self.tick(&agent).await;

            let now = self.clock.now();
            let signal = self.registry.with_ledger(&agent, |ledger| BacklogSignal {
                depth: ledger.backlog().total(),
                threshold: snapshot.drift().backlog_threshold,
                emergency_until: ledger.emergency_cadence_until,
            });
            let retry_at = self
                .registry
                .with_ledger(&agent, |ledger| ledger.queue.next_eligible_at(now));
            let mut sleep = snapshot.settings().tick_interval();
            for at in [entry.cadence.next_due(now, &signal), retry_at]
                .into_iter()
                .flatten()
            {
                if let Ok(until) = (at - now).to_std() {
                    sleep = sleep.min(until);
                }
            }

            let woken = self.waker.notified();
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = woken => {}
                _ = stop.changed() => break,
            }
        }
        debug!(agent = %agent, "decision loop stopped");
    }

    async fn hint_loop(
        self: Arc<Self>,
        mut hints: mpsc::Receiver<PriorityHint>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                hint = hints.recv() => match hint {
                    Some(hint) => {
                        self.apply_hint(hint).await;
                    }
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
    }

    async fn archive_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(
            self.snapshot().settings().archive_interval_seconds,
        );
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.archive_history();
                }
                _ = stop.changed() => break,
            }
        }
    }
}

/// Moves a Running run to the state `result` calls for.
fn apply(
    run: &mut TaskRun,
    result: ExecutionResult,
    now: DateTime<Utc>,
) -> Result<(), crate::run::TransitionError> {
    let as_of = run.window.end();
    match result {
        ExecutionResult::Outcome(AgentOutcome::Succeeded { output }) => {
            run.succeed(output, as_of, now)
        }
        ExecutionResult::Outcome(AgentOutcome::PartialSuccess { output, warnings }) => {
            run.partially_succeed(output, as_of, warnings, now)
        }
        ExecutionResult::Outcome(AgentOutcome::Failed { error }) => run.fail(error, now),
        ExecutionResult::Outcome(AgentOutcome::Timeout) => run.fail(ErrorKind::Timeout, now),
        ExecutionResult::Cancelled { reason } => run.fail(ErrorKind::Cancelled { reason }, now),
        ExecutionResult::MissingExecutor { executor } => run.fail(
            ErrorKind::Config {
                reason: format!("no executor registered as '{executor}'"),
            },
            now,
        ),
    }
}
