//! Dispatcher.
//!
//! Admission runs under the candidate agent's ledger lock and checks, in
//! order: idempotency, dependency readiness, then the agent, class and
//! global ceilings. Ready candidates that find no free slot are queued, not
//! dropped. Draining the queue re-resolves each candidate, because its
//! upstream state may have changed while it waited.

use crate::budget::ResourcePools;
use crate::execution::Dispatch;
use crate::queue::QueuedCandidate;
use crate::registry::{AgentLedger, Parked, TaskRegistry, lock};
use crate::resolver::{MissingEdge, Readiness, resolve, waits_for_operator};
use crate::run::{PriorityClass, RunTrigger, TaskRun};
use crate::snapshot::{AgentEntry, ConfigSnapshot};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use trendline_core::{AgentName, RunState, TaskRunId, TimeWindow};
use trendline_pipeline::{ErrorKind, ExecutionRequest, UpstreamInput};

/// A window some agent should process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub agent: AgentName,
    pub window: TimeWindow,
    pub priority: PriorityClass,
    pub trigger: RunTrigger,
}

/// Where an accepted candidate ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A run was created in Running and handed to its executor.
    Admitted(TaskRun),
    /// Ready, waiting for a slot at this 1-based queue position.
    Queued { position: usize },
    /// Parked until its dependencies are satisfied.
    Waiting { missing: Vec<MissingEdge> },
    /// Parked because the agent is paused.
    Deferred { reason: String },
    /// Failed at admission and handed to the failure policy.
    Failed(TaskRun),
}

/// Why a candidate was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The window already has a live run, or is parked or queued.
    Duplicate { existing: Option<TaskRunId> },
    UnknownAgent { agent: AgentName },
    AgentPaused { agent: AgentName, reason: String },
    InvalidPriority { priority: PriorityClass },
    InvalidWindow { reason: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate {
                existing: Some(run_id),
            } => write!(f, "duplicate of run {run_id}"),
            Self::Duplicate { existing: None } => {
                write!(f, "duplicate of a parked or queued candidate")
            }
            Self::UnknownAgent { agent } => write!(f, "unknown agent: {agent}"),
            Self::AgentPaused { agent, reason } => {
                write!(f, "agent '{agent}' is paused: {reason}")
            }
            Self::InvalidPriority { priority } => {
                write!(f, "priority {priority} cannot be requested")
            }
            Self::InvalidWindow { reason } => write!(f, "invalid window: {reason}"),
        }
    }
}

impl std::error::Error for Rejection {}

/// Follow-up work produced while holding a ledger lock.
#[derive(Debug, Default)]
pub struct Effects {
    /// Attempts to execute.
    pub dispatches: Vec<Dispatch>,
    /// Runs that failed at admission and await their failure policy.
    pub failed: Vec<TaskRun>,
}

impl Effects {
    pub fn extend(&mut self, other: Effects) {
        self.dispatches.extend(other.dispatches);
        self.failed.extend(other.failed);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    pools: ResourcePools,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<TaskRegistry>, pools: ResourcePools) -> Self {
        Self { registry, pools }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Admits `candidate`.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] for unknown agents, duplicates and manual
    /// submissions to a paused agent.
    pub fn admit(
        &self,
        snapshot: &ConfigSnapshot,
        candidate: Candidate,
        now: DateTime<Utc>,
    ) -> (Result<Admission, Rejection>, Effects) {
        let mut effects = Effects::default();
        let Some(entry) = snapshot.agent(&candidate.agent) else {
            let agent = candidate.agent;
            return (Err(Rejection::UnknownAgent { agent }), effects);
        };
        let ledger = self.registry.ledger(&candidate.agent);
        let mut ledger = lock(&ledger);
        let result = self.admit_locked(snapshot, entry, &mut ledger, candidate, now, &mut effects);
        (result, effects)
    }

    pub(crate) fn admit_locked(
        &self,
        snapshot: &ConfigSnapshot,
        entry: &AgentEntry,
        ledger: &mut AgentLedger,
        candidate: Candidate,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<Admission, Rejection> {
        let window = candidate.window;
        if let Some(active) = ledger.active_run(&window) {
            return Err(Rejection::Duplicate {
                existing: Some(active.id),
            });
        }
        // Cadence windows are processed once; reruns go through submit.
        if candidate.trigger == RunTrigger::Cadence
            && let Some(previous) = ledger.runs(Some(&window)).last()
        {
            return Err(Rejection::Duplicate {
                existing: Some(previous.id),
            });
        }
        if ledger.parked.contains_key(&window) || ledger.queue.contains(&window) {
            return Err(Rejection::Duplicate { existing: None });
        }

        if let Some(reason) = ledger.paused.clone() {
            if candidate.trigger == RunTrigger::Manual {
                return Err(Rejection::AgentPaused {
                    agent: candidate.agent,
                    reason,
                });
            }
            ledger.accept(window, candidate.priority, candidate.trigger, now);
            ledger.parked.insert(
                window,
                Parked {
                    priority: candidate.priority,
                    trigger: candidate.trigger,
                    accepted_at: now,
                    waiting_since: None,
                },
            );
            debug!(agent = %candidate.agent, window = %window, "agent paused, window parked");
            return Ok(Admission::Deferred { reason });
        }

        ledger.accept(window, candidate.priority, candidate.trigger, now);
        match resolve(&self.registry, snapshot, entry, &window) {
            Readiness::Ready { .. } => {
                ledger
                    .queue
                    .push(window, candidate.priority, candidate.trigger, now, None);
                self.drain_locked(snapshot, entry, ledger, now, effects);
                Ok(placement(ledger, &window))
            }
            Readiness::Waiting { missing } => {
                debug!(
                    agent = %candidate.agent,
                    window = %window,
                    missing = missing.len(),
                    "dependencies not ready, window parked"
                );
                ledger.parked.insert(
                    window,
                    Parked {
                        priority: candidate.priority,
                        trigger: candidate.trigger,
                        accepted_at: now,
                        waiting_since: Some(now),
                    },
                );
                Ok(Admission::Waiting { missing })
            }
            Readiness::Stale { upstream, age } => {
                let error = ErrorKind::StaleDependency {
                    upstream,
                    age_minutes: age.num_minutes(),
                };
                match fail_at_admission(ledger, &candidate.window, candidate.priority, candidate.trigger, error, now) {
                    Some(run) => {
                        effects.failed.push(run.clone());
                        Ok(Admission::Failed(run))
                    }
                    None => Ok(placement(ledger, &window)),
                }
            }
        }
    }

    /// Starts queued candidates while the agent has free slots.
    pub fn drain(&self, snapshot: &ConfigSnapshot, agent: &AgentName, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if let Some(entry) = snapshot.agent(agent) {
            let ledger = self.registry.ledger(agent);
            let mut ledger = lock(&ledger);
            self.drain_locked(snapshot, entry, &mut ledger, now, &mut effects);
        }
        effects
    }

    pub(crate) fn drain_locked(
        &self,
        snapshot: &ConfigSnapshot,
        entry: &AgentEntry,
        ledger: &mut AgentLedger,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        if ledger.paused.is_some() {
            return;
        }
        ledger.budget.set_ceiling(entry.definition.max_concurrency);
        while ledger.budget.available() > 0 {
            let Some(candidate) = ledger.queue.pop_eligible(now) else {
                break;
            };
            match resolve(&self.registry, snapshot, entry, &candidate.window) {
                Readiness::Ready { inputs } => {
                    let Some(permits) = self.pools.try_reserve(entry.definition.resource_class)
                    else {
                        debug!(
                            agent = %entry.name(),
                            class = entry.definition.resource_class.as_str(),
                            "shared ceiling reached, candidate stays queued"
                        );
                        ledger.queue.restore(candidate);
                        break;
                    };
                    if !ledger.budget.try_acquire() {
                        ledger.queue.restore(candidate);
                        break;
                    }
                    match start_locked(snapshot, entry, ledger, &candidate, inputs, now) {
                        Some((run, request, cancel)) => effects.dispatches.push(Dispatch {
                            run,
                            request,
                            executor: entry.definition.executor_name().to_string(),
                            timeout: snapshot.timeout(entry),
                            cancel,
                            permits,
                        }),
                        None => ledger.budget.release(),
                    }
                }
                Readiness::Waiting { .. } => {
                    ledger.parked.insert(
                        candidate.window,
                        Parked {
                            priority: candidate.priority,
                            trigger: candidate.trigger,
                            accepted_at: candidate.enqueued_at,
                            waiting_since: Some(now),
                        },
                    );
                }
                Readiness::Stale { upstream, age } => {
                    let error = ErrorKind::StaleDependency {
                        upstream,
                        age_minutes: age.num_minutes(),
                    };
                    if let Some(run) = fail_at_admission(
                        ledger,
                        &candidate.window,
                        candidate.priority,
                        candidate.trigger,
                        error,
                        now,
                    ) {
                        effects.failed.push(run);
                    }
                }
            }
        }
    }

    /// Re-resolves parked candidates, queues the ready ones, fails the ones
    /// that waited too long, then drains.
    pub fn reevaluate(&self, snapshot: &ConfigSnapshot, agent: &AgentName, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if let Some(entry) = snapshot.agent(agent) {
            let ledger = self.registry.ledger(agent);
            let mut ledger = lock(&ledger);
            self.reevaluate_locked(snapshot, entry, &mut ledger, now, &mut effects);
        }
        effects
    }

    pub(crate) fn reevaluate_locked(
        &self,
        snapshot: &ConfigSnapshot,
        entry: &AgentEntry,
        ledger: &mut AgentLedger,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        if ledger.paused.is_some() {
            return;
        }
        let max_wait = snapshot.settings().max_dependency_wait();
        let parked = std::mem::take(&mut ledger.parked);
        for (window, mut candidate) in parked {
            match resolve(&self.registry, snapshot, entry, &window) {
                Readiness::Ready { .. } => {
                    ledger
                        .queue
                        .push(window, candidate.priority, candidate.trigger, now, None);
                }
                Readiness::Waiting { missing } => {
                    let since = *candidate.waiting_since.get_or_insert(now);
                    if !waits_for_operator(&missing) && now - since > max_wait {
                        let upstream = missing.iter().map(|edge| edge.upstream.clone()).collect();
                        warn!(
                            agent = %entry.name(),
                            window = %window,
                            "dependencies unmet past the maximum wait"
                        );
                        if let Some(run) = fail_at_admission(
                            ledger,
                            &window,
                            candidate.priority,
                            candidate.trigger,
                            ErrorKind::DependencyUnmet { upstream },
                            now,
                        ) {
                            effects.failed.push(run);
                        }
                    } else {
                        ledger.parked.insert(window, candidate);
                    }
                }
                Readiness::Stale { upstream, age } => {
                    let error = ErrorKind::StaleDependency {
                        upstream,
                        age_minutes: age.num_minutes(),
                    };
                    if let Some(run) =
                        fail_at_admission(ledger, &window, candidate.priority, candidate.trigger, error, now)
                    {
                        effects.failed.push(run);
                    }
                }
            }
        }
        self.drain_locked(snapshot, entry, ledger, now, effects);
    }
}

fn placement(ledger: &AgentLedger, window: &TimeWindow) -> Admission {
    if let Some(run) = ledger.active_run(window) {
        match run.state {
            RunState::Running => return Admission::Admitted(run.clone()),
            RunState::Failed | RunState::TimedOut => return Admission::Failed(run.clone()),
            _ => {}
        }
    }
    if let Some(position) = ledger.queue.position(window) {
        return Admission::Queued { position };
    }
    Admission::Waiting {
        missing: Vec::new(),
    }
}

/// Moves the window's run, creating it if needed, through a counted
/// attempt into Failed.
fn fail_at_admission(
    ledger: &mut AgentLedger,
    window: &TimeWindow,
    priority: PriorityClass,
    trigger: RunTrigger,
    error: ErrorKind,
    now: DateTime<Utc>,
) -> Option<TaskRun> {
    let mut run = ledger.active_run(window).cloned().unwrap_or_else(|| {
        TaskRun::new(ledger.agent().clone(), *window, priority, trigger, now)
    });
    let failed = (|| {
        if run.state != RunState::Ready {
            run.begin_attempt()?;
        }
        run.fail(error, now)
    })();
    if let Err(e) = failed {
        warn!(agent = %ledger.agent(), window = %window, error = %e, "cannot fail run at admission");
        return None;
    }
    info!(
        agent = %run.agent,
        window = %run.window,
        run_id = %run.id,
        attempt = run.attempt_count,
        error = %run.error_kind.as_ref().map(ToString::to_string).unwrap_or_default(),
        "run failed at admission"
    );
    ledger.upsert(run.clone());
    Some(run)
}

/// Moves the candidate's run into Running and prepares its request.
fn start_locked(
    snapshot: &ConfigSnapshot,
    entry: &AgentEntry,
    ledger: &mut AgentLedger,
    candidate: &QueuedCandidate,
    inputs: Vec<UpstreamInput>,
    now: DateTime<Utc>,
) -> Option<(TaskRun, ExecutionRequest, oneshot::Receiver<String>)> {
    let mut run = match ledger.active_run(&candidate.window) {
        Some(run) => run.clone(),
        None => TaskRun::new(
            entry.name().clone(),
            candidate.window,
            candidate.priority,
            candidate.trigger,
            now,
        ),
    };
    run.priority = run.priority.max(candidate.priority);
    let started = (|| {
        if run.state != RunState::Ready {
            run.begin_attempt()?;
        }
        run.start(now)
    })();
    if let Err(e) = started {
        warn!(agent = %entry.name(), window = %candidate.window, error = %e, "cannot start run");
        return None;
    }
    ledger.upsert(run.clone());

    let (cancel_tx, cancel_rx) = oneshot::channel();
    ledger.register_cancellation(run.id, cancel_tx);

    let timeout = snapshot.timeout(entry);
    let deadline = now
        + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1));
    let request = ExecutionRequest {
        run_id: run.id,
        agent: run.agent.clone(),
        window: run.window,
        attempt: run.attempt_count,
        inputs,
        deadline,
    };
    info!(
        agent = %run.agent,
        window = %run.window,
        run_id = %run.id,
        attempt = run.attempt_count,
        priority = %run.priority,
        "run admitted"
    );
    Some((run, request, cancel_rx))
}
