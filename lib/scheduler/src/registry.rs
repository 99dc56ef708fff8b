//! Task registry and state store.
//!
//! The registry owns one [`AgentLedger`] per agent, each behind its own
//! mutex, so unrelated agents never contend. A ledger holds everything the
//! scheduler mutates for an agent: its runs, the last emitted window, the
//! admission queue, parked candidates, the concurrency budget, pause and
//! block flags, drift boosts, health and cancellation handles.
//!
//! Ledger locks are never held across an `.await`. A caller holding one
//! ledger may lock the ledgers of that agent's upstream dependencies, never
//! the other way round; the dependency graph is acyclic, so this cannot
//! deadlock.

use crate::audit::{AuditLog, AuditRecord};
use crate::budget::ResourceBudget;
use crate::health::AgentHealth;
use crate::journal::{JournalEntry, RunJournal};
use crate::queue::AdmissionQueue;
use crate::run::{PriorityClass, RunTrigger, TaskRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use trendline_core::{AgentName, RunState, TaskRunId, TimeWindow};
use trendline_pipeline::ErrorKind;

/// Reason recorded on runs that were executing when the process stopped.
pub const RESTART_REASON: &str = "scheduler restarted";

/// Locks a ledger, recovering the data if a previous holder panicked.
pub(crate) fn lock(ledger: &Mutex<AgentLedger>) -> MutexGuard<'_, AgentLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A due window waiting on dependencies or on a paused agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parked {
    pub priority: PriorityClass,
    pub trigger: RunTrigger,
    pub accepted_at: DateTime<Utc>,
    /// First time the resolver reported it Waiting.
    pub waiting_since: Option<DateTime<Utc>>,
}

/// Outstanding work for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogDepth {
    /// Ready candidates waiting for a slot.
    pub queued: usize,
    /// Candidates parked on dependencies or a pause.
    pub waiting: usize,
    /// Runs waiting out a retry backoff.
    pub retrying: usize,
}

impl BacklogDepth {
    #[must_use]
    pub fn total(&self) -> usize {
        self.queued + self.waiting + self.retrying
    }
}

/// Mutable scheduler state for one agent.
#[derive(Debug)]
pub struct AgentLedger {
    agent: AgentName,
    runs: BTreeMap<TimeWindow, Vec<TaskRun>>,
    pub(crate) last_emitted: Option<TimeWindow>,
    pub(crate) queue: AdmissionQueue,
    pub(crate) parked: BTreeMap<TimeWindow, Parked>,
    pub(crate) budget: ResourceBudget,
    pub(crate) paused: Option<String>,
    pub(crate) downstream_block: Option<String>,
    pub(crate) boost_remaining: u32,
    pub(crate) emergency_cadence_until: Option<DateTime<Utc>>,
    pub(crate) health: AgentHealth,
    cancellations: HashMap<TaskRunId, oneshot::Sender<String>>,
    journal: Arc<dyn RunJournal>,
}

impl AgentLedger {
    fn new(agent: AgentName, journal: Arc<dyn RunJournal>) -> Self {
        Self {
            agent,
            runs: BTreeMap::new(),
            last_emitted: None,
            queue: AdmissionQueue::new(),
            parked: BTreeMap::new(),
            budget: ResourceBudget::new(1),
            paused: None,
            downstream_block: None,
            boost_remaining: 0,
            emergency_cadence_until: None,
            health: AgentHealth::default(),
            cancellations: HashMap::new(),
            journal,
        }
    }

    #[must_use]
    pub fn agent(&self) -> &AgentName {
        &self.agent
    }

    fn journal(&self, entry: JournalEntry) {
        if let Err(e) = self.journal.append(&entry) {
            warn!(agent = %self.agent, error = %e, "failed to append journal entry");
        }
    }

    /// All runs, or the runs of one window, ordered by window then creation.
    #[must_use]
    pub fn runs(&self, window: Option<&TimeWindow>) -> Vec<TaskRun> {
        match window {
            Some(window) => self.runs.get(window).cloned().unwrap_or_default(),
            None => self.runs.values().flatten().cloned().collect(),
        }
    }

    /// The non-terminal run of `window`, if any.
    #[must_use]
    pub fn active_run(&self, window: &TimeWindow) -> Option<&TaskRun> {
        self.runs
            .get(window)?
            .iter()
            .find(|run| !run.is_terminal())
    }

    #[must_use]
    pub fn has_run(&self, window: &TimeWindow) -> bool {
        self.runs.get(window).is_some_and(|runs| !runs.is_empty())
    }

    #[must_use]
    pub fn find_run(&self, run_id: TaskRunId) -> Option<&TaskRun> {
        self.runs.values().flatten().find(|run| run.id == run_id)
    }

    /// Latest run of the most recent window ending at or before `bound`.
    #[must_use]
    pub fn latest_run_ending_by(&self, bound: DateTime<Utc>) -> Option<&TaskRun> {
        self.runs
            .iter()
            .rev()
            .find(|(window, runs)| window.end() <= bound && !runs.is_empty())
            .and_then(|(_, runs)| runs.last())
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.runs
            .values()
            .flatten()
            .filter(|run| run.state == RunState::Running)
            .count()
    }

    /// Stores `run`, replacing the run with the same id, and journals it.
    pub fn upsert(&mut self, run: TaskRun) {
        self.journal(JournalEntry::RunUpdated { run: run.clone() });
        self.put(run);
    }

    fn put(&mut self, run: TaskRun) {
        let runs = self.runs.entry(run.window).or_default();
        match runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run,
            None => runs.push(run),
        }
    }

    /// Records `window` as emitted by the cadence source.
    pub fn mark_emitted(&mut self, window: TimeWindow) {
        if self.last_emitted.is_none_or(|last| window.end() > last.end()) {
            self.last_emitted = Some(window);
        }
        self.journal(JournalEntry::WindowEmitted {
            agent: self.agent.clone(),
            window,
        });
    }

    /// Journals a candidate that passed the duplicate check.
    pub fn accept(
        &mut self,
        window: TimeWindow,
        priority: PriorityClass,
        trigger: RunTrigger,
        at: DateTime<Utc>,
    ) {
        self.journal(JournalEntry::CandidateAccepted {
            agent: self.agent.clone(),
            window,
            priority,
            trigger,
            at,
        });
    }

    /// Consumes one drift boost, if any remain.
    pub fn take_boost(&mut self) -> bool {
        if self.boost_remaining == 0 {
            return false;
        }
        self.boost_remaining -= 1;
        true
    }

    #[must_use]
    pub fn backlog(&self) -> BacklogDepth {
        let retrying = self.queue.retry_count();
        BacklogDepth {
            queued: self.queue.len() - retrying,
            waiting: self.parked.len(),
            retrying,
        }
    }

    /// Pauses admissions. Returns false if the agent was already paused.
    pub fn pause(&mut self, reason: String, at: DateTime<Utc>) -> bool {
        if self.paused.is_some() {
            return false;
        }
        self.journal(JournalEntry::AgentPaused {
            agent: self.agent.clone(),
            reason: reason.clone(),
            at,
        });
        self.paused = Some(reason);
        true
    }

    pub fn resume(&mut self, at: DateTime<Utc>) -> bool {
        if self.paused.take().is_none() {
            return false;
        }
        self.journal(JournalEntry::AgentResumed {
            agent: self.agent.clone(),
            at,
        });
        true
    }

    pub fn block_downstream(&mut self, reason: String, at: DateTime<Utc>) {
        self.journal(JournalEntry::DownstreamBlocked {
            agent: self.agent.clone(),
            reason: reason.clone(),
            at,
        });
        self.downstream_block = Some(reason);
    }

    pub fn clear_downstream_block(&mut self, at: DateTime<Utc>) -> bool {
        if self.downstream_block.take().is_none() {
            return false;
        }
        self.journal(JournalEntry::DownstreamCleared {
            agent: self.agent.clone(),
            at,
        });
        true
    }

    pub(crate) fn register_cancellation(
        &mut self,
        run_id: TaskRunId,
        sender: oneshot::Sender<String>,
    ) {
        self.cancellations.insert(run_id, sender);
    }

    pub(crate) fn forget_cancellation(&mut self, run_id: TaskRunId) {
        self.cancellations.remove(&run_id);
    }

    /// Signals the execution of `run_id` to stop.
    pub fn cancel(&mut self, run_id: TaskRunId, reason: &str) -> bool {
        self.cancellations
            .remove(&run_id)
            .is_some_and(|sender| sender.send(reason.to_string()).is_ok())
    }

    /// Signals every in-flight execution to stop. Returns how many were
    /// still listening.
    pub fn cancel_all(&mut self, reason: &str) -> usize {
        self.cancellations
            .drain()
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(_, sender)| sender.send(reason.to_string()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    fn archive(&mut self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> usize {
        let latest_terminal = self
            .runs
            .values()
            .flatten()
            .filter(|run| run.is_terminal())
            .max_by_key(|run| (run.window, run.created_at))
            .map(|run| run.id);

        let expired: Vec<(TimeWindow, TaskRunId)> = self
            .runs
            .values()
            .flatten()
            .filter(|run| run.is_terminal() && Some(run.id) != latest_terminal)
            .filter(|run| run.ended_at.unwrap_or(run.created_at) < cutoff)
            .map(|run| (run.window, run.id))
            .collect();

        for (window, run_id) in &expired {
            if let Some(runs) = self.runs.get_mut(window) {
                runs.retain(|run| run.id != *run_id);
                if runs.is_empty() {
                    self.runs.remove(window);
                }
            }
            self.journal(JournalEntry::RunArchived {
                agent: self.agent.clone(),
                window: *window,
                run_id: *run_id,
                at,
            });
        }
        expired.len()
    }

    /// Moves runs interrupted by a restart back into the recovery path.
    /// Returns the runs awaiting their failure policy.
    fn take_interrupted(&mut self, now: DateTime<Utc>) -> Vec<TaskRun> {
        let mut awaiting = Vec::new();
        let active: Vec<TaskRun> = self
            .runs
            .values()
            .flatten()
            .filter(|run| !run.is_terminal())
            .cloned()
            .collect();
        for mut run in active {
            match run.state {
                RunState::Running => {
                    let cancelled = ErrorKind::Cancelled {
                        reason: RESTART_REASON.to_string(),
                    };
                    if run.fail(cancelled, now).is_ok() {
                        self.upsert(run.clone());
                        awaiting.push(run);
                    }
                }
                RunState::Failed | RunState::TimedOut => awaiting.push(run),
                RunState::Retrying | RunState::Pending | RunState::Ready => {
                    if !self.queue.contains(&run.window) {
                        self.queue.push(
                            run.window,
                            run.priority,
                            RunTrigger::Retry,
                            now,
                            run.next_attempt_at,
                        );
                    }
                }
                RunState::Succeeded | RunState::PartialSuccess | RunState::Abandoned => {}
            }
        }
        awaiting
    }
}

/// What a journal replay rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub entries: usize,
    pub runs: usize,
    pub parked: usize,
}

/// Registry of all agent ledgers.
#[derive(Debug)]
pub struct TaskRegistry {
    ledgers: RwLock<HashMap<AgentName, Arc<Mutex<AgentLedger>>>>,
    journal: Arc<dyn RunJournal>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new(journal: Arc<dyn RunJournal>) -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            journal,
        }
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<dyn RunJournal> {
        &self.journal
    }

    /// The ledger of `agent`, created on first use.
    pub fn ledger(&self, agent: &AgentName) -> Arc<Mutex<AgentLedger>> {
        if let Some(ledger) = self.existing(agent) {
            return ledger;
        }
        let mut ledgers = self.ledgers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(ledgers.entry(agent.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(AgentLedger::new(
                agent.clone(),
                Arc::clone(&self.journal),
            )))
        }))
    }

    /// The ledger of `agent` if it has ever been touched.
    #[must_use]
    pub fn existing(&self, agent: &AgentName) -> Option<Arc<Mutex<AgentLedger>>> {
        self.ledgers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .map(Arc::clone)
    }

    #[must_use]
    pub fn agents(&self) -> Vec<AgentName> {
        let mut agents: Vec<AgentName> = self
            .ledgers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        agents.sort();
        agents
    }

    /// Runs `f` with the locked ledger of `agent`.
    pub fn with_ledger<R>(&self, agent: &AgentName, f: impl FnOnce(&mut AgentLedger) -> R) -> R {
        let ledger = self.ledger(agent);
        let mut guard = lock(&ledger);
        f(&mut guard)
    }

    /// Rebuilds ledgers from journal entries. Audit records are handed to
    /// `audit` without being journaled again.
    pub fn restore(&self, entries: Vec<JournalEntry>, audit: &AuditLog) -> RestoreSummary {
        let mut summary = RestoreSummary {
            entries: entries.len(),
            ..RestoreSummary::default()
        };
        let mut accepted: Vec<(AgentName, TimeWindow, Parked)> = Vec::new();
        let mut archived: HashMap<(AgentName, TimeWindow), DateTime<Utc>> = HashMap::new();
        let mut records: Vec<AuditRecord> = Vec::new();

        for entry in entries {
            match entry {
                JournalEntry::RunUpdated { run } => {
                    let agent = run.agent.clone();
                    self.with_ledger(&agent, |ledger| ledger.put(run));
                }
                JournalEntry::WindowEmitted { agent, window } => {
                    self.with_ledger(&agent, |ledger| {
                        if ledger.last_emitted.is_none_or(|last| window.end() > last.end()) {
                            ledger.last_emitted = Some(window);
                        }
                    });
                }
                JournalEntry::CandidateAccepted {
                    agent,
                    window,
                    priority,
                    trigger,
                    at,
                } => accepted.push((
                    agent,
                    window,
                    Parked {
                        priority,
                        trigger,
                        accepted_at: at,
                        waiting_since: None,
                    },
                )),
                JournalEntry::AgentPaused { agent, reason, .. } => {
                    self.with_ledger(&agent, |ledger| ledger.paused = Some(reason));
                }
                JournalEntry::AgentResumed { agent, .. } => {
                    self.with_ledger(&agent, |ledger| ledger.paused = None);
                }
                JournalEntry::DownstreamBlocked { agent, reason, .. } => {
                    self.with_ledger(&agent, |ledger| ledger.downstream_block = Some(reason));
                }
                JournalEntry::DownstreamCleared { agent, .. } => {
                    self.with_ledger(&agent, |ledger| ledger.downstream_block = None);
                }
                JournalEntry::RunArchived {
                    agent,
                    window,
                    run_id,
                    at,
                } => {
                    self.with_ledger(&agent, |ledger| {
                        if let Some(runs) = ledger.runs.get_mut(&window) {
                            runs.retain(|run| run.id != run_id);
                            if runs.is_empty() {
                                ledger.runs.remove(&window);
                            }
                        }
                    });
                    archived.insert((agent, window), at);
                }
                JournalEntry::Audit { record } => records.push(record),
            }
        }

        // Accepted candidates that never got a run were parked or queued
        // when the process stopped.
        for (agent, window, parked) in accepted {
            if archived
                .get(&(agent.clone(), window))
                .is_some_and(|at| parked.accepted_at <= *at)
            {
                continue;
            }
            self.with_ledger(&agent, |ledger| {
                let started = ledger
                    .runs
                    .get(&window)
                    .is_some_and(|runs| runs.iter().any(|run| run.created_at >= parked.accepted_at));
                if !started && !ledger.parked.contains_key(&window) {
                    ledger.parked.insert(window, parked);
                    summary.parked += 1;
                }
            });
        }

        for agent in self.agents() {
            summary.runs += self.with_ledger(&agent, |ledger| ledger.runs.values().flatten().count());
        }
        audit.restore(records);
        info!(
            entries = summary.entries,
            runs = summary.runs,
            parked = summary.parked,
            "restored task registry from journal"
        );
        summary
    }

    /// Fails runs left Running by a previous process and re-queues retries.
    /// Returns every run that now awaits its failure policy.
    pub fn take_interrupted(&self, now: DateTime<Utc>) -> Vec<TaskRun> {
        let mut awaiting = Vec::new();
        for agent in self.agents() {
            awaiting.extend(self.with_ledger(&agent, |ledger| ledger.take_interrupted(now)));
        }
        awaiting
    }

    /// Archives terminal runs that ended before `cutoff`, keeping the most
    /// recent terminal run of every agent.
    pub fn archive(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let mut archived = 0;
        for agent in self.agents() {
            let count = self.with_ledger(&agent, |ledger| ledger.archive(cutoff, now));
            if count > 0 {
                debug!(agent = %agent, count, "archived runs");
            }
            archived += count;
        }
        archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use chrono::{Duration, TimeZone};
    use trendline_pipeline::OutputRef;

    fn name(s: &str) -> AgentName {
        AgentName::new(s).unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn window(day: u32, hour: u32) -> TimeWindow {
        TimeWindow::new(at(day, hour), at(day, hour) + Duration::hours(1)).unwrap()
    }

    fn finished(agent: &str, window: TimeWindow) -> TaskRun {
        let mut run = TaskRun::new(
            name(agent),
            window,
            PriorityClass::Normal,
            RunTrigger::Cadence,
            window.end(),
        );
        run.begin_attempt().unwrap();
        run.start(window.end()).unwrap();
        run.succeed(OutputRef::new("out"), window.end(), window.end())
            .unwrap();
        run
    }

    fn registry() -> (TaskRegistry, MemoryJournal) {
        let journal = MemoryJournal::new();
        (TaskRegistry::new(Arc::new(journal.clone())), journal)
    }

    #[test]
    fn latest_run_ending_by_picks_most_recent_compatible_window() {
        let (registry, _) = registry();
        let ingestion = name("ingestion");
        registry.with_ledger(&ingestion, |ledger| {
            ledger.upsert(finished("ingestion", window(2, 9)));
            ledger.upsert(finished("ingestion", window(2, 10)));
            ledger.upsert(finished("ingestion", window(2, 11)));
        });

        registry.with_ledger(&ingestion, |ledger| {
            let run = ledger.latest_run_ending_by(at(2, 11)).unwrap();
            assert_eq!(run.window, window(2, 10));
            assert!(ledger.latest_run_ending_by(at(2, 9)).is_none());
        });
    }

    #[test]
    fn backlog_splits_queue_parked_and_retrying() {
        let (registry, _) = registry();
        registry.with_ledger(&name("predictor"), |ledger| {
            let now = at(2, 12);
            ledger
                .queue
                .push(window(2, 9), PriorityClass::Normal, RunTrigger::Cadence, now, None);
            ledger
                .queue
                .push(window(2, 10), PriorityClass::Normal, RunTrigger::Retry, now, None);
            ledger.parked.insert(
                window(2, 11),
                Parked {
                    priority: PriorityClass::Normal,
                    trigger: RunTrigger::Cadence,
                    accepted_at: now,
                    waiting_since: Some(now),
                },
            );
            assert_eq!(
                ledger.backlog(),
                BacklogDepth {
                    queued: 1,
                    waiting: 1,
                    retrying: 1
                }
            );
            assert_eq!(ledger.backlog().total(), 3);
        });
    }

    #[test]
    fn restore_rebuilds_state_and_reparks_unstarted_candidates() {
        let (registry, journal) = registry();
        let analyzer = name("analyzer");
        registry.with_ledger(&analyzer, |ledger| {
            ledger.mark_emitted(window(2, 10));
            ledger.accept(window(2, 10), PriorityClass::Normal, RunTrigger::Cadence, at(2, 11));
            ledger.upsert(finished("analyzer", window(2, 10)));
            ledger.mark_emitted(window(2, 11));
            ledger.accept(window(2, 11), PriorityClass::Emergency, RunTrigger::Cadence, at(2, 12));
            ledger.pause("escalated".to_string(), at(2, 12));
        });

        let audit = AuditLog::new(Arc::new(MemoryJournal::new()));
        let restored = TaskRegistry::new(Arc::new(MemoryJournal::new()));
        let summary = restored.restore(journal.replay().unwrap(), &audit);
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.parked, 1);

        restored.with_ledger(&analyzer, |ledger| {
            assert_eq!(ledger.last_emitted, Some(window(2, 11)));
            assert_eq!(ledger.paused.as_deref(), Some("escalated"));
            let parked = ledger.parked.get(&window(2, 11)).unwrap();
            assert_eq!(parked.priority, PriorityClass::Emergency);
        });
    }

    #[test]
    fn interrupted_runs_fail_with_restart_reason() {
        let (registry, _) = registry();
        let mut run = TaskRun::new(
            name("semantic"),
            window(2, 8),
            PriorityClass::Normal,
            RunTrigger::Cadence,
            at(2, 12),
        );
        run.begin_attempt().unwrap();
        run.start(at(2, 12)).unwrap();
        registry.with_ledger(&name("semantic"), |ledger| ledger.upsert(run.clone()));

        let awaiting = registry.take_interrupted(at(2, 13));
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].state, RunState::Failed);
        assert_eq!(
            awaiting[0].error_kind,
            Some(ErrorKind::Cancelled {
                reason: RESTART_REASON.to_string()
            })
        );
    }

    #[test]
    fn archive_keeps_latest_terminal_run() {
        let (registry, journal) = registry();
        let ingestion = name("ingestion");
        registry.with_ledger(&ingestion, |ledger| {
            ledger.upsert(finished("ingestion", window(1, 9)));
            ledger.upsert(finished("ingestion", window(1, 10)));
        });
        let before = journal.len();

        let archived = registry.archive(at(5, 0), at(5, 0));
        assert_eq!(archived, 1);
        assert_eq!(journal.len(), before + 1);
        registry.with_ledger(&ingestion, |ledger| {
            let runs = ledger.runs(None);
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].window, window(1, 10));
        });
    }

    #[test]
    fn cancellation_reaches_execution() {
        let (registry, _) = registry();
        let run_id = TaskRunId::new();
        let (tx, mut rx) = oneshot::channel();
        registry.with_ledger(&name("predictor"), |ledger| {
            ledger.register_cancellation(run_id, tx);
            assert!(ledger.cancel(run_id, "aborted"));
            assert!(!ledger.cancel(run_id, "again"));
        });
        assert_eq!(rx.try_recv().unwrap(), "aborted");
    }
}
