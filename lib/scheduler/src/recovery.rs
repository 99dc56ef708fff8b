//! Failure recovery.
//!
//! Every run that ends Failed or TimedOut comes through here exactly once
//! per attempt. Retryable errors get another attempt after an exponential
//! backoff until the policy's attempt limit; resource exhaustion is
//! deferred without spending an attempt; everything else takes the
//! policy's terminal action. Non-success terminal outcomes are audited.

use crate::alert::{AlertEvent, AlertKind, Severity};
use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::registry::{AgentLedger, TaskRegistry, lock};
use crate::run::{RunTrigger, TaskRun};
use crate::snapshot::ConfigSnapshot;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use trendline_core::{RunState, TaskRunId, TimeWindow};
use trendline_pipeline::{ErrorKind, FailurePolicy, FeatureStore, OutputRef, TerminalAction};

/// Delay before a deferred attempt when the policy has no backoff.
const DEFAULT_DEFERRAL_SECONDS: i64 = 30;

/// Reason sent to executions cancelled by an escalation pause.
pub const ESCALATION_CANCEL_REASON: &str = "agent paused by escalation";

/// Index entry written to the feature store for every usable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputIndexRecord {
    pub run_id: TaskRunId,
    pub window: TimeWindow,
    pub output: OutputRef,
    pub as_of: DateTime<Utc>,
}

/// What the policy says to do with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry { not_before: DateTime<Utc> },
    /// Try again later without counting the failed attempt.
    Defer { not_before: DateTime<Utc> },
    Terminal(TerminalAction),
}

/// Applies `policy` to a failed `run`.
#[must_use]
pub fn decide(
    policy: &FailurePolicy,
    run: &TaskRun,
    max_deferrals: u32,
    now: DateTime<Utc>,
) -> RecoveryDecision {
    let Some(error) = &run.error_kind else {
        return RecoveryDecision::Terminal(policy.on_exhausted);
    };
    if *error == ErrorKind::ResourceExhausted && run.deferrals < max_deferrals {
        let delay = policy
            .retry
            .as_ref()
            .map_or(Duration::seconds(DEFAULT_DEFERRAL_SECONDS), |retry| retry.backoff(1));
        return RecoveryDecision::Defer {
            not_before: now + delay,
        };
    }
    match &policy.retry {
        Some(retry) if error.is_retryable() && run.attempt_count < retry.max_attempts => {
            RecoveryDecision::Retry {
                not_before: now + retry.backoff(run.attempt_count),
            }
        }
        _ => RecoveryDecision::Terminal(policy.on_exhausted),
    }
}

/// Where a failed run ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Retrying { not_before: DateTime<Utc> },
    Deferred { not_before: DateTime<Utc> },
    Resolved { action: TerminalAction, state: RunState },
    /// The run was no longer waiting on its policy.
    Skipped,
}

/// Result of handling one failed run.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub outcome: RecoveryOutcome,
    /// Alerts to route once every ledger lock is released.
    pub alerts: Vec<AlertEvent>,
}

impl RecoveryReport {
    fn new(outcome: RecoveryOutcome) -> Self {
        Self {
            outcome,
            alerts: Vec::new(),
        }
    }
}

enum Step {
    Done(RecoveryReport),
    Fallback(TaskRun),
}

pub struct RecoveryManager {
    registry: Arc<TaskRegistry>,
    feature_store: Arc<dyn FeatureStore>,
    audit: AuditLog,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager").finish_non_exhaustive()
    }
}

impl RecoveryManager {
    #[must_use]
    pub fn new(
        registry: Arc<TaskRegistry>,
        feature_store: Arc<dyn FeatureStore>,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            feature_store,
            audit,
        }
    }

    /// Applies the failure policy to `failed`.
    ///
    /// Runs that moved on since `failed` was captured are skipped, so a
    /// stale copy can never trigger a second retry.
    pub async fn handle(
        &self,
        snapshot: &ConfigSnapshot,
        failed: &TaskRun,
        now: DateTime<Utc>,
    ) -> RecoveryReport {
        let policy = snapshot.policy(&failed.agent);
        let max_deferrals = snapshot.settings().max_deferrals;
        let ledger = self.registry.ledger(&failed.agent);

        let step = {
            let mut ledger = lock(&ledger);
            let Some(run) = current(&ledger, failed) else {
                return RecoveryReport::new(RecoveryOutcome::Skipped);
            };
            match decide(&policy, &run, max_deferrals, now) {
                RecoveryDecision::Retry { not_before } => {
                    Step::Done(reschedule(&mut ledger, run, not_before, false, now))
                }
                RecoveryDecision::Defer { not_before } => {
                    Step::Done(reschedule(&mut ledger, run, not_before, true, now))
                }
                RecoveryDecision::Terminal(TerminalAction::FallbackToCachedOutput) => {
                    Step::Fallback(run)
                }
                RecoveryDecision::Terminal(action) => {
                    Step::Done(self.terminate(&mut ledger, run, action, now))
                }
            }
        };

        match step {
            Step::Done(report) => report,
            Step::Fallback(run) => self.fall_back(run, now).await,
        }
    }

    async fn fall_back(&self, run: TaskRun, now: DateTime<Utc>) -> RecoveryReport {
        let cached = match self
            .feature_store
            .read(run.agent.as_str(), run.window.start())
            .await
        {
            Ok(Some(record)) => match serde_json::from_value::<OutputIndexRecord>(record.payload) {
                Ok(index) => Some(index),
                Err(e) => {
                    warn!(agent = %run.agent, error = %e, "unreadable output index record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(agent = %run.agent, error = %e, "feature store read failed during fallback");
                None
            }
        };

        let ledger = self.registry.ledger(&run.agent);
        let mut ledger = lock(&ledger);
        let Some(mut run) = current(&ledger, &run) else {
            return RecoveryReport::new(RecoveryOutcome::Skipped);
        };
        let Some(cached) = cached else {
            return self.terminate(&mut ledger, run, TerminalAction::Abandon, now);
        };

        let warning = format!(
            "served cached output of window {} (run {})",
            cached.window, cached.run_id
        );
        if let Err(e) = run.partially_succeed(cached.output, cached.as_of, vec![warning.clone()], now) {
            warn!(run_id = %run.id, error = %e, "cannot apply cached output");
            return RecoveryReport::new(RecoveryOutcome::Skipped);
        }
        ledger.upsert(run.clone());
        self.audit.record(
            AuditRecord::new(now, run.agent.clone(), AuditKind::Fallback, warning)
                .for_run(run.id, run.window),
        );
        info!(agent = %run.agent, window = %run.window, run_id = %run.id, "fell back to cached output");
        RecoveryReport::new(RecoveryOutcome::Resolved {
            action: TerminalAction::FallbackToCachedOutput,
            state: run.state,
        })
    }

    fn terminate(
        &self,
        ledger: &mut AgentLedger,
        mut run: TaskRun,
        action: TerminalAction,
        now: DateTime<Utc>,
    ) -> RecoveryReport {
        if let Err(e) = run.abandon(now) {
            warn!(run_id = %run.id, error = %e, "cannot abandon run");
            return RecoveryReport::new(RecoveryOutcome::Skipped);
        }
        ledger.upsert(run.clone());

        let error = run
            .error_kind
            .as_ref()
            .map_or_else(|| "unknown error".to_string(), ToString::to_string);
        let summary = format!(
            "run {} for window {} abandoned after {} attempt(s): {error}",
            run.id, run.window, run.attempt_count
        );
        let (kind, severity, alert_kind) = match action {
            TerminalAction::SkipDownstream => {
                ledger.block_downstream(summary.clone(), now);
                (AuditKind::SkipDownstream, Severity::Warning, AlertKind::TerminalFailure)
            }
            TerminalAction::Escalate => {
                ledger.pause(summary.clone(), now);
                let cancelled = ledger.cancel_all(ESCALATION_CANCEL_REASON);
                if cancelled > 0 {
                    info!(agent = %run.agent, cancelled, "cancelled in-flight runs of escalated agent");
                }
                (AuditKind::Escalated, Severity::Critical, AlertKind::Escalation)
            }
            TerminalAction::Abandon | TerminalAction::FallbackToCachedOutput => {
                (AuditKind::Abandoned, Severity::Warning, AlertKind::TerminalFailure)
            }
        };

        self.audit.record(
            AuditRecord::new(now, run.agent.clone(), kind, summary.clone()).for_run(run.id, run.window),
        );
        let alert = AlertEvent::new(severity, alert_kind, run.agent.clone(), summary, now)
            .for_run(run.id, run.window);
        RecoveryReport {
            outcome: RecoveryOutcome::Resolved {
                action,
                state: run.state,
            },
            alerts: vec![alert],
        }
    }
}

/// The stored version of `failed`, if it still awaits recovery for the
/// same attempt.
fn current(ledger: &AgentLedger, failed: &TaskRun) -> Option<TaskRun> {
    ledger
        .find_run(failed.id)
        .filter(|run| run.state.awaits_recovery() && run.attempt_count == failed.attempt_count)
        .cloned()
}

fn reschedule(
    ledger: &mut AgentLedger,
    mut run: TaskRun,
    not_before: DateTime<Utc>,
    deferred: bool,
    now: DateTime<Utc>,
) -> RecoveryReport {
    let moved = if deferred {
        run.defer(not_before)
    } else {
        run.schedule_retry(not_before)
    };
    if let Err(e) = moved {
        warn!(run_id = %run.id, error = %e, "cannot reschedule run");
        return RecoveryReport::new(RecoveryOutcome::Skipped);
    }
    info!(
        agent = %run.agent,
        window = %run.window,
        run_id = %run.id,
        attempt = run.attempt_count,
        deferred,
        not_before = %not_before,
        "run rescheduled"
    );
    ledger.upsert(run.clone());
    if !ledger.queue.contains(&run.window) {
        ledger
            .queue
            .push(run.window, run.priority, RunTrigger::Retry, now, Some(not_before));
    }
    RecoveryReport::new(if deferred {
        RecoveryOutcome::Deferred { not_before }
    } else {
        RecoveryOutcome::Retrying { not_before }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::journal::MemoryJournal;
    use crate::run::PriorityClass;
    use chrono::TimeZone;
    use trendline_core::AgentName;
    use trendline_pipeline::{AgentDefinition, InMemoryFeatureStore, RetryPolicy};

    fn name(s: &str) -> AgentName {
        AgentName::new(s).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn window(hour: u32) -> TimeWindow {
        TimeWindow::new(at(hour, 0), at(hour + 1, 0)).unwrap()
    }

    fn failed_run(agent: &str, hour: u32, attempts: u32, error: ErrorKind) -> TaskRun {
        let mut run = TaskRun::new(
            name(agent),
            window(hour),
            PriorityClass::Normal,
            RunTrigger::Cadence,
            at(hour + 1, 0),
        );
        for attempt in 1..=attempts {
            run.begin_attempt().unwrap();
            run.start(at(hour + 1, 0)).unwrap();
            if attempt < attempts {
                run.fail(error.clone(), at(hour + 1, 1)).unwrap();
                run.schedule_retry(at(hour + 1, 2)).unwrap();
            }
        }
        run.fail(error, at(hour + 1, 3)).unwrap();
        run
    }

    fn transient() -> ErrorKind {
        ErrorKind::Transient {
            message: "upstream 503".to_string(),
        }
    }

    struct Fixture {
        manager: RecoveryManager,
        registry: Arc<TaskRegistry>,
        audit: AuditLog,
        store: InMemoryFeatureStore,
        snapshot: ConfigSnapshot,
    }

    fn fixture(policy: FailurePolicy) -> Fixture {
        let journal = Arc::new(MemoryJournal::new());
        let registry = Arc::new(TaskRegistry::new(journal.clone()));
        let audit = AuditLog::new(journal);
        let store = InMemoryFeatureStore::new();
        let snapshot = ConfigSnapshot::build(
            PipelineConfig::default()
                .with_policy("under_test", policy)
                .with_agent(
                    AgentDefinition::new(name("predictor"), "0 * * * *")
                        .with_failure_policy("under_test"),
                ),
        )
        .unwrap();
        let manager = RecoveryManager::new(
            Arc::clone(&registry),
            Arc::new(store.clone()),
            audit.clone(),
        );
        Fixture {
            manager,
            registry,
            audit,
            store,
            snapshot,
        }
    }

    fn store_run(fixture: &Fixture, run: &TaskRun) {
        fixture
            .registry
            .with_ledger(&run.agent, |ledger| ledger.upsert(run.clone()));
    }

    #[test]
    fn decide_retries_until_the_attempt_limit() {
        let policy = FailurePolicy::retrying(
            RetryPolicy::new(3).with_backoff(10, 2.0, 600),
            TerminalAction::Abandon,
        );
        let now = at(12, 0);

        let first = failed_run("predictor", 10, 1, transient());
        assert_eq!(
            decide(&policy, &first, 10, now),
            RecoveryDecision::Retry {
                not_before: now + Duration::seconds(10)
            }
        );
        let second = failed_run("predictor", 10, 2, transient());
        assert_eq!(
            decide(&policy, &second, 10, now),
            RecoveryDecision::Retry {
                not_before: now + Duration::seconds(20)
            }
        );
        let third = failed_run("predictor", 10, 3, transient());
        assert_eq!(
            decide(&policy, &third, 10, now),
            RecoveryDecision::Terminal(TerminalAction::Abandon)
        );
    }

    #[test]
    fn decide_never_retries_config_errors() {
        let policy = FailurePolicy::default();
        let run = failed_run(
            "predictor",
            10,
            1,
            ErrorKind::Config {
                reason: "missing model path".to_string(),
            },
        );
        assert_eq!(
            decide(&policy, &run, 10, at(12, 0)),
            RecoveryDecision::Terminal(TerminalAction::Abandon)
        );
    }

    #[test]
    fn decide_defers_resource_exhaustion_up_to_the_limit() {
        let policy = FailurePolicy::without_retry(TerminalAction::Escalate);
        let mut run = failed_run("predictor", 10, 1, ErrorKind::ResourceExhausted);
        assert_eq!(
            decide(&policy, &run, 2, at(12, 0)),
            RecoveryDecision::Defer {
                not_before: at(12, 0) + Duration::seconds(30)
            }
        );
        run.deferrals = 2;
        assert_eq!(
            decide(&policy, &run, 2, at(12, 0)),
            RecoveryDecision::Terminal(TerminalAction::Escalate)
        );
    }

    #[tokio::test]
    async fn retry_requeues_the_window() {
        let fixture = fixture(FailurePolicy::default());
        let run = failed_run("predictor", 10, 1, ErrorKind::Timeout);
        store_run(&fixture, &run);

        let report = fixture.manager.handle(&fixture.snapshot, &run, at(12, 0)).await;
        assert!(matches!(report.outcome, RecoveryOutcome::Retrying { .. }));
        assert!(report.alerts.is_empty());

        fixture.registry.with_ledger(&name("predictor"), |ledger| {
            assert_eq!(ledger.find_run(run.id).unwrap().state, RunState::Retrying);
            assert_eq!(ledger.backlog().retrying, 1);
        });

        let again = fixture.manager.handle(&fixture.snapshot, &run, at(12, 0)).await;
        assert_eq!(again.outcome, RecoveryOutcome::Skipped);
    }

    #[tokio::test]
    async fn skip_downstream_blocks_dependents() {
        let fixture = fixture(FailurePolicy::without_retry(TerminalAction::SkipDownstream));
        let run = failed_run("predictor", 10, 1, transient());
        store_run(&fixture, &run);

        let report = fixture.manager.handle(&fixture.snapshot, &run, at(12, 0)).await;
        assert_eq!(
            report.outcome,
            RecoveryOutcome::Resolved {
                action: TerminalAction::SkipDownstream,
                state: RunState::Abandoned
            }
        );
        assert_eq!(report.alerts[0].severity, Severity::Warning);
        fixture.registry.with_ledger(&name("predictor"), |ledger| {
            assert!(ledger.downstream_block.is_some());
        });
        assert_eq!(fixture.audit.records()[0].kind, AuditKind::SkipDownstream);
    }

    #[tokio::test]
    async fn escalation_pauses_and_raises_critical_alert() {
        let fixture = fixture(FailurePolicy::without_retry(TerminalAction::Escalate));
        let run = failed_run("predictor", 10, 1, transient());
        store_run(&fixture, &run);

        let report = fixture.manager.handle(&fixture.snapshot, &run, at(12, 0)).await;
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].severity, Severity::Critical);
        assert_eq!(report.alerts[0].kind, AlertKind::Escalation);
        fixture.registry.with_ledger(&name("predictor"), |ledger| {
            assert!(ledger.paused.is_some());
        });
        assert_eq!(fixture.audit.records()[0].kind, AuditKind::Escalated);
    }

    #[tokio::test]
    async fn fallback_serves_the_latest_cached_output() {
        let fixture = fixture(FailurePolicy::without_retry(
            TerminalAction::FallbackToCachedOutput,
        ));
        let cached = OutputIndexRecord {
            run_id: TaskRunId::new(),
            window: window(9),
            output: OutputRef::new("predictor/09"),
            as_of: at(10, 0),
        };
        fixture
            .store
            .append("predictor", at(10, 0), serde_json::to_value(&cached).unwrap())
            .await
            .unwrap();
        let run = failed_run("predictor", 10, 1, transient());
        store_run(&fixture, &run);

        let report = fixture.manager.handle(&fixture.snapshot, &run, at(12, 0)).await;
        assert_eq!(
            report.outcome,
            RecoveryOutcome::Resolved {
                action: TerminalAction::FallbackToCachedOutput,
                state: RunState::PartialSuccess
            }
        );
        fixture.registry.with_ledger(&name("predictor"), |ledger| {
            let stored = ledger.find_run(run.id).unwrap();
            assert_eq!(stored.output, Some(OutputRef::new("predictor/09")));
            assert_eq!(stored.output_as_of, Some(at(10, 0)));
            assert_eq!(stored.warnings.len(), 1);
        });
        assert_eq!(fixture.audit.records()[0].kind, AuditKind::Fallback);
    }

    #[tokio::test]
    async fn fallback_without_cache_abandons() {
        let fixture = fixture(FailurePolicy::without_retry(
            TerminalAction::FallbackToCachedOutput,
        ));
        let run = failed_run("predictor", 10, 1, transient());
        store_run(&fixture, &run);

        let report = fixture.manager.handle(&fixture.snapshot, &run, at(12, 0)).await;
        assert_eq!(
            report.outcome,
            RecoveryOutcome::Resolved {
                action: TerminalAction::Abandon,
                state: RunState::Abandoned
            }
        );
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(fixture.audit.records()[0].kind, AuditKind::Abandoned);
    }
}
