//! Dependency resolver.
//!
//! For each edge into a candidate's agent the resolver picks the upstream
//! run of the most recent window ending at or before the candidate's window
//! end. The edge is satisfied when that run is in one of the edge's
//! accepted states; its output then becomes an input of the candidate.
//! Satisfied outputs older than the agent's max staleness make the whole
//! candidate Stale, but only once nothing is missing. An old output whose
//! successor window is already due on the upstream's cadence but not yet
//! emitted counts as missing instead, so the outcome does not depend on
//! which agent loop ticks first.

use crate::registry::{AgentLedger, TaskRegistry, lock};
use crate::snapshot::{AgentEntry, ConfigSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use trendline_core::{AgentName, RunState, TimeWindow};
use trendline_pipeline::UpstreamInput;

/// Why an edge is not satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitReason {
    /// The upstream has no run for a compatible window yet.
    NoCompatibleRun,
    /// The compatible run has not finished.
    InProgress { state: RunState },
    /// The compatible run finished in a state the edge does not accept.
    NotAccepted { state: RunState },
    /// The upstream is blocking its dependents until an operator clears it.
    Blocked { reason: String },
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCompatibleRun => f.write_str("no run for a compatible window"),
            Self::InProgress { state } => write!(f, "compatible run is {state}"),
            Self::NotAccepted { state } => write!(f, "compatible run ended {state}"),
            Self::Blocked { reason } => write!(f, "blocked: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingEdge {
    pub upstream: AgentName,
    pub reason: WaitReason,
}

impl MissingEdge {
    fn new(upstream: &AgentName, reason: WaitReason) -> Self {
        Self {
            upstream: upstream.clone(),
            reason,
        }
    }
}

/// Result of resolving a candidate's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { inputs: Vec<UpstreamInput> },
    Waiting { missing: Vec<MissingEdge> },
    /// Every edge is satisfied but `upstream`'s output is `age` old.
    Stale { upstream: AgentName, age: Duration },
}

impl Readiness {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// True if any missing edge waits on an operator rather than on time.
#[must_use]
pub fn waits_for_operator(missing: &[MissingEdge]) -> bool {
    missing
        .iter()
        .any(|edge| matches!(edge.reason, WaitReason::Blocked { .. }))
}

/// Resolves the dependencies of `entry` for `window`.
///
/// Locks each upstream ledger in turn; callers may hold the ledger of
/// `entry` itself.
#[must_use]
pub fn resolve(
    registry: &TaskRegistry,
    snapshot: &ConfigSnapshot,
    entry: &AgentEntry,
    window: &TimeWindow,
) -> Readiness {
    let max_staleness = snapshot.max_staleness(entry);
    let mut inputs = Vec::new();
    let mut missing = Vec::new();
    let mut stale: Option<(AgentName, Duration)> = None;

    for edge in snapshot.graph().upstream_edges(entry.name()) {
        let Some(ledger) = registry.existing(&edge.upstream) else {
            missing.push(MissingEdge::new(&edge.upstream, WaitReason::NoCompatibleRun));
            continue;
        };
        let ledger = lock(&ledger);
        if let Some(reason) = &ledger.downstream_block {
            missing.push(MissingEdge::new(
                &edge.upstream,
                WaitReason::Blocked {
                    reason: reason.clone(),
                },
            ));
            continue;
        }

        let reason = match ledger.latest_run_ending_by(window.end()) {
            None => WaitReason::NoCompatibleRun,
            Some(run) if edge.accepts(run.state) => {
                let Some(output) = &run.output else {
                    missing.push(MissingEdge::new(
                        &edge.upstream,
                        WaitReason::NotAccepted { state: run.state },
                    ));
                    continue;
                };
                let as_of = run.output_as_of.unwrap_or_else(|| run.window.end());
                let age = window.end() - as_of;
                if age > max_staleness {
                    let pending = snapshot.agent(&edge.upstream).is_some_and(|upstream| {
                        window_pending(upstream, &ledger, run.window.end(), window.end())
                    });
                    if pending {
                        missing.push(MissingEdge::new(&edge.upstream, WaitReason::NoCompatibleRun));
                    } else if stale.as_ref().is_none_or(|(_, oldest)| age > *oldest) {
                        stale = Some((edge.upstream.clone(), age));
                    }
                } else {
                    inputs.push(UpstreamInput {
                        agent: edge.upstream.clone(),
                        window: run.window,
                        output: output.clone(),
                        as_of,
                    });
                }
                continue;
            }
            Some(run) if run.is_terminal() => WaitReason::NotAccepted { state: run.state },
            Some(run) => WaitReason::InProgress { state: run.state },
        };
        missing.push(MissingEdge::new(&edge.upstream, reason));
    }

    if !missing.is_empty() {
        return Readiness::Waiting { missing };
    }
    match stale {
        Some((upstream, age)) => Readiness::Stale { upstream, age },
        None => Readiness::Ready { inputs },
    }
}

/// True if `upstream` has a window ending in `(after, bound]` on either of
/// its cadences that the cadence source has not emitted yet.
fn window_pending(
    upstream: &AgentEntry,
    ledger: &AgentLedger,
    after: DateTime<Utc>,
    bound: DateTime<Utc>,
) -> bool {
    let emitted_through = ledger.last_emitted.map(|last| last.end());
    [Some(upstream.cadence.normal()), upstream.cadence.emergency()]
        .into_iter()
        .flatten()
        .filter_map(|cadence| cadence.latest_window(bound))
        .any(|due| due.end() > after && emitted_through.is_none_or(|end| end < due.end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::journal::MemoryJournal;
    use crate::run::{PriorityClass, RunTrigger, TaskRun};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;
    use trendline_pipeline::{
        AgentDefinition, ErrorKind, FailurePolicy, OutputRef, TerminalAction,
    };

    fn name(s: &str) -> AgentName {
        AgentName::new(s).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn window(hour: u32) -> TimeWindow {
        TimeWindow::new(at(hour, 0), at(hour + 1, 0)).unwrap()
    }

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot::build(
            PipelineConfig::default()
                .with_policy(
                    "lenient",
                    FailurePolicy::without_retry(TerminalAction::Abandon).accepting_partial(),
                )
                .with_agent(AgentDefinition::new(name("ingestion"), "0 * * * *"))
                .with_agent(AgentDefinition::new(name("governance"), "0 * * * *"))
                .with_agent(
                    AgentDefinition::new(name("analyzer"), "0 * * * *")
                        .depending_on(name("ingestion"))
                        .with_max_staleness_minutes(90),
                )
                .with_agent(
                    AgentDefinition::new(name("semantic"), "0 * * * *")
                        .depending_on(name("ingestion"))
                        .depending_on(name("governance"))
                        .with_failure_policy("lenient"),
                ),
        )
        .unwrap()
    }

    fn run(agent: &str, window: TimeWindow) -> TaskRun {
        let mut run = TaskRun::new(
            name(agent),
            window,
            PriorityClass::Normal,
            RunTrigger::Cadence,
            window.end(),
        );
        run.begin_attempt().unwrap();
        run.start(window.end()).unwrap();
        run
    }

    fn succeeded(agent: &str, window: TimeWindow) -> TaskRun {
        let mut run = run(agent, window);
        run.succeed(
            OutputRef::new(format!("{agent}/{}", window.start())),
            window.end(),
            window.end(),
        )
        .unwrap();
        run
    }

    fn partial(agent: &str, window: TimeWindow) -> TaskRun {
        let mut run = run(agent, window);
        run.partially_succeed(
            OutputRef::new("partial"),
            window.end(),
            vec!["thin data".to_string()],
            window.end(),
        )
        .unwrap();
        run
    }

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(MemoryJournal::new()))
    }

    fn resolve_for(registry: &TaskRegistry, snapshot: &ConfigSnapshot, agent: &str, window: TimeWindow) -> Readiness {
        resolve(registry, snapshot, snapshot.agent(&name(agent)).unwrap(), &window)
    }

    #[test]
    fn ready_with_compatible_upstream_output() {
        let snapshot = snapshot();
        let registry = registry();
        registry.with_ledger(&name("ingestion"), |l| l.upsert(succeeded("ingestion", window(10))));

        let Readiness::Ready { inputs } = resolve_for(&registry, &snapshot, "analyzer", window(10))
        else {
            panic!("expected Ready");
        };
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].agent, name("ingestion"));
        assert_eq!(inputs[0].window, window(10));
    }

    #[test]
    fn roots_are_always_ready() {
        let snapshot = snapshot();
        let readiness = resolve_for(&registry(), &snapshot, "ingestion", window(10));
        assert_eq!(readiness, Readiness::Ready { inputs: vec![] });
    }

    #[test]
    fn waits_for_missing_or_running_upstream() {
        let snapshot = snapshot();
        let registry = registry();
        assert_eq!(
            resolve_for(&registry, &snapshot, "analyzer", window(10)),
            Readiness::Waiting {
                missing: vec![MissingEdge::new(&name("ingestion"), WaitReason::NoCompatibleRun)]
            }
        );

        registry.with_ledger(&name("ingestion"), |l| l.upsert(run("ingestion", window(10))));
        assert_eq!(
            resolve_for(&registry, &snapshot, "analyzer", window(10)),
            Readiness::Waiting {
                missing: vec![MissingEdge::new(
                    &name("ingestion"),
                    WaitReason::InProgress {
                        state: RunState::Running
                    }
                )]
            }
        );
    }

    #[test]
    fn partial_success_only_satisfies_lenient_edges() {
        let snapshot = snapshot();
        let registry = registry();
        registry.with_ledger(&name("ingestion"), |l| l.upsert(partial("ingestion", window(10))));
        registry.with_ledger(&name("governance"), |l| l.upsert(succeeded("governance", window(10))));

        assert!(matches!(
            resolve_for(&registry, &snapshot, "analyzer", window(10)),
            Readiness::Waiting { .. }
        ));
        let Readiness::Ready { inputs } = resolve_for(&registry, &snapshot, "semantic", window(10))
        else {
            panic!("expected Ready");
        };
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn old_outputs_are_stale() {
        let snapshot = snapshot();
        let registry = registry();
        registry.with_ledger(&name("ingestion"), |l| {
            l.upsert(succeeded("ingestion", window(7)));
            l.mark_emitted(window(10));
        });

        let readiness = resolve_for(&registry, &snapshot, "analyzer", window(10));
        assert_eq!(
            readiness,
            Readiness::Stale {
                upstream: name("ingestion"),
                age: Duration::hours(3)
            }
        );
    }

    #[test]
    fn output_exactly_at_max_staleness_is_ready() {
        let snapshot = snapshot();
        let registry = registry();
        registry.with_ledger(&name("ingestion"), |l| {
            let mut run = run("ingestion", window(9));
            run.succeed(OutputRef::new("ingestion/09"), at(9, 30), at(10, 0))
                .unwrap();
            l.upsert(run);
            l.mark_emitted(window(10));
        });

        let Readiness::Ready { inputs } = resolve_for(&registry, &snapshot, "analyzer", window(10))
        else {
            panic!("expected Ready at exactly 90 minutes");
        };
        assert_eq!(inputs[0].as_of, at(9, 30));
    }

    #[test]
    fn old_output_waits_while_the_next_upstream_window_is_unemitted() {
        let snapshot = snapshot();
        let registry = registry();
        registry.with_ledger(&name("ingestion"), |l| {
            l.upsert(succeeded("ingestion", window(8)));
            l.mark_emitted(window(8));
        });

        assert_eq!(
            resolve_for(&registry, &snapshot, "analyzer", window(10)),
            Readiness::Waiting {
                missing: vec![MissingEdge::new(&name("ingestion"), WaitReason::NoCompatibleRun)]
            }
        );
    }

    #[test]
    fn blocked_upstream_waits_for_operator() {
        let snapshot = snapshot();
        let registry = registry();
        registry.with_ledger(&name("ingestion"), |l| {
            let mut failed = run("ingestion", window(10));
            failed
                .fail(
                    ErrorKind::Executor {
                        message: "boom".to_string(),
                    },
                    at(11, 0),
                )
                .unwrap();
            failed.abandon(at(11, 0)).unwrap();
            l.upsert(failed);
            l.block_downstream("run abandoned".to_string(), at(11, 0));
        });

        let Readiness::Waiting { missing } = resolve_for(&registry, &snapshot, "analyzer", window(10))
        else {
            panic!("expected Waiting");
        };
        assert!(waits_for_operator(&missing));
        assert_eq!(missing[0].reason.to_string(), "blocked: run abandoned");
    }
}
