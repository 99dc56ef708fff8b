//! Task runs.
//!
//! A [`TaskRun`] is identified by `(agent, window)` and carries every
//! attempt made for that window. All state changes go through the
//! transition methods here, which refuse moves the lifecycle does not
//! allow.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use trendline_core::{AgentName, RunState, TaskRunId, TimeWindow};
use trendline_pipeline::{ErrorKind, OutputRef};

/// Admission priority. Declared lowest first so `Ord` ranks Emergency
/// highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    #[default]
    Normal,
    Expedited,
    Emergency,
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Expedited => "expedited",
            Self::Emergency => "emergency",
        })
    }
}

/// What created a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// A cadence tick.
    Cadence,
    /// An operator submission or backfill.
    Manual,
    /// A new attempt queued by the recovery manager.
    Retry,
}

/// Error returned for a transition the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub run_id: TaskRunId,
    pub from: RunState,
    pub to: RunState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} cannot move from {} to {}",
            self.run_id, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

/// One agent window and all attempts made for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub agent: AgentName,
    pub window: TimeWindow,
    pub state: RunState,
    /// Attempts made so far, including admission-time dependency failures.
    pub attempt_count: u32,
    pub priority: PriorityClass,
    pub trigger: RunTrigger,
    pub created_at: DateTime<Utc>,
    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the latest attempt.
    pub ended_at: Option<DateTime<Utc>>,
    /// Earliest start of the next attempt while retrying.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt.
    pub error_kind: Option<ErrorKind>,
    pub output: Option<OutputRef>,
    /// Timestamp of the data `output` represents.
    pub output_as_of: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    /// ResourceExhausted deferrals, which do not count as attempts.
    pub deferrals: u32,
}

impl TaskRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(
        agent: AgentName,
        window: TimeWindow,
        priority: PriorityClass,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskRunId::new(),
            agent,
            window,
            state: RunState::Pending,
            attempt_count: 0,
            priority,
            trigger,
            created_at: now,
            started_at: None,
            ended_at: None,
            next_attempt_at: None,
            error_kind: None,
            output: None,
            output_as_of: None,
            warnings: Vec::new(),
            deferrals: 0,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, to: RunState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                run_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Counts a new attempt and moves the run to Ready.
    ///
    /// # Errors
    ///
    /// Fails unless the run is Pending or Retrying.
    pub fn begin_attempt(&mut self) -> Result<(), TransitionError> {
        self.transition(RunState::Ready)?;
        self.attempt_count += 1;
        self.next_attempt_at = None;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails unless the run is Ready.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunState::Running)?;
        self.started_at = Some(at);
        self.ended_at = None;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails unless the run is Running.
    pub fn succeed(
        &mut self,
        output: OutputRef,
        as_of: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RunState::Succeeded)?;
        self.output = Some(output);
        self.output_as_of = Some(as_of);
        self.ended_at = Some(at);
        Ok(())
    }

    /// Records a usable but incomplete output. Also used when a failed run
    /// falls back to a cached output.
    ///
    /// # Errors
    ///
    /// Fails unless the run is Running, Failed or TimedOut.
    pub fn partially_succeed(
        &mut self,
        output: OutputRef,
        as_of: DateTime<Utc>,
        warnings: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RunState::PartialSuccess)?;
        self.output = Some(output);
        self.output_as_of = Some(as_of);
        self.warnings.extend(warnings);
        self.ended_at = Some(at);
        Ok(())
    }

    /// Records a failed attempt. A [`ErrorKind::Timeout`] moves the run to
    /// TimedOut, anything else to Failed.
    ///
    /// # Errors
    ///
    /// Fails unless the run is Pending, Ready or Running.
    pub fn fail(&mut self, error: ErrorKind, at: DateTime<Utc>) -> Result<(), TransitionError> {
        let to = if error == ErrorKind::Timeout && self.state == RunState::Running {
            RunState::TimedOut
        } else {
            RunState::Failed
        };
        self.transition(to)?;
        self.error_kind = Some(error);
        self.ended_at = Some(at);
        Ok(())
    }

    /// # Errors
    ///
    /// Fails unless the run is Failed or TimedOut.
    pub fn schedule_retry(&mut self, not_before: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunState::Retrying)?;
        self.next_attempt_at = Some(not_before);
        Ok(())
    }

    /// Schedules another attempt without counting the one that just
    /// failed for lack of resources.
    ///
    /// # Errors
    ///
    /// Fails unless the run is Failed or TimedOut.
    pub fn defer(&mut self, not_before: DateTime<Utc>) -> Result<(), TransitionError> {
        self.schedule_retry(not_before)?;
        self.attempt_count = self.attempt_count.saturating_sub(1);
        self.deferrals += 1;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails unless the run is Failed or TimedOut.
    pub fn abandon(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunState::Abandoned)?;
        self.ended_at = Some(at);
        Ok(())
    }

    /// Duration of the latest attempt, if it has ended.
    #[must_use]
    pub fn attempt_duration(&self) -> Option<Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn run() -> TaskRun {
        TaskRun::new(
            AgentName::new("analyzer").unwrap(),
            TimeWindow::new(at(10, 0), at(11, 0)).unwrap(),
            PriorityClass::Normal,
            RunTrigger::Cadence,
            at(11, 0),
        )
    }

    #[test]
    fn priority_ordering() {
        assert!(PriorityClass::Emergency > PriorityClass::Expedited);
        assert!(PriorityClass::Expedited > PriorityClass::Normal);
    }

    #[test]
    fn happy_path() {
        let mut run = run();
        run.begin_attempt().unwrap();
        run.start(at(11, 1)).unwrap();
        run.succeed(OutputRef::new("analyzer/10"), at(11, 0), at(11, 5))
            .unwrap();

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.attempt_count, 1);
        assert_eq!(run.attempt_duration(), Some(Duration::minutes(4)));
        assert!(run.is_terminal());
    }

    #[test]
    fn retry_cycle_counts_attempts() {
        let mut run = run();
        run.begin_attempt().unwrap();
        run.start(at(11, 1)).unwrap();
        run.fail(ErrorKind::Timeout, at(11, 6)).unwrap();
        assert_eq!(run.state, RunState::TimedOut);

        run.schedule_retry(at(11, 7)).unwrap();
        assert_eq!(run.next_attempt_at, Some(at(11, 7)));
        run.begin_attempt().unwrap();
        assert_eq!(run.attempt_count, 2);
        assert_eq!(run.next_attempt_at, None);
        assert_eq!(run.error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn deferral_refunds_the_attempt() {
        let mut run = run();
        run.begin_attempt().unwrap();
        run.start(at(11, 1)).unwrap();
        run.fail(ErrorKind::ResourceExhausted, at(11, 2)).unwrap();
        run.defer(at(11, 3)).unwrap();
        assert_eq!(run.attempt_count, 0);
        assert_eq!(run.deferrals, 1);
        assert_eq!(run.state, RunState::Retrying);
    }

    #[test]
    fn admission_failure_skips_running() {
        let mut run = run();
        run.begin_attempt().unwrap();
        run.fail(
            ErrorKind::DependencyUnmet {
                upstream: vec![AgentName::new("ingestion").unwrap()],
            },
            at(11, 0),
        )
        .unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.attempt_count, 1);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut run = run();
        let err = run.start(at(11, 0)).unwrap_err();
        assert_eq!(err.from, RunState::Pending);
        assert_eq!(err.to, RunState::Running);

        run.begin_attempt().unwrap();
        run.start(at(11, 1)).unwrap();
        run.succeed(OutputRef::new("x"), at(11, 0), at(11, 2)).unwrap();
        assert!(run.abandon(at(11, 3)).is_err());
        assert!(run.schedule_retry(at(11, 3)).is_err());
    }
}
