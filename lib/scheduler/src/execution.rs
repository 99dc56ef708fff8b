//! Running one admitted attempt.
//!
//! An execution races the agent against its deadline and its cancellation
//! handle. Whatever wins becomes a [`Completion`]; the losing futures are
//! dropped, so a result arriving after the deadline is never observed.

use crate::budget::PoolPermits;
use crate::run::TaskRun;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use trendline_core::{AgentName, TaskRunId, TimeWindow};
use trendline_pipeline::{AgentExecutor, AgentOutcome, ExecutionRequest};

/// An attempt that has been admitted and must now be executed.
#[derive(Debug)]
pub struct Dispatch {
    /// The run as it was when it entered Running.
    pub run: TaskRun,
    pub request: ExecutionRequest,
    /// Registered name of the executor to invoke.
    pub executor: String,
    pub timeout: Duration,
    pub(crate) cancel: oneshot::Receiver<String>,
    pub(crate) permits: PoolPermits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Outcome(AgentOutcome),
    /// Operator abort or escalation pause.
    Cancelled { reason: String },
    /// No executor is registered under the configured name.
    MissingExecutor { executor: String },
}

/// The result of one attempt, reported back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub run_id: TaskRunId,
    pub agent: AgentName,
    pub window: TimeWindow,
    pub attempt: u32,
    pub result: ExecutionResult,
    pub elapsed: Duration,
}

/// Executes `dispatch` with `executor`, enforcing its deadline.
///
/// The shared pool permits are released before this returns.
pub async fn execute(executor: Option<Arc<dyn AgentExecutor>>, dispatch: Dispatch) -> Completion {
    let Dispatch {
        run,
        request,
        executor: executor_name,
        timeout,
        cancel,
        permits,
    } = dispatch;
    let started = Instant::now();

    let result = match executor {
        None => {
            warn!(agent = %run.agent, executor = %executor_name, "no executor registered");
            ExecutionResult::MissingExecutor {
                executor: executor_name,
            }
        }
        Some(executor) => {
            let cancelled = async move {
                match cancel.await {
                    Ok(reason) => reason,
                    // The ledger dropped the handle; nobody can cancel any more.
                    Err(_) => std::future::pending().await,
                }
            };
            tokio::select! {
                outcome = tokio::time::timeout(timeout, executor.execute(request)) => match outcome {
                    Ok(outcome) => ExecutionResult::Outcome(outcome),
                    Err(_) => {
                        debug!(agent = %run.agent, run_id = %run.id, "execution deadline exceeded");
                        ExecutionResult::Outcome(AgentOutcome::Timeout)
                    }
                },
                reason = cancelled => ExecutionResult::Cancelled { reason },
            }
        }
    };
    drop(permits);

    Completion {
        run_id: run.id,
        agent: run.agent,
        window: run.window,
        attempt: run.attempt_count,
        result,
        elapsed: started.elapsed(),
    }
}
