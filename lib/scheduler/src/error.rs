//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ScheduleError`: a cadence expression that cannot be evaluated
//! - `ConfigError`: a configuration that must not be scheduled (fatal at startup)
//! - `JournalError`: run journal I/O
//! - `OperatorError`: an operator request that names something that does not exist
//! - `DeliveryError`: an alert sink that could not deliver
//!
//! Per-task failures are not errors at this level; they are run states.

use std::fmt;
use trendline_core::{AgentName, RunState, TaskRunId};
use trendline_pipeline::{DefinitionError, GraphError};

/// Errors from parsing a cadence expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    InvalidExpression { expression: String, reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidExpression { expression, reason } => {
                write!(f, "invalid cadence expression '{expression}': {reason}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors that reject a configuration at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration sources could not be read or deserialized.
    Load { reason: String },
    /// An agent's cadence expression does not parse.
    InvalidCadence {
        agent: AgentName,
        source: ScheduleError,
    },
    /// An agent references a failure policy that is not defined.
    UnknownPolicy { agent: AgentName, policy: String },
    /// A scheduler setting is out of range.
    InvalidSetting { setting: String, reason: String },
    Definition(DefinitionError),
    Graph(GraphError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load { reason } => write!(f, "failed to load configuration: {reason}"),
            Self::InvalidCadence { agent, source } => {
                write!(f, "agent '{agent}': {source}")
            }
            Self::UnknownPolicy { agent, policy } => {
                write!(f, "agent '{agent}' references unknown failure policy '{policy}'")
            }
            Self::InvalidSetting { setting, reason } => {
                write!(f, "invalid setting '{setting}': {reason}")
            }
            Self::Definition(e) => write!(f, "{e}"),
            Self::Graph(e) => write!(f, "invalid dependency graph: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<DefinitionError> for ConfigError {
    fn from(e: DefinitionError) -> Self {
        Self::Definition(e)
    }
}

impl From<GraphError> for ConfigError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

/// Errors from the run journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    Io { path: String, reason: String },
    Encode { reason: String },
    Decode { line: usize, reason: String },
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, reason } => write!(f, "journal I/O failed for {path}: {reason}"),
            Self::Encode { reason } => write!(f, "failed to encode journal entry: {reason}"),
            Self::Decode { line, reason } => {
                write!(f, "failed to decode journal line {line}: {reason}")
            }
        }
    }
}

impl std::error::Error for JournalError {}

/// Errors returned to operator calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorError {
    UnknownAgent { agent: AgentName },
    RunNotFound { run_id: TaskRunId },
    RunNotRunning { run_id: TaskRunId, state: RunState },
    NotPaused { agent: AgentName },
    NotBlocked { agent: AgentName },
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAgent { agent } => write!(f, "unknown agent: {agent}"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::RunNotRunning { run_id, state } => {
                write!(f, "run {run_id} is not running (state: {state})")
            }
            Self::NotPaused { agent } => write!(f, "agent '{agent}' is not paused"),
            Self::NotBlocked { agent } => {
                write!(f, "agent '{agent}' is not blocking its dependents")
            }
        }
    }
}

impl std::error::Error for OperatorError {}

/// Error returned by an alert sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub reason: String,
}

impl DeliveryError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert delivery failed: {}", self.reason)
    }
}

impl std::error::Error for DeliveryError {}
