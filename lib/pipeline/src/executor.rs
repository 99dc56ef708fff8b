//! The contract every agent implements.
//!
//! The scheduler treats an agent as a black box: it hands over a window,
//! references to upstream outputs and a deadline, and gets back one of four
//! outcomes. Inputs and outputs are opaque references into the feature
//! store; payloads never pass through the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use trendline_core::{AgentName, TaskRunId, TimeWindow};

/// Opaque handle to an agent output, e.g. a feature-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRef(String);

impl OutputRef {
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of an upstream run handed to a downstream execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamInput {
    pub agent: AgentName,
    pub window: TimeWindow,
    pub output: OutputRef,
    /// Timestamp of the data the output represents.
    pub as_of: DateTime<Utc>,
}

/// Everything an agent needs to process one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub run_id: TaskRunId,
    pub agent: AgentName,
    pub window: TimeWindow,
    /// 1-based attempt number.
    pub attempt: u32,
    pub inputs: Vec<UpstreamInput>,
    /// Results arriving after this instant are discarded.
    pub deadline: DateTime<Utc>,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or upstream API hiccup.
    Transient { message: String },
    /// The agent could not get the resources it needs right now.
    ResourceExhausted,
    /// Upstream data never became available within the wait limit.
    DependencyUnmet { upstream: Vec<AgentName> },
    /// Upstream succeeded but its output is too old.
    StaleDependency {
        upstream: AgentName,
        age_minutes: i64,
    },
    /// The agent rejected its own configuration.
    Config { reason: String },
    /// The agent reported a failure.
    Executor { message: String },
    /// The deadline passed before the agent returned.
    Timeout,
    /// The run was cancelled while executing.
    Cancelled { reason: String },
}

impl ErrorKind {
    /// Config errors will not heal by retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::ResourceExhausted => "resource_exhausted",
            Self::DependencyUnmet { .. } => "dependency_unmet",
            Self::StaleDependency { .. } => "stale_dependency",
            Self::Config { .. } => "config",
            Self::Executor { .. } => "executor",
            Self::Timeout => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient error: {message}"),
            Self::ResourceExhausted => write!(f, "resources exhausted"),
            Self::DependencyUnmet { upstream } => {
                let names: Vec<&str> = upstream.iter().map(AgentName::as_str).collect();
                write!(f, "dependencies unmet: {}", names.join(", "))
            }
            Self::StaleDependency {
                upstream,
                age_minutes,
            } => write!(
                f,
                "output of '{upstream}' is stale ({age_minutes} minutes old)"
            ),
            Self::Config { reason } => write!(f, "configuration error: {reason}"),
            Self::Executor { message } => write!(f, "executor failure: {message}"),
            Self::Timeout => write!(f, "deadline exceeded"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// What an agent returns for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Succeeded {
        output: OutputRef,
    },
    PartialSuccess {
        output: OutputRef,
        warnings: Vec<String>,
    },
    Failed {
        error: ErrorKind,
    },
    Timeout,
}

impl AgentOutcome {
    #[must_use]
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self::Succeeded {
            output: OutputRef::new(output),
        }
    }

    #[must_use]
    pub fn failed(error: ErrorKind) -> Self {
        Self::Failed { error }
    }
}

/// Capability implemented by every agent.
///
/// Implementations must be safe to call concurrently for different windows.
/// The dispatcher never runs the same agent window twice at once.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> AgentOutcome;
}

/// Executors keyed by registered name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn AgentExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn AgentExecutor>) -> Self {
        self.register(name, executor);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}
