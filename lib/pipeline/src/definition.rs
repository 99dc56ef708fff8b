//! Agent definitions.
//!
//! An [`AgentDefinition`] describes one agent type: when its windows come
//! due, how many runs may execute at once, what it depends on and which
//! failure policy applies. Definitions are read from configuration and are
//! never mutated afterwards; a reload swaps the whole set.

use crate::error::DefinitionError;
use serde::{Deserialize, Serialize};
use trendline_core::AgentName;

/// Coarse memory/CPU class used for process-wide execution ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Light,
    #[default]
    Standard,
    Heavy,
}

impl ResourceClass {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Heavy => "heavy",
        }
    }
}

/// What to emit when several cadence windows elapsed without being emitted,
/// typically after downtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedWindows {
    /// Emit only the most recent elapsed window.
    #[default]
    Latest,
    /// Emit every missed window, oldest first.
    CatchUp,
}

/// Immutable descriptor of one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: AgentName,
    /// Cadence expression, e.g. `0 * * * *` or `@every 15m`.
    pub cadence: String,
    /// Faster cadence used while the agent is backlogged or escalated.
    #[serde(default)]
    pub emergency_cadence: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub depends_on: Vec<AgentName>,
    /// Id of the failure policy in the `policies` table.
    #[serde(default = "default_failure_policy")]
    pub failure_policy: String,
    /// Registered executor name. Defaults to the agent name.
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_staleness_minutes: Option<u64>,
    #[serde(default)]
    pub sla_minutes: Option<u64>,
    #[serde(default)]
    pub missed_windows: MissedWindows,
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_failure_policy() -> String {
    "default".to_string()
}

impl AgentDefinition {
    /// Creates a definition with default limits and no dependencies.
    #[must_use]
    pub fn new(name: AgentName, cadence: impl Into<String>) -> Self {
        Self {
            name,
            cadence: cadence.into(),
            emergency_cadence: None,
            max_concurrency: default_max_concurrency(),
            resource_class: ResourceClass::default(),
            depends_on: Vec::new(),
            failure_policy: default_failure_policy(),
            executor: None,
            timeout_seconds: None,
            max_staleness_minutes: None,
            sla_minutes: None,
            missed_windows: MissedWindows::default(),
        }
    }

    #[must_use]
    pub fn with_emergency_cadence(mut self, cadence: impl Into<String>) -> Self {
        self.emergency_cadence = Some(cadence.into());
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    #[must_use]
    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = class;
        self
    }

    #[must_use]
    pub fn depending_on(mut self, upstream: AgentName) -> Self {
        self.depends_on.push(upstream);
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: impl Into<String>) -> Self {
        self.failure_policy = policy.into();
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_max_staleness_minutes(mut self, minutes: u64) -> Self {
        self.max_staleness_minutes = Some(minutes);
        self
    }

    #[must_use]
    pub fn with_sla_minutes(mut self, minutes: u64) -> Self {
        self.sla_minutes = Some(minutes);
        self
    }

    #[must_use]
    pub fn with_missed_windows(mut self, missed: MissedWindows) -> Self {
        self.missed_windows = missed;
        self
    }

    /// Name the executor is registered under.
    #[must_use]
    pub fn executor_name(&self) -> &str {
        self.executor.as_deref().unwrap_or(self.name.as_str())
    }

    /// Checks the limits that do not depend on other definitions.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero concurrency ceiling, a zero timeout or an
    /// empty cadence expression.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let invalid = |reason: &str| DefinitionError::InvalidAgent {
            agent: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.cadence.trim().is_empty() {
            return Err(invalid("cadence expression is empty"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.timeout_seconds == Some(0) {
            return Err(invalid("timeout_seconds must be at least 1"));
        }
        if self.failure_policy.is_empty() {
            return Err(invalid("failure_policy is empty"));
        }
        Ok(())
    }
}
