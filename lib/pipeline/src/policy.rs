//! Failure policies.
//!
//! A policy decides what happens after a run fails or times out: retry
//! with exponential backoff for a bounded number of attempts, then take a
//! terminal action. Policies are named in configuration and referenced by
//! agent definitions.

use crate::error::DefinitionError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use trendline_core::RunState;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_seconds")]
    pub initial_backoff_seconds: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

fn default_initial_backoff_seconds() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_seconds() -> u64 {
    600
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_seconds: default_initial_backoff_seconds(),
            multiplier: default_multiplier(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, initial_seconds: u64, multiplier: f64, max_seconds: u64) -> Self {
        self.initial_backoff_seconds = initial_seconds;
        self.multiplier = multiplier;
        self.max_backoff_seconds = max_seconds;
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at the maximum.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.initial_backoff_seconds as f64 * self.multiplier.powi(exponent);
        let capped = if seconds.is_finite() {
            seconds.min(self.max_backoff_seconds as f64)
        } else {
            self.max_backoff_seconds as f64
        };
        Duration::milliseconds((capped * 1000.0) as i64)
    }
}

/// Action taken once retries are exhausted, or immediately when a policy
/// has no retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalAction {
    /// Mark the run abandoned.
    #[default]
    Abandon,
    /// Serve the agent's latest stored output as a partial success.
    FallbackToCachedOutput,
    /// Abandon the run and hold every dependent agent until an operator
    /// clears the block.
    SkipDownstream,
    /// Abandon the run, raise a critical alert and pause the agent until
    /// acknowledged.
    Escalate,
}

impl TerminalAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Abandon => "abandon",
            Self::FallbackToCachedOutput => "fallback_to_cached_output",
            Self::SkipDownstream => "skip_downstream",
            Self::Escalate => "escalate",
        }
    }
}

/// Per-agent-type failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_exhausted: TerminalAction,
    /// Downstream of this agent accepts partial successes from upstream.
    #[serde(default)]
    pub accept_partial: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            retry: Some(RetryPolicy::new(3)),
            on_exhausted: TerminalAction::Abandon,
            accept_partial: false,
        }
    }
}

impl FailurePolicy {
    #[must_use]
    pub fn retrying(retry: RetryPolicy, on_exhausted: TerminalAction) -> Self {
        Self {
            retry: Some(retry),
            on_exhausted,
            accept_partial: false,
        }
    }

    #[must_use]
    pub fn without_retry(on_exhausted: TerminalAction) -> Self {
        Self {
            retry: None,
            on_exhausted,
            accept_partial: false,
        }
    }

    #[must_use]
    pub fn accepting_partial(mut self) -> Self {
        self.accept_partial = true;
        self
    }

    /// Total attempts allowed before the terminal action.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts)
    }

    /// Upstream states that satisfy a dependency edge for agents using this
    /// policy.
    #[must_use]
    pub fn required_states(&self) -> Vec<RunState> {
        if self.accept_partial {
            vec![RunState::Succeeded, RunState::PartialSuccess]
        } else {
            vec![RunState::Succeeded]
        }
    }

    /// # Errors
    ///
    /// Returns an error for zero attempts, a multiplier below 1 or a
    /// maximum backoff smaller than the initial one.
    pub fn validate(&self, id: &str) -> Result<(), DefinitionError> {
        let Some(retry) = &self.retry else {
            return Ok(());
        };
        let invalid = |reason: &str| DefinitionError::InvalidPolicy {
            policy: id.to_string(),
            reason: reason.to_string(),
        };
        if retry.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(invalid("multiplier must be a finite number >= 1"));
        }
        if retry.max_backoff_seconds < retry.initial_backoff_seconds {
            return Err(invalid("max_backoff_seconds is below initial_backoff_seconds"));
        }
        Ok(())
    }
}
