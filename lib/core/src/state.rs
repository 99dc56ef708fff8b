//! Task run lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task run.
///
/// ```text
/// Pending -> Ready -> Running -> {Succeeded, PartialSuccess, Failed, TimedOut}
/// Failed | TimedOut -> Retrying -> Ready
/// Failed | TimedOut -> Abandoned | PartialSuccess (cached fallback)
/// Pending | Ready -> Failed (dependency failure at admission)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Ready,
    Running,
    Succeeded,
    PartialSuccess,
    Failed,
    TimedOut,
    Retrying,
    Abandoned,
}

impl RunState {
    /// Terminal states never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialSuccess | Self::Abandoned)
    }

    /// Failed and timed-out runs wait for the recovery policy.
    #[must_use]
    pub fn awaits_recovery(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Returns true if `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Failed)
                | (Ready, Running)
                | (Ready, Failed)
                | (Running, Succeeded)
                | (Running, PartialSuccess)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Failed | TimedOut, Retrying)
                | (Failed | TimedOut, Abandoned)
                | (Failed | TimedOut, PartialSuccess)
                | (Retrying, Ready)
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Retrying => "retrying",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
