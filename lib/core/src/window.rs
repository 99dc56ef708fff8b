//! Half-open time windows.
//!
//! A window `[start, end)` is the span of wall-clock time a task run covers
//! or produces data for. Windows order by start, then end, so older windows
//! sort first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error returned when a window's end does not come after its start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidWindowError {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for InvalidWindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "window end {} must be after start {}",
            self.end.to_rfc3339(),
            self.start.to_rfc3339()
        )
    }
}

impl std::error::Error for InvalidWindowError {}

/// A half-open span of time `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = InvalidWindowError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl TimeWindow {
    /// Creates a window.
    ///
    /// # Errors
    ///
    /// Returns an error unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidWindowError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(InvalidWindowError { start, end })
        }
    }

    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Returns true if `instant` falls inside the window.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Returns true if this window fully covers `other`.
    #[must_use]
    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// How long ago the window closed. Negative for windows still open.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
