//! Cadence evaluation.
//!
//! A [`Cadence`] turns an expression into fire times; consecutive fire
//! times bound the windows an agent processes. Everything here is a pure
//! function of the expression, the current time and the caller-supplied
//! "last emitted window", which lives in the task registry so restarts
//! never re-emit a window.
//!
//! Supported expressions:
//! - 5-field cron (`0 * * * *`), evaluated with an implicit seconds field of 0
//! - 6 or 7-field cron with seconds
//! - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`
//! - `@every 15m` (units `s`, `m`, `h`, `d`), aligned to the Unix epoch

use crate::error::ScheduleError;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use trendline_core::TimeWindow;
use trendline_pipeline::{AgentDefinition, MissedWindows};

/// Doublings of the one-hour lookback used to find past cron fire times.
/// Sixteen doublings reach back about seven years.
const MAX_LOOKBACK_DOUBLINGS: u32 = 16;

/// A parsed cadence expression.
#[derive(Clone)]
pub enum Cadence {
    Cron {
        expression: String,
        schedule: Arc<Schedule>,
    },
    Every {
        expression: String,
        interval: Duration,
    },
}

impl fmt::Debug for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cadence").field(&self.expression()).finish()
    }
}

impl Cadence {
    /// Parses a cadence expression.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is neither valid cron nor a
    /// positive `@every` interval.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let invalid = |reason: String| ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        if let Some(spec) = trimmed.strip_prefix("@every") {
            let interval = parse_interval(spec.trim()).map_err(invalid)?;
            return Ok(Self::Every {
                expression: trimmed.to_string(),
                interval,
            });
        }

        let normalized = if trimmed.starts_with('@') {
            trimmed.to_string()
        } else {
            match trimmed.split_whitespace().count() {
                5 => format!("0 {trimmed}"),
                6 | 7 => trimmed.to_string(),
                n => return Err(invalid(format!("expected 5 to 7 fields, got {n}"))),
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::Cron {
            expression: trimmed.to_string(),
            schedule: Arc::new(schedule),
        })
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        match self {
            Self::Cron { expression, .. } | Self::Every { expression, .. } => expression,
        }
    }

    /// First fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedule, .. } => schedule.after(&after).next(),
            Self::Every { interval, .. } => {
                let step = interval.num_milliseconds();
                let elapsed = after.timestamp_millis();
                let next = (elapsed.div_euclid(step) + 1) * step;
                DateTime::from_timestamp_millis(next)
            }
        }
    }

    /// The two most recent fire times at or before `at`, oldest first.
    #[must_use]
    pub fn last_two_fires(&self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            Self::Cron { schedule, .. } => {
                let mut span = Duration::hours(1);
                for _ in 0..=MAX_LOOKBACK_DOUBLINGS {
                    let from = at - span;
                    let mut previous = None;
                    let mut last = None;
                    for fire in schedule.after(&from).take_while(|fire| *fire <= at) {
                        previous = last;
                        last = Some(fire);
                    }
                    if let (Some(previous), Some(last)) = (previous, last) {
                        return Some((previous, last));
                    }
                    span = span + span;
                }
                None
            }
            Self::Every { interval, .. } => {
                let step = interval.num_milliseconds();
                let last = at.timestamp_millis().div_euclid(step) * step;
                let last = DateTime::from_timestamp_millis(last)?;
                Some((last.checked_sub_signed(*interval)?, last))
            }
        }
    }

    /// The most recent fully elapsed window at `now`.
    #[must_use]
    pub fn latest_window(&self, now: DateTime<Utc>) -> Option<TimeWindow> {
        let (start, end) = self.last_two_fires(now)?;
        TimeWindow::new(start, end).ok()
    }

    /// Lazy, unbounded sequence of consecutive windows starting at `start`.
    ///
    /// The first window runs from `start` to the next fire time, so a
    /// sequence resumed from a previous window's end has no gaps even if
    /// `start` is not on this cadence's grid.
    #[must_use]
    pub fn windows_from(&self, start: DateTime<Utc>) -> Windows<'_> {
        Windows {
            cadence: self,
            cursor: Some(start),
        }
    }

    /// Windows that came due by `now` and have not been emitted yet.
    #[must_use]
    pub fn due_windows(
        &self,
        now: DateTime<Utc>,
        last_emitted: Option<&TimeWindow>,
        missed: MissedWindows,
        max_catch_up: usize,
    ) -> Vec<TimeWindow> {
        let Some(latest) = self.latest_window(now) else {
            return Vec::new();
        };
        let Some(last) = last_emitted else {
            return vec![latest];
        };
        if last.end() >= latest.end() {
            return Vec::new();
        }
        match missed {
            MissedWindows::Latest => match self.windows_from(last.end()).next() {
                Some(next) if next.end() == latest.end() => vec![next],
                _ => vec![latest],
            },
            MissedWindows::CatchUp => self
                .windows_from(last.end())
                .take_while(|window| window.end() <= now)
                .take(max_catch_up.max(1))
                .collect(),
        }
    }
}

/// Iterator returned by [`Cadence::windows_from`].
#[derive(Debug)]
pub struct Windows<'a> {
    cadence: &'a Cadence,
    cursor: Option<DateTime<Utc>>,
}

impl Iterator for Windows<'_> {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        let start = self.cursor?;
        let end = self.cadence.next_after(start);
        self.cursor = end;
        TimeWindow::new(start, end?).ok()
    }
}

fn parse_interval(spec: &str) -> Result<Duration, String> {
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in interval '{spec}'"))?;
    let (amount, unit) = spec.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| format!("invalid interval amount in '{spec}'"))?;
    let interval = match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        other => return Err(format!("unknown interval unit '{other}'")),
    }
    .ok_or_else(|| format!("interval '{spec}' out of range"))?;
    if interval <= Duration::zero() {
        return Err("interval must be positive".to_string());
    }
    Ok(interval)
}

/// Which of an agent's cadences produced a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceMode {
    Normal,
    Emergency,
}

/// Backlog input to cadence selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogSignal {
    /// Candidates queued, parked or awaiting retry for the agent.
    pub depth: usize,
    /// Depth at which the emergency cadence takes over. Zero disables it.
    pub threshold: usize,
    /// The drift monitor asked for the emergency cadence until this instant.
    pub emergency_until: Option<DateTime<Utc>>,
}

impl BacklogSignal {
    #[must_use]
    pub fn wants_emergency(&self, now: DateTime<Utc>) -> bool {
        let backlogged = self.threshold > 0 && self.depth >= self.threshold;
        let requested = self.emergency_until.is_some_and(|until| now < until);
        backlogged || requested
    }
}

/// A window emitted by the cadence source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueWindow {
    pub window: TimeWindow,
    pub mode: CadenceMode,
}

/// The parsed cadences of one agent.
#[derive(Debug, Clone)]
pub struct AgentCadence {
    normal: Cadence,
    emergency: Option<Cadence>,
    missed: MissedWindows,
}

impl AgentCadence {
    /// # Errors
    ///
    /// Returns an error if either expression fails to parse.
    pub fn from_definition(definition: &AgentDefinition) -> Result<Self, ScheduleError> {
        Ok(Self {
            normal: Cadence::parse(&definition.cadence)?,
            emergency: definition
                .emergency_cadence
                .as_deref()
                .map(Cadence::parse)
                .transpose()?,
            missed: definition.missed_windows,
        })
    }

    #[must_use]
    pub fn normal(&self) -> &Cadence {
        &self.normal
    }

    #[must_use]
    pub fn emergency(&self) -> Option<&Cadence> {
        self.emergency.as_ref()
    }

    /// Picks the cadence in force for `signal` at `now`.
    #[must_use]
    pub fn select(&self, signal: &BacklogSignal, now: DateTime<Utc>) -> (&Cadence, CadenceMode) {
        match &self.emergency {
            Some(emergency) if signal.wants_emergency(now) => (emergency, CadenceMode::Emergency),
            _ => (&self.normal, CadenceMode::Normal),
        }
    }

    /// Windows due at `now` given the last emitted window.
    #[must_use]
    pub fn due(
        &self,
        now: DateTime<Utc>,
        last_emitted: Option<&TimeWindow>,
        signal: &BacklogSignal,
        max_catch_up: usize,
    ) -> Vec<DueWindow> {
        let (cadence, mode) = self.select(signal, now);
        cadence
            .due_windows(now, last_emitted, self.missed, max_catch_up)
            .into_iter()
            .map(|window| DueWindow { window, mode })
            .collect()
    }

    /// Next instant a window will come due.
    #[must_use]
    pub fn next_due(&self, now: DateTime<Utc>, signal: &BacklogSignal) -> Option<DateTime<Utc>> {
        self.select(signal, now).0.next_after(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trendline_core::AgentName;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn window(from: (u32, u32), to: (u32, u32)) -> TimeWindow {
        TimeWindow::new(at(from.0, from.1), at(to.0, to.1)).unwrap()
    }

    #[test]
    fn parses_supported_forms() {
        assert!(Cadence::parse("0 * * * *").is_ok());
        assert!(Cadence::parse("0 0 * * * *").is_ok());
        assert!(Cadence::parse("@daily").is_ok());
        assert!(Cadence::parse("@every 15m").is_ok());
    }

    #[test]
    fn rejects_bad_expressions() {
        let err = Cadence::parse("* *").unwrap_err();
        assert!(err.to_string().contains("expected 5 to 7 fields"));
        assert!(Cadence::parse("61 * * * *").is_err());
        assert!(Cadence::parse("@every 0m").is_err());
        assert!(Cadence::parse("@every 5w").is_err());
        assert!(Cadence::parse("@every m").is_err());
    }

    #[test]
    fn rejects_intervals_out_of_range() {
        let err = Cadence::parse("@every 9999999999999d").unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(Cadence::parse("@every 99999999999999999999s").is_err());
    }

    #[test]
    fn very_long_intervals_have_no_window_before_the_epoch() {
        let every = Cadence::parse("@every 100000000d").unwrap();
        assert_eq!(every.latest_window(at(11, 0)), None);
        assert!(every.due_windows(at(11, 0), None, MissedWindows::Latest, 10).is_empty());
    }

    #[test]
    fn hourly_cron_latest_window() {
        let hourly = Cadence::parse("0 * * * *").unwrap();
        assert_eq!(hourly.latest_window(at(11, 10)), Some(window((10, 0), (11, 0))));
        assert_eq!(hourly.latest_window(at(11, 0)), Some(window((10, 0), (11, 0))));
        assert_eq!(hourly.next_after(at(11, 0)), Some(at(12, 0)));
    }

    #[test]
    fn daily_cron_needs_longer_lookback() {
        let daily = Cadence::parse("0 6 * * *").unwrap();
        let latest = daily.latest_window(at(11, 0)).unwrap();
        assert_eq!(latest.end(), at(6, 0));
        assert_eq!(latest.duration(), Duration::days(1));
    }

    #[test]
    fn every_interval_is_epoch_aligned() {
        let quarter = Cadence::parse("@every 15m").unwrap();
        assert_eq!(quarter.latest_window(at(11, 10)), Some(window((10, 45), (11, 0))));
        assert_eq!(quarter.next_after(at(11, 10)), Some(at(11, 15)));
        assert_eq!(quarter.next_after(at(11, 15)), Some(at(11, 30)));
    }

    #[test]
    fn windows_from_is_contiguous() {
        let hourly = Cadence::parse("@every 1h").unwrap();
        let windows: Vec<TimeWindow> = hourly.windows_from(at(9, 30)).take(3).collect();
        assert_eq!(
            windows,
            vec![
                window((9, 30), (10, 0)),
                window((10, 0), (11, 0)),
                window((11, 0), (12, 0)),
            ]
        );
    }

    #[test]
    fn due_emits_each_window_once() {
        let hourly = Cadence::parse("0 * * * *").unwrap();
        let first = hourly.due_windows(at(11, 10), None, MissedWindows::Latest, 10);
        assert_eq!(first, vec![window((10, 0), (11, 0))]);

        let again = hourly.due_windows(at(11, 40), Some(&first[0]), MissedWindows::Latest, 10);
        assert!(again.is_empty());

        let next = hourly.due_windows(at(12, 0), Some(&first[0]), MissedWindows::Latest, 10);
        assert_eq!(next, vec![window((11, 0), (12, 0))]);
    }

    #[test]
    fn missed_windows_latest_skips_the_gap() {
        let hourly = Cadence::parse("0 * * * *").unwrap();
        let last = window((7, 0), (8, 0));
        let due = hourly.due_windows(at(11, 5), Some(&last), MissedWindows::Latest, 10);
        assert_eq!(due, vec![window((10, 0), (11, 0))]);
    }

    #[test]
    fn missed_windows_catch_up_is_bounded() {
        let hourly = Cadence::parse("0 * * * *").unwrap();
        let last = window((7, 0), (8, 0));
        let due = hourly.due_windows(at(11, 5), Some(&last), MissedWindows::CatchUp, 2);
        assert_eq!(due, vec![window((8, 0), (9, 0)), window((9, 0), (10, 0))]);

        let rest = hourly.due_windows(at(11, 5), due.last(), MissedWindows::CatchUp, 2);
        assert_eq!(rest, vec![window((10, 0), (11, 0))]);
    }

    #[test]
    fn emergency_cadence_follows_backlog_and_requests() {
        let def = AgentDefinition::new(AgentName::new("ingestion").unwrap(), "0 * * * *")
            .with_emergency_cadence("@every 15m");
        let cadence = AgentCadence::from_definition(&def).unwrap();

        let calm = BacklogSignal {
            depth: 3,
            threshold: 10,
            emergency_until: None,
        };
        assert_eq!(cadence.select(&calm, at(11, 0)).1, CadenceMode::Normal);

        let backlogged = BacklogSignal { depth: 10, ..calm };
        assert_eq!(cadence.select(&backlogged, at(11, 0)).1, CadenceMode::Emergency);

        let requested = BacklogSignal {
            emergency_until: Some(at(12, 0)),
            ..calm
        };
        assert_eq!(cadence.select(&requested, at(11, 0)).1, CadenceMode::Emergency);
        assert_eq!(cadence.select(&requested, at(12, 0)).1, CadenceMode::Normal);
    }

    #[test]
    fn switching_to_emergency_continues_from_last_window() {
        let def = AgentDefinition::new(AgentName::new("ingestion").unwrap(), "0 * * * *")
            .with_emergency_cadence("@every 15m");
        let cadence = AgentCadence::from_definition(&def).unwrap();
        let signal = BacklogSignal {
            depth: 0,
            threshold: 0,
            emergency_until: Some(at(13, 0)),
        };
        let last = window((10, 0), (11, 0));
        let due = cadence.due(at(11, 20), Some(&last), &signal, 10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].window, window((11, 0), (11, 15)));
        assert_eq!(due[0].mode, CadenceMode::Emergency);
    }

    #[test]
    fn zero_threshold_disables_backlog_switch() {
        let signal = BacklogSignal {
            depth: 500,
            threshold: 0,
            emergency_until: None,
        };
        assert!(!signal.wants_emergency(at(11, 0)));
    }
}
