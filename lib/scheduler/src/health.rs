//! Per-agent execution health.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Weight of the newest sample in the execution-time average.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub execution_count: u64,
    pub error_count: u64,
    /// Exponential moving average of attempt durations.
    pub average_execution_seconds: f64,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentHealth {
    pub fn record_success(&mut self, elapsed: Duration, at: DateTime<Utc>) {
        self.record(elapsed, at);
    }

    pub fn record_failure(&mut self, elapsed: Duration, at: DateTime<Utc>, error: String) {
        self.record(elapsed, at);
        self.error_count += 1;
        self.last_error = Some(error);
    }

    fn record(&mut self, elapsed: Duration, at: DateTime<Utc>) {
        let seconds = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
        self.average_execution_seconds = if self.execution_count == 0 {
            seconds
        } else {
            EMA_ALPHA * seconds + (1.0 - EMA_ALPHA) * self.average_execution_seconds
        };
        self.execution_count += 1;
        self.last_execution = Some(at);
    }

    /// Fraction of executions that did not fail; 1.0 before the first one.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 1.0;
        }
        (self.execution_count - self.error_count) as f64 / self.execution_count as f64
    }

    #[must_use]
    pub fn is_unhealthy(&self, min_executions: u64, min_success_rate: f64) -> bool {
        self.execution_count >= min_executions && self.success_rate() < min_success_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap()
    }

    #[test]
    fn fresh_agent_is_healthy() {
        let health = AgentHealth::default();
        assert!((health.success_rate() - 1.0).abs() < f64::EPSILON);
        assert!(!health.is_unhealthy(0, 0.5));
    }

    #[test]
    fn average_starts_at_first_sample() {
        let mut health = AgentHealth::default();
        health.record_success(Duration::seconds(10), at());
        assert!((health.average_execution_seconds - 10.0).abs() < 1e-9);

        health.record_success(Duration::seconds(20), at());
        assert!((health.average_execution_seconds - 11.0).abs() < 1e-9);
    }

    #[test]
    fn unhealthy_needs_enough_executions() {
        let mut health = AgentHealth::default();
        for _ in 0..4 {
            health.record_failure(Duration::seconds(1), at(), "boom".to_string());
        }
        assert!(!health.is_unhealthy(5, 0.5));

        health.record_success(Duration::seconds(1), at());
        assert_eq!(health.execution_count, 5);
        assert!((health.success_rate() - 0.2).abs() < 1e-9);
        assert!(health.is_unhealthy(5, 0.5));
        assert_eq!(health.last_error.as_deref(), Some("boom"));
    }
}
