//! Drift and backlog escalation.
//!
//! The monitor turns evaluation signals into [`PriorityHint`]s and
//! publishes them on a channel. It never touches runs: the orchestrator
//! applies hints to per-agent boost counters and cadence overrides, and
//! admission does the rest.

use crate::error::ConfigError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use trendline_core::AgentName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSettings {
    #[serde(default = "default_accuracy_drift_threshold")]
    pub accuracy_drift_threshold: f64,
    #[serde(default = "default_calibration_error_threshold")]
    pub calibration_error_threshold: f64,
    #[serde(default = "default_distribution_shift_threshold")]
    pub distribution_shift_threshold: f64,
    /// Backlog depth that switches an agent to its emergency cadence and
    /// triggers a hint. Zero disables backlog escalation.
    #[serde(default = "default_backlog_threshold")]
    pub backlog_threshold: usize,
    /// Windows boosted to Emergency per hint.
    #[serde(default = "default_boost_windows")]
    pub boost_windows: u32,
    /// Agents a single drift signal may boost.
    #[serde(default = "default_max_boosted_agents")]
    pub max_boosted_agents: usize,
    #[serde(default = "default_emergency_cadence_minutes")]
    pub emergency_cadence_minutes: u64,
    /// Drift hints also request the emergency cadence.
    #[serde(default)]
    pub switch_cadence_on_drift: bool,
}

fn default_accuracy_drift_threshold() -> f64 {
    0.10
}

fn default_calibration_error_threshold() -> f64 {
    0.05
}

fn default_distribution_shift_threshold() -> f64 {
    0.20
}

fn default_backlog_threshold() -> usize {
    25
}

fn default_boost_windows() -> u32 {
    2
}

fn default_max_boosted_agents() -> usize {
    4
}

fn default_emergency_cadence_minutes() -> u64 {
    120
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            accuracy_drift_threshold: default_accuracy_drift_threshold(),
            calibration_error_threshold: default_calibration_error_threshold(),
            distribution_shift_threshold: default_distribution_shift_threshold(),
            backlog_threshold: default_backlog_threshold(),
            boost_windows: default_boost_windows(),
            max_boosted_agents: default_max_boosted_agents(),
            emergency_cadence_minutes: default_emergency_cadence_minutes(),
            switch_cadence_on_drift: false,
        }
    }
}

impl DriftSettings {
    #[must_use]
    pub fn threshold(&self, metric: DriftMetric) -> f64 {
        match metric {
            DriftMetric::Accuracy => self.accuracy_drift_threshold,
            DriftMetric::Calibration => self.calibration_error_threshold,
            DriftMetric::Distribution => self.distribution_shift_threshold,
        }
    }

    #[must_use]
    pub fn emergency_cadence_duration(&self) -> Duration {
        crate::config::minutes(self.emergency_cadence_minutes)
    }

    /// # Errors
    ///
    /// Rejects thresholds that are negative or not finite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (setting, value) in [
            ("drift.accuracy_drift_threshold", self.accuracy_drift_threshold),
            ("drift.calibration_error_threshold", self.calibration_error_threshold),
            ("drift.distribution_shift_threshold", self.distribution_shift_threshold),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidSetting {
                    setting: setting.to_string(),
                    reason: "must be a finite, non-negative number".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftMetric {
    Accuracy,
    Calibration,
    Distribution,
}

impl fmt::Display for DriftMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accuracy => "accuracy drift",
            Self::Calibration => "calibration error",
            Self::Distribution => "distribution shift",
        })
    }
}

/// Input from the evaluation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum EvaluationSignal {
    Drift {
        metric: DriftMetric,
        value: f64,
        affected_agents: Vec<AgentName>,
        observed_at: DateTime<Utc>,
    },
    Backlog {
        agent: AgentName,
        depth: usize,
        observed_at: DateTime<Utc>,
    },
}

/// Request to prioritize an agent's upcoming windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityHint {
    pub agent: AgentName,
    /// Upcoming cadence windows to admit as Emergency.
    pub emergency_windows: u32,
    /// Use the emergency cadence until this instant.
    pub emergency_cadence_until: Option<DateTime<Utc>>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct DriftMonitor {
    settings: DriftSettings,
    hints: mpsc::Sender<PriorityHint>,
}

impl DriftMonitor {
    #[must_use]
    pub fn new(settings: DriftSettings, hints: mpsc::Sender<PriorityHint>) -> Self {
        Self { settings, hints }
    }

    /// Hints warranted by `signal`, if it breaches a threshold.
    #[must_use]
    pub fn evaluate(&self, signal: &EvaluationSignal) -> Vec<PriorityHint> {
        let settings = &self.settings;
        let until = |observed_at: DateTime<Utc>| observed_at + settings.emergency_cadence_duration();
        match signal {
            EvaluationSignal::Drift {
                metric,
                value,
                affected_agents,
                observed_at,
            } => {
                let threshold = settings.threshold(*metric);
                if value.is_nan() || *value < threshold {
                    return Vec::new();
                }
                if affected_agents.len() > settings.max_boosted_agents {
                    warn!(
                        metric = %metric,
                        affected = affected_agents.len(),
                        limit = settings.max_boosted_agents,
                        "drift affects more agents than may be boosted"
                    );
                }
                let reason = format!("{metric} {value:.3} reached threshold {threshold:.3}");
                let mut seen: Vec<&AgentName> = Vec::new();
                affected_agents
                    .iter()
                    .filter(|agent| {
                        if seen.contains(agent) {
                            return false;
                        }
                        seen.push(*agent);
                        true
                    })
                    .take(settings.max_boosted_agents)
                    .map(|agent| PriorityHint {
                        agent: agent.clone(),
                        emergency_windows: settings.boost_windows,
                        emergency_cadence_until: settings
                            .switch_cadence_on_drift
                            .then(|| until(*observed_at)),
                        reason: reason.clone(),
                    })
                    .collect()
            }
            EvaluationSignal::Backlog {
                agent,
                depth,
                observed_at,
            } => {
                if settings.backlog_threshold == 0 || *depth < settings.backlog_threshold {
                    return Vec::new();
                }
                vec![PriorityHint {
                    agent: agent.clone(),
                    emergency_windows: settings.boost_windows,
                    emergency_cadence_until: Some(until(*observed_at)),
                    reason: format!(
                        "backlog depth {depth} reached threshold {}",
                        settings.backlog_threshold
                    ),
                }]
            }
        }
    }

    /// Evaluates `signal` and publishes the resulting hints. Returns how
    /// many were published.
    pub async fn observe(&self, signal: &EvaluationSignal) -> usize {
        let mut published = 0;
        for hint in self.evaluate(signal) {
            info!(agent = %hint.agent, reason = %hint.reason, "publishing priority hint");
            if self.hints.send(hint).await.is_err() {
                warn!("priority hint receiver dropped");
                break;
            }
            published += 1;
        }
        published
    }

    /// Consumes signals until the channel closes or `shutdown` flips.
    pub async fn run(
        self,
        mut signals: mpsc::Receiver<EvaluationSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => {
                        self.observe(&signal).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("drift monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn name(s: &str) -> AgentName {
        AgentName::new(s).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn monitor(settings: DriftSettings) -> (DriftMonitor, mpsc::Receiver<PriorityHint>) {
        let (tx, rx) = mpsc::channel(16);
        (DriftMonitor::new(settings, tx), rx)
    }

    fn drift(metric: DriftMetric, value: f64, agents: &[&str]) -> EvaluationSignal {
        EvaluationSignal::Drift {
            metric,
            value,
            affected_agents: agents.iter().map(|a| name(a)).collect(),
            observed_at: at(14, 3),
        }
    }

    #[test]
    fn below_threshold_is_ignored() {
        let (monitor, _rx) = monitor(DriftSettings::default());
        assert!(monitor.evaluate(&drift(DriftMetric::Accuracy, 0.09, &["predictor"])).is_empty());
        assert!(monitor.evaluate(&drift(DriftMetric::Accuracy, f64::NAN, &["predictor"])).is_empty());
    }

    #[test]
    fn breach_boosts_bounded_set_of_agents() {
        let settings = DriftSettings {
            max_boosted_agents: 2,
            ..DriftSettings::default()
        };
        let (monitor, _rx) = monitor(settings);
        let hints = monitor.evaluate(&drift(
            DriftMetric::Calibration,
            0.07,
            &["predictor", "predictor", "evaluator", "improvement"],
        ));
        let agents: Vec<&str> = hints.iter().map(|h| h.agent.as_str()).collect();
        assert_eq!(agents, vec!["predictor", "evaluator"]);
        assert!(hints.iter().all(|h| h.emergency_windows == 2));
        assert!(hints.iter().all(|h| h.emergency_cadence_until.is_none()));
    }

    #[test]
    fn cadence_switch_is_optional_for_drift() {
        let settings = DriftSettings {
            switch_cadence_on_drift: true,
            ..DriftSettings::default()
        };
        let (monitor, _rx) = monitor(settings);
        let hints = monitor.evaluate(&drift(DriftMetric::Distribution, 0.2, &["predictor"]));
        assert_eq!(hints[0].emergency_cadence_until, Some(at(16, 3)));
    }

    #[test]
    fn backlog_breach_requests_emergency_cadence() {
        let (monitor, _rx) = monitor(DriftSettings::default());
        let signal = |depth| EvaluationSignal::Backlog {
            agent: name("ingestion"),
            depth,
            observed_at: at(9, 0),
        };
        assert!(monitor.evaluate(&signal(24)).is_empty());
        let hints = monitor.evaluate(&signal(25));
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].emergency_cadence_until, Some(at(11, 0)));

        let disabled = DriftSettings {
            backlog_threshold: 0,
            ..DriftSettings::default()
        };
        let (monitor, _rx) = self::monitor(disabled);
        assert!(monitor.evaluate(&signal(1_000)).is_empty());
    }

    #[tokio::test]
    async fn run_publishes_hints_until_shutdown() {
        let (monitor, mut hints) = monitor(DriftSettings::default());
        let (signals_tx, signals_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(signals_rx, stop_rx));

        signals_tx
            .send(drift(DriftMetric::Accuracy, 0.15, &["predictor"]))
            .await
            .unwrap();
        let hint = hints.recv().await.unwrap();
        assert_eq!(hint.agent, name("predictor"));
        assert!(hint.reason.starts_with("accuracy drift 0.150"));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn negative_threshold_is_invalid() {
        let settings = DriftSettings {
            calibration_error_threshold: -0.1,
            ..DriftSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
