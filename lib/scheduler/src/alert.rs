//! Alert router.
//!
//! Terminal failures, escalations, SLA violations, drift escalations and
//! unhealthy agents become [`AlertEvent`]s. The router suppresses repeats
//! of the same severity, agent and window within a cooldown, picks the
//! channels configured for the event's severity, and hands the event to
//! each channel's [`AlertSink`] with a small bounded retry. An event a
//! channel never accepts is dropped with an audit record.

use crate::audit::{AuditKind, AuditLog, AuditRecord};
use crate::error::{ConfigError, DeliveryError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use trendline_core::{AgentName, AlertId, TaskRunId, TimeWindow};

/// Channel name of the built-in [`LogAlertSink`].
pub const LOG_CHANNEL: &str = "log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TerminalFailure,
    Escalation,
    SlaViolation,
    DriftEscalation,
    AgentUnhealthy,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TerminalFailure => "terminal_failure",
            Self::Escalation => "escalation",
            Self::SlaViolation => "sla_violation",
            Self::DriftEscalation => "drift_escalation",
            Self::AgentUnhealthy => "agent_unhealthy",
        })
    }
}

/// The task an alert is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSource {
    pub agent: AgentName,
    pub window: Option<TimeWindow>,
    pub run_id: Option<TaskRunId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: AlertId,
    pub severity: Severity,
    pub kind: AlertKind,
    pub source: AlertSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Set by the router when a recent identical alert already went out.
    pub suppressed: bool,
}

impl AlertEvent {
    #[must_use]
    pub fn new(
        severity: Severity,
        kind: AlertKind,
        agent: AgentName,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            severity,
            kind,
            source: AlertSource {
                agent,
                window: None,
                run_id: None,
            },
            message: message.into(),
            timestamp,
            suppressed: false,
        }
    }

    #[must_use]
    pub fn for_run(mut self, run_id: TaskRunId, window: TimeWindow) -> Self {
        self.source.run_id = Some(run_id);
        self.source.window = Some(window);
        self
    }
}

/// Channels per severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRoutes {
    #[serde(default = "default_channels")]
    pub info: Vec<String>,
    #[serde(default = "default_channels")]
    pub warning: Vec<String>,
    #[serde(default = "default_channels")]
    pub critical: Vec<String>,
}

fn default_channels() -> Vec<String> {
    vec![LOG_CHANNEL.to_string()]
}

impl Default for AlertRoutes {
    fn default() -> Self {
        Self {
            info: default_channels(),
            warning: default_channels(),
            critical: default_channels(),
        }
    }
}

impl AlertRoutes {
    /// Sends every severity to the same channels.
    #[must_use]
    pub fn all(channels: &[&str]) -> Self {
        let channels: Vec<String> = channels.iter().map(ToString::to_string).collect();
        Self {
            info: channels.clone(),
            warning: channels.clone(),
            critical: channels,
        }
    }

    #[must_use]
    pub fn channels(&self, severity: Severity) -> &[String] {
        match severity {
            Severity::Info => &self.info,
            Severity::Warning => &self.warning,
            Severity::Critical => &self.critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Identical alerts within this many seconds are suppressed.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Delay before delivery attempt `n + 1` is `n` times this.
    #[serde(default = "default_retry_backoff_millis")]
    pub retry_backoff_millis: u64,
    #[serde(default)]
    pub routes: AlertRoutes,
}

fn default_cooldown_seconds() -> u64 {
    900
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_retry_backoff_millis() -> u64 {
    200
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_backoff_millis: default_retry_backoff_millis(),
            routes: AlertRoutes::default(),
        }
    }
}

impl AlertSettings {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_seconds.min(i64::MAX as u64 / 1000) as i64)
    }

    /// # Errors
    ///
    /// Rejects zero delivery attempts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "alerts.max_delivery_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Push interface to a notification channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError>;
}

/// Sink that writes alerts to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        match event.severity {
            Severity::Info => info!(
                target: "trendline::alert",
                alert_id = %event.id,
                kind = %event.kind,
                agent = %event.source.agent,
                "{}",
                event.message
            ),
            Severity::Warning => warn!(
                target: "trendline::alert",
                alert_id = %event.id,
                kind = %event.kind,
                agent = %event.source.agent,
                "{}",
                event.message
            ),
            Severity::Critical => error!(
                target: "trendline::alert",
                alert_id = %event.id,
                kind = %event.kind,
                agent = %event.source.agent,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// What happened to one routed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub event: AlertEvent,
    /// Channels that accepted the event.
    pub delivered: Vec<String>,
    /// Channels that never accepted it.
    pub dropped: Vec<String>,
}

type DedupKey = (Severity, AgentName, Option<TimeWindow>);

pub struct AlertRouter {
    sinks: HashMap<String, Arc<dyn AlertSink>>,
    last_sent: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
    audit: AuditLog,
}

impl fmt::Debug for AlertRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<&String> = self.sinks.keys().collect();
        channels.sort();
        f.debug_struct("AlertRouter")
            .field("channels", &channels)
            .finish_non_exhaustive()
    }
}

impl AlertRouter {
    /// Creates a router with the [`LogAlertSink`] registered as `log`.
    #[must_use]
    pub fn new(audit: AuditLog) -> Self {
        let mut sinks: HashMap<String, Arc<dyn AlertSink>> = HashMap::new();
        sinks.insert(LOG_CHANNEL.to_string(), Arc::new(LogAlertSink));
        Self {
            sinks,
            last_sent: Mutex::new(HashMap::new()),
            audit,
        }
    }

    pub fn register(&mut self, channel: impl Into<String>, sink: Arc<dyn AlertSink>) {
        self.sinks.insert(channel.into(), sink);
    }

    /// Deduplicates and delivers `event` according to `settings`.
    pub async fn route(&self, mut event: AlertEvent, settings: &AlertSettings) -> RouteOutcome {
        event.suppressed = self.is_repeat(&event, settings.cooldown());
        let mut outcome = RouteOutcome {
            event,
            delivered: Vec::new(),
            dropped: Vec::new(),
        };
        if outcome.event.suppressed {
            debug!(
                agent = %outcome.event.source.agent,
                severity = %outcome.event.severity,
                "alert suppressed by cooldown"
            );
            return outcome;
        }

        for channel in settings.routes.channels(outcome.event.severity) {
            let delivered = match self.sinks.get(channel) {
                Some(sink) => self.deliver(sink.as_ref(), channel, &outcome.event, settings).await,
                None => {
                    warn!(channel = %channel, "no alert sink registered for channel");
                    false
                }
            };
            if delivered {
                outcome.delivered.push(channel.clone());
            } else {
                self.audit.record(AuditRecord {
                    at: outcome.event.timestamp,
                    agent: outcome.event.source.agent.clone(),
                    window: outcome.event.source.window,
                    run_id: outcome.event.source.run_id,
                    kind: AuditKind::AlertDropped,
                    detail: format!(
                        "{} alert {} not delivered to '{channel}'",
                        outcome.event.severity, outcome.event.id
                    ),
                });
                outcome.dropped.push(channel.clone());
            }
        }
        outcome
    }

    fn is_repeat(&self, event: &AlertEvent, cooldown: Duration) -> bool {
        let key = (
            event.severity,
            event.source.agent.clone(),
            event.source.window,
        );
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = last_sent.get(&key)
            && event.timestamp - *last < cooldown
        {
            return true;
        }
        last_sent.insert(key, event.timestamp);
        false
    }

    async fn deliver(
        &self,
        sink: &dyn AlertSink,
        channel: &str,
        event: &AlertEvent,
        settings: &AlertSettings,
    ) -> bool {
        for attempt in 1..=settings.max_delivery_attempts {
            match sink.deliver(event).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(channel, attempt, error = %e, "alert delivery attempt failed");
                    if attempt < settings.max_delivery_attempts {
                        let delay = settings.retry_backoff_millis.saturating_mul(u64::from(attempt));
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FlakySink {
        failures_left: AtomicU32,
        delivered: Mutex<Vec<AlertEvent>>,
    }

    #[async_trait]
    impl AlertSink for FlakySink {
        async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryError::new("channel unavailable"));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 11, minute, 0).unwrap()
    }

    fn event(severity: Severity, minute: u32) -> AlertEvent {
        AlertEvent::new(
            severity,
            AlertKind::TerminalFailure,
            AgentName::new("predictor").unwrap(),
            "run abandoned",
            at(minute),
        )
    }

    fn settings() -> AlertSettings {
        AlertSettings {
            retry_backoff_millis: 1,
            routes: AlertRoutes::all(&["pager"]),
            ..AlertSettings::default()
        }
    }

    fn router(sink: Arc<FlakySink>) -> (AlertRouter, AuditLog) {
        let audit = AuditLog::new(Arc::new(MemoryJournal::new()));
        let mut router = AlertRouter::new(audit.clone());
        router.register("pager", sink);
        (router, audit)
    }

    #[tokio::test]
    async fn repeats_within_cooldown_are_suppressed() {
        let sink = Arc::new(FlakySink::default());
        let (router, _) = router(Arc::clone(&sink));

        let first = router.route(event(Severity::Warning, 0), &settings()).await;
        let repeat = router.route(event(Severity::Warning, 5), &settings()).await;
        let other_severity = router.route(event(Severity::Critical, 5), &settings()).await;
        let after_cooldown = router.route(event(Severity::Warning, 16), &settings()).await;

        assert!(!first.event.suppressed);
        assert!(repeat.event.suppressed);
        assert!(repeat.delivered.is_empty());
        assert!(!other_severity.event.suppressed);
        assert!(!after_cooldown.event.suppressed);
        assert_eq!(sink.delivered.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn transient_delivery_failures_are_retried() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(2),
            ..FlakySink::default()
        });
        let (router, audit) = router(Arc::clone(&sink));

        let outcome = router.route(event(Severity::Critical, 0), &settings()).await;
        assert_eq!(outcome.delivered, vec!["pager".to_string()]);
        assert!(audit.records().is_empty());
    }

    #[tokio::test]
    async fn undeliverable_alerts_are_dropped_with_audit() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(10),
            ..FlakySink::default()
        });
        let (router, audit) = router(Arc::clone(&sink));

        let outcome = router.route(event(Severity::Critical, 0), &settings()).await;
        assert_eq!(outcome.dropped, vec!["pager".to_string()]);
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 7);

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AuditKind::AlertDropped);
    }

    #[tokio::test]
    async fn unknown_channels_count_as_dropped() {
        let audit = AuditLog::new(Arc::new(MemoryJournal::new()));
        let router = AlertRouter::new(audit.clone());
        let settings = AlertSettings {
            routes: AlertRoutes::all(&["log", "slack"]),
            ..AlertSettings::default()
        };

        let outcome = router.route(event(Severity::Info, 0), &settings).await;
        assert_eq!(outcome.delivered, vec!["log".to_string()]);
        assert_eq!(outcome.dropped, vec!["slack".to_string()]);
        assert_eq!(audit.records().len(), 1);
    }

    #[test]
    fn zero_delivery_attempts_is_invalid() {
        let settings = AlertSettings {
            max_delivery_attempts: 0,
            ..AlertSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
