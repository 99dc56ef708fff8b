//! Scheduler configuration.
//!
//! Configuration is loaded via the `config` crate from a TOML file, with
//! `TRENDLINE__`-prefixed environment variables layered on top (`__`
//! separates nested keys, e.g. `TRENDLINE__SCHEDULER__MAX_RUNNING_TOTAL`).
//! Every knob has a default so a file only needs its agents and policies.

use crate::alert::AlertSettings;
use crate::drift::DriftSettings;
use crate::error::ConfigError;
use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use trendline_pipeline::{AgentDefinition, FailurePolicy, ResourceClass};

/// Name of the policy agents get when they do not name one.
pub const DEFAULT_POLICY: &str = "default";

/// The declarative pipeline: agents, policies and scheduler knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
    #[serde(default)]
    pub drift: DriftSettings,
    #[serde(default)]
    pub policies: HashMap<String, FailurePolicy>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl PipelineConfig {
    #[must_use]
    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, id: impl Into<String>, policy: FailurePolicy) -> Self {
        self.policies.insert(id.into(), policy);
        self
    }
}

/// Process-wide ceilings per resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClassLimits {
    #[serde(default = "default_light_limit")]
    pub light: usize,
    #[serde(default = "default_standard_limit")]
    pub standard: usize,
    #[serde(default = "default_heavy_limit")]
    pub heavy: usize,
}

fn default_light_limit() -> usize {
    16
}

fn default_standard_limit() -> usize {
    8
}

fn default_heavy_limit() -> usize {
    2
}

impl Default for ResourceClassLimits {
    fn default() -> Self {
        Self {
            light: default_light_limit(),
            standard: default_standard_limit(),
            heavy: default_heavy_limit(),
        }
    }
}

impl ResourceClassLimits {
    #[must_use]
    pub fn limit(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Light => self.light,
            ResourceClass::Standard => self.standard,
            ResourceClass::Heavy => self.heavy,
        }
    }
}

/// Knobs for admission, dispatch and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Upper bound on how long an agent loop sleeps between ticks.
    #[serde(default = "default_tick_interval_millis")]
    pub tick_interval_millis: u64,

    /// Executions allowed at once across all agents.
    #[serde(default = "default_max_running_total")]
    pub max_running_total: usize,

    /// Deadline for agents that do not set `timeout_seconds`.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Oldest upstream output a dependency accepts, measured from the
    /// candidate window's end.
    #[serde(default = "default_max_staleness_minutes")]
    pub max_staleness_minutes: u64,

    /// How long a candidate may wait on dependencies before it fails.
    #[serde(default = "default_max_dependency_wait_minutes")]
    pub max_dependency_wait_minutes: u64,

    /// Queued Normal candidates older than this are promoted to Expedited.
    #[serde(default = "default_queue_max_wait_minutes")]
    pub queue_max_wait_minutes: u64,

    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u64,

    #[serde(default = "default_archive_interval_seconds")]
    pub archive_interval_seconds: u64,

    /// ResourceExhausted deferrals allowed per run before it counts as a
    /// failure.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,

    /// Missed windows emitted per tick for `catch_up` agents.
    #[serde(default = "default_max_catch_up_windows")]
    pub max_catch_up_windows: usize,

    #[serde(default = "default_unhealthy_success_rate")]
    pub unhealthy_success_rate: f64,

    #[serde(default = "default_unhealthy_min_executions")]
    pub unhealthy_min_executions: u64,

    #[serde(default)]
    pub resource_classes: ResourceClassLimits,
}

fn default_tick_interval_millis() -> u64 {
    1_000
}

fn default_max_running_total() -> usize {
    32
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_max_staleness_minutes() -> u64 {
    30
}

fn default_max_dependency_wait_minutes() -> u64 {
    120
}

fn default_queue_max_wait_minutes() -> u64 {
    30
}

fn default_history_retention_days() -> u64 {
    30
}

fn default_archive_interval_seconds() -> u64 {
    3_600
}

fn default_max_deferrals() -> u32 {
    10
}

fn default_max_catch_up_windows() -> usize {
    24
}

fn default_unhealthy_success_rate() -> f64 {
    0.5
}

fn default_unhealthy_min_executions() -> u64 {
    5
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_millis: default_tick_interval_millis(),
            max_running_total: default_max_running_total(),
            default_timeout_seconds: default_timeout_seconds(),
            max_staleness_minutes: default_max_staleness_minutes(),
            max_dependency_wait_minutes: default_max_dependency_wait_minutes(),
            queue_max_wait_minutes: default_queue_max_wait_minutes(),
            history_retention_days: default_history_retention_days(),
            archive_interval_seconds: default_archive_interval_seconds(),
            max_deferrals: default_max_deferrals(),
            max_catch_up_windows: default_max_catch_up_windows(),
            unhealthy_success_rate: default_unhealthy_success_rate(),
            unhealthy_min_executions: default_unhealthy_min_executions(),
            resource_classes: ResourceClassLimits::default(),
        }
    }
}

impl SchedulerSettings {
    #[must_use]
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_millis)
    }

    #[must_use]
    pub fn max_dependency_wait(&self) -> Duration {
        minutes(self.max_dependency_wait_minutes)
    }

    #[must_use]
    pub fn queue_max_wait(&self) -> Duration {
        minutes(self.queue_max_wait_minutes)
    }

    #[must_use]
    pub fn history_retention(&self) -> Duration {
        Duration::days(self.history_retention_days.min(36_500) as i64)
    }

    /// # Errors
    ///
    /// Returns an error for settings that would stall or misconfigure the
    /// scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |setting: &str, reason: &str| ConfigError::InvalidSetting {
            setting: setting.to_string(),
            reason: reason.to_string(),
        };
        if self.tick_interval_millis == 0 {
            return Err(invalid("scheduler.tick_interval_millis", "must be at least 1"));
        }
        if self.max_running_total == 0 {
            return Err(invalid("scheduler.max_running_total", "must be at least 1"));
        }
        if self.default_timeout_seconds == 0 {
            return Err(invalid("scheduler.default_timeout_seconds", "must be at least 1"));
        }
        if self.archive_interval_seconds == 0 {
            return Err(invalid("scheduler.archive_interval_seconds", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.unhealthy_success_rate) {
            return Err(invalid(
                "scheduler.unhealthy_success_rate",
                "must be between 0 and 1",
            ));
        }
        let classes = &self.resource_classes;
        if classes.light == 0 || classes.standard == 0 || classes.heavy == 0 {
            return Err(invalid(
                "scheduler.resource_classes",
                "every class needs at least one slot",
            ));
        }
        Ok(())
    }
}

/// Converts a configured minute count into a duration, capped at a century.
pub(crate) fn minutes(value: u64) -> Duration {
    Duration::minutes(value.min(52_560_000) as i64)
}

/// Loads configuration of type `T` from `path` plus environment overrides.
///
/// # Errors
///
/// Returns [`ConfigError::Load`] if the file cannot be read or the merged
/// sources do not deserialize into `T`.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> trendline_core::Result<T, ConfigError> {
    let sources = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix("TRENDLINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigError::Load {
            reason: e.to_string(),
        })?;
    let loaded = sources.try_deserialize().map_err(|e| ConfigError::Load {
        reason: e.to_string(),
    })?;
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn settings_have_expected_defaults() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.max_staleness_minutes, 30);
        assert_eq!(settings.default_timeout_seconds, 300);
        assert_eq!(settings.resource_classes.limit(ResourceClass::Heavy), 2);
        assert_eq!(settings.queue_max_wait(), Duration::minutes(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_global_ceiling() {
        let settings = SchedulerSettings {
            max_running_total: 0,
            ..SchedulerSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("max_running_total"));
    }

    #[test]
    fn loads_pipeline_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            r#"
[scheduler]
max_running_total = 4

[policies.standard]
retry = {{ max_attempts = 3, initial_backoff_seconds = 10 }}
on_exhausted = "escalate"

[[agents]]
name = "ingestion"
cadence = "@every 15m"
max_concurrency = 5

[[agents]]
name = "analyzer"
cadence = "0 * * * *"
depends_on = ["ingestion"]
failure_policy = "standard"
"#
        )
        .expect("write config");

        let config: PipelineConfig = load_config(file.path()).expect("config loads");
        assert_eq!(config.scheduler.max_running_total, 4);
        assert_eq!(config.scheduler.tick_interval_millis, 1_000);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].depends_on[0].as_str(), "ingestion");

        let standard = &config.policies["standard"];
        assert_eq!(standard.max_attempts(), 3);
        assert_eq!(
            standard.on_exhausted,
            trendline_pipeline::TerminalAction::Escalate
        );
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let result: trendline_core::Result<PipelineConfig, ConfigError> =
            load_config(Path::new("/nonexistent/trendline.toml"));
        let report = result.unwrap_err();
        assert!(report.to_string().contains("failed to load configuration"));
    }
}
