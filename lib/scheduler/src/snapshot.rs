//! Validated configuration snapshots.
//!
//! A [`ConfigSnapshot`] is what the scheduler actually runs on: every
//! definition checked, every cadence parsed, every policy resolved and the
//! dependency graph proven acyclic. Building one is the only place a
//! configuration can be rejected; after that nothing is a runtime surprise.

use crate::alert::AlertSettings;
use crate::cadence::AgentCadence;
use crate::config::{DEFAULT_POLICY, PipelineConfig, SchedulerSettings, minutes};
use crate::drift::DriftSettings;
use crate::error::ConfigError;
use chrono::Duration;
use std::collections::{BTreeMap, HashMap};
use trendline_core::AgentName;
use trendline_pipeline::{AgentDefinition, DependencyGraph, FailurePolicy};

/// One agent, resolved.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub definition: AgentDefinition,
    pub cadence: AgentCadence,
    pub policy: FailurePolicy,
}

impl AgentEntry {
    #[must_use]
    pub fn name(&self) -> &AgentName {
        &self.definition.name
    }
}

/// An immutable, validated pipeline configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    agents: BTreeMap<AgentName, AgentEntry>,
    graph: DependencyGraph,
    settings: SchedulerSettings,
    alerts: AlertSettings,
    drift: DriftSettings,
}

impl ConfigSnapshot {
    /// Validates `config` and resolves it into a snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for invalid settings, definitions, policies
    /// or cadences, unknown policy references, and dependency graphs that
    /// have unknown edges or cycles.
    pub fn build(config: PipelineConfig) -> Result<Self, ConfigError> {
        let PipelineConfig {
            scheduler,
            alerts,
            drift,
            mut policies,
            agents: definitions,
        } = config;

        scheduler.validate()?;
        alerts.validate()?;
        drift.validate()?;

        policies
            .entry(DEFAULT_POLICY.to_string())
            .or_insert_with(FailurePolicy::default);
        for (id, policy) in &policies {
            policy.validate(id)?;
        }

        let policy_for = |def: &AgentDefinition| -> Result<FailurePolicy, ConfigError> {
            policies
                .get(&def.failure_policy)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownPolicy {
                    agent: def.name.clone(),
                    policy: def.failure_policy.clone(),
                })
        };

        let mut resolved: HashMap<AgentName, FailurePolicy> = HashMap::new();
        for def in &definitions {
            def.validate()?;
            resolved.insert(def.name.clone(), policy_for(def)?);
        }

        let graph = DependencyGraph::build(&definitions, |def| {
            resolved
                .get(&def.name)
                .map(FailurePolicy::required_states)
                .unwrap_or_else(|| FailurePolicy::default().required_states())
        })?;

        let mut agents = BTreeMap::new();
        for definition in definitions {
            let cadence = AgentCadence::from_definition(&definition).map_err(|source| {
                ConfigError::InvalidCadence {
                    agent: definition.name.clone(),
                    source,
                }
            })?;
            let policy = policy_for(&definition)?;
            agents.insert(
                definition.name.clone(),
                AgentEntry {
                    definition,
                    cadence,
                    policy,
                },
            );
        }

        Ok(Self {
            agents,
            graph,
            settings: scheduler,
            alerts,
            drift,
        })
    }

    #[must_use]
    pub fn agent(&self, name: &AgentName) -> Option<&AgentEntry> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentEntry> {
        self.agents.values()
    }

    #[must_use]
    pub fn agent_names(&self) -> Vec<AgentName> {
        self.agents.keys().cloned().collect()
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    #[must_use]
    pub fn alerts(&self) -> &AlertSettings {
        &self.alerts
    }

    #[must_use]
    pub fn drift(&self) -> &DriftSettings {
        &self.drift
    }

    /// Oldest acceptable upstream output for `entry`'s dependencies.
    #[must_use]
    pub fn max_staleness(&self, entry: &AgentEntry) -> Duration {
        minutes(
            entry
                .definition
                .max_staleness_minutes
                .unwrap_or(self.settings.max_staleness_minutes),
        )
    }

    /// Execution deadline for `entry`.
    #[must_use]
    pub fn timeout(&self, entry: &AgentEntry) -> std::time::Duration {
        std::time::Duration::from_secs(
            entry
                .definition
                .timeout_seconds
                .unwrap_or(self.settings.default_timeout_seconds),
        )
    }

    /// Failure policy for `agent`, falling back to the default policy for
    /// agents removed by a reload.
    #[must_use]
    pub fn policy(&self, agent: &AgentName) -> FailurePolicy {
        self.agent(agent)
            .map(|entry| entry.policy.clone())
            .unwrap_or_default()
    }
}
