//! Error types for the pipeline crate.
//!
//! All of these surface at configuration load or at a collaborator
//! boundary. Callers wrap them in a rootcause report when they cross into
//! startup code.

use trendline_core::AgentName;
use std::fmt;

/// Errors from building the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two definitions share a name.
    DuplicateAgent { agent: AgentName },
    /// An agent depends on a name that is not defined.
    UnknownDependency {
        agent: AgentName,
        upstream: AgentName,
    },
    /// An agent lists itself as a dependency.
    SelfDependency { agent: AgentName },
    /// The dependency graph contains a cycle through these agents.
    CycleDetected { agents: Vec<AgentName> },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateAgent { agent } => write!(f, "agent '{agent}' is defined twice"),
            Self::UnknownDependency { agent, upstream } => {
                write!(f, "agent '{agent}' depends on unknown agent '{upstream}'")
            }
            Self::SelfDependency { agent } => write!(f, "agent '{agent}' depends on itself"),
            Self::CycleDetected { agents } => {
                let names: Vec<&str> = agents.iter().map(AgentName::as_str).collect();
                write!(f, "dependency cycle detected between: {}", names.join(", "))
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from validating agent definitions and failure policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// An agent definition carries an invalid value.
    InvalidAgent { agent: AgentName, reason: String },
    /// A failure policy carries an invalid value.
    InvalidPolicy { policy: String, reason: String },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAgent { agent, reason } => {
                write!(f, "invalid definition for agent '{agent}': {reason}")
            }
            Self::InvalidPolicy { policy, reason } => {
                write!(f, "invalid failure policy '{policy}': {reason}")
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Errors reported by a feature store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureStoreError {
    /// The store could not be reached.
    Unavailable { reason: String },
    /// The stored payload could not be decoded.
    Corrupt { entity_id: String, reason: String },
}

impl fmt::Display for FeatureStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "feature store unavailable: {reason}"),
            Self::Corrupt { entity_id, reason } => {
                write!(f, "corrupt feature record for '{entity_id}': {reason}")
            }
        }
    }
}

impl std::error::Error for FeatureStoreError {}
