//! Pipeline description for the trendline orchestrator.
//!
//! This crate holds everything that is fixed at configuration load:
//! - [`AgentDefinition`]: one agent type, its cadence and limits
//! - [`FailurePolicy`]: what happens when a run fails or times out
//! - [`DependencyGraph`]: the acyclic graph of data dependencies
//!
//! It also defines the two collaborator contracts the scheduler talks to:
//! the [`AgentExecutor`] every agent implements and the [`FeatureStore`]
//! that holds agent outputs.

pub mod definition;
pub mod error;
pub mod executor;
pub mod feature_store;
pub mod graph;
pub mod policy;

pub use definition::{AgentDefinition, MissedWindows, ResourceClass};
pub use error::{DefinitionError, FeatureStoreError, GraphError};
pub use executor::{
    AgentExecutor, AgentOutcome, ErrorKind, ExecutionRequest, ExecutorRegistry, OutputRef,
    UpstreamInput,
};
pub use feature_store::{AppendOutcome, FeatureRecord, FeatureStore, InMemoryFeatureStore};
pub use graph::{DependencyEdge, DependencyGraph};
pub use policy::{FailurePolicy, RetryPolicy, TerminalAction};
